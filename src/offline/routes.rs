//! Request routing for the offline controller.
//!
//! Routing is an ordered list of named rules; the first rule whose predicate
//! matches decides the strategy. Order is significant: the API and admin
//! bypasses must run before the asset rules, and the HTML rule must run
//! before the catch-all.

use axum::http::Method;
use url::{Origin, Url};

use crate::net::FetchRequest;

use super::partition::PartitionKind;

const STATIC_EXTENSIONS: [&str; 10] = [
    "js", "css", "png", "jpg", "jpeg", "gif", "svg", "ico", "woff", "woff2",
];
const STATIC_PREFIXES: [&str; 3] = ["/icons/", "/images/", "/textures/"];
const MODEL_EXTENSIONS: [&str; 2] = ["glb", "gltf"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BypassReason {
    NonGet,
    CrossOrigin,
    Api,
    Admin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Not handled; the host performs the request natively.
    Bypass(BypassReason),
    /// Network-first for `/kavita/<slug>` with a poem-specific offline page.
    Poem,
    /// Network-first for `/api/poems/*` with a JSON offline reply.
    PoemApi,
    CacheFirst(PartitionKind),
    NetworkFirst(PartitionKind),
    StaleWhileRevalidate(PartitionKind),
}

/// What a rule predicate can look at.
pub struct RouteInput<'a> {
    pub request: &'a FetchRequest,
    pub same_origin: bool,
}

impl RouteInput<'_> {
    fn path(&self) -> &str {
        self.request.path()
    }
}

struct Rule {
    name: &'static str,
    matches: fn(&RouteInput<'_>) -> bool,
    route: Route,
}

pub struct RouteTable {
    origin: Origin,
    rules: Vec<Rule>,
}

impl RouteTable {
    pub fn new(origin: &Url) -> Self {
        Self {
            origin: origin.origin(),
            rules: default_rules(),
        }
    }

    pub fn resolve(&self, request: &FetchRequest) -> Route {
        self.resolve_named(request).1
    }

    /// Resolve and also report which rule matched.
    pub fn resolve_named(&self, request: &FetchRequest) -> (&'static str, Route) {
        let input = RouteInput {
            request,
            same_origin: request.url.origin() == self.origin,
        };
        self.rules
            .iter()
            .find(|rule| (rule.matches)(&input))
            .map_or(("fallback", Route::StaleWhileRevalidate(PartitionKind::Dynamic)), |rule| {
                (rule.name, rule.route)
            })
    }

    pub fn rule_names(&self) -> Vec<&'static str> {
        self.rules.iter().map(|rule| rule.name).collect()
    }
}

fn default_rules() -> Vec<Rule> {
    vec![
        Rule {
            name: "non-get",
            matches: |input| input.request.method != Method::GET,
            route: Route::Bypass(BypassReason::NonGet),
        },
        Rule {
            name: "cross-origin",
            matches: |input| !input.same_origin,
            route: Route::Bypass(BypassReason::CrossOrigin),
        },
        Rule {
            name: "api",
            matches: |input| input.path().starts_with("/api/") && !input.path().contains("/poems/"),
            route: Route::Bypass(BypassReason::Api),
        },
        Rule {
            name: "admin",
            matches: |input| input.path().starts_with("/admin"),
            route: Route::Bypass(BypassReason::Admin),
        },
        Rule {
            name: "poem-page",
            matches: |input| poem_slug(input.path()).is_some(),
            route: Route::Poem,
        },
        Rule {
            name: "poem-api",
            matches: |input| input.path().starts_with("/api/poems/"),
            route: Route::PoemApi,
        },
        Rule {
            name: "three",
            matches: |input| input.path().starts_with("/draco/") || input.path().contains("three"),
            route: Route::CacheFirst(PartitionKind::Three),
        },
        Rule {
            name: "model",
            matches: |input| {
                input.path().starts_with("/models/")
                    && extension(input.path())
                        .is_some_and(|ext| MODEL_EXTENSIONS.contains(&ext.as_str()))
            },
            route: Route::CacheFirst(PartitionKind::Models),
        },
        Rule {
            name: "texture",
            matches: |input| input.path().starts_with("/textures/"),
            route: Route::StaleWhileRevalidate(PartitionKind::Static),
        },
        Rule {
            name: "static-asset",
            matches: |input| is_static_asset(input.path()),
            route: Route::CacheFirst(PartitionKind::Static),
        },
        Rule {
            name: "html",
            matches: |input| input.request.accepts("text/html"),
            route: Route::NetworkFirst(PartitionKind::Dynamic),
        },
        Rule {
            name: "fallback",
            matches: |_| true,
            route: Route::StaleWhileRevalidate(PartitionKind::Dynamic),
        },
    ]
}

/// Slug of a `/kavita/<slug>` poem page.
pub fn poem_slug(path: &str) -> Option<&str> {
    let slug = path.strip_prefix("/kavita/")?.trim_end_matches('/');
    (!slug.is_empty() && !slug.contains('/')).then_some(slug)
}

/// Whether `path` is a poem like endpoint, `/api/poems/<id>/like`.
pub fn is_like_path(path: &str) -> bool {
    path.strip_prefix("/api/poems/")
        .and_then(|rest| rest.strip_suffix("/like"))
        .is_some_and(|id| !id.is_empty() && !id.contains('/'))
}

fn extension(path: &str) -> Option<String> {
    let file = path.rsplit('/').next()?;
    let (_, ext) = file.rsplit_once('.')?;
    Some(ext.to_ascii_lowercase())
}

fn is_static_asset(path: &str) -> bool {
    STATIC_PREFIXES.iter().any(|prefix| path.starts_with(prefix))
        || extension(path).is_some_and(|ext| STATIC_EXTENSIONS.contains(&ext.as_str()))
}

#[cfg(test)]
mod tests {
    use axum::http::{HeaderValue, header};

    use super::*;

    fn table() -> RouteTable {
        RouteTable::new(&Url::parse("https://amanakshar.in").expect("origin"))
    }

    fn get(path: &str) -> FetchRequest {
        FetchRequest::get(
            Url::parse("https://amanakshar.in")
                .and_then(|base| base.join(path))
                .expect("url"),
        )
    }

    #[test]
    fn non_get_requests_bypass_even_for_poem_pages() {
        let mut request = get("/kavita/barish");
        request.method = Method::POST;
        assert_eq!(table().resolve(&request), Route::Bypass(BypassReason::NonGet));
    }

    #[test]
    fn cross_origin_requests_bypass() {
        let request =
            FetchRequest::get(Url::parse("https://fonts.gstatic.com/s/a.woff2").expect("url"));
        assert_eq!(table().resolve(&request), Route::Bypass(BypassReason::CrossOrigin));
    }

    #[test]
    fn api_requests_bypass_except_poems() {
        assert_eq!(table().resolve(&get("/api/likes")), Route::Bypass(BypassReason::Api));
        assert_eq!(table().resolve(&get("/api/poems/featured")), Route::PoemApi);
    }

    #[test]
    fn admin_requests_bypass() {
        assert_eq!(table().resolve(&get("/admin")), Route::Bypass(BypassReason::Admin));
        assert_eq!(table().resolve(&get("/admin/poems/new")), Route::Bypass(BypassReason::Admin));
    }

    #[test]
    fn poem_pages_use_poem_strategy() {
        assert_eq!(table().resolve(&get("/kavita/barish")), Route::Poem);
        assert_eq!(table().resolve(&get("/kavita/barish/")), Route::Poem);
        assert_ne!(table().resolve(&get("/kavita")), Route::Poem);
    }

    #[test]
    fn three_and_draco_assets_use_three_partition() {
        assert_eq!(
            table().resolve(&get("/draco/draco_decoder.wasm")),
            Route::CacheFirst(PartitionKind::Three)
        );
        assert_eq!(
            table().resolve(&get("/_next/static/chunks/three-abc.js")),
            Route::CacheFirst(PartitionKind::Three)
        );
    }

    #[test]
    fn models_use_model_partition_only_for_gltf() {
        assert_eq!(
            table().resolve(&get("/models/quill.glb")),
            Route::CacheFirst(PartitionKind::Models)
        );
        assert_eq!(
            table().resolve(&get("/models/readme.txt")),
            Route::StaleWhileRevalidate(PartitionKind::Dynamic)
        );
    }

    #[test]
    fn textures_are_revalidated_in_static_partition() {
        assert_eq!(
            table().resolve(&get("/textures/paper.jpg")),
            Route::StaleWhileRevalidate(PartitionKind::Static)
        );
    }

    #[test]
    fn static_assets_match_by_extension_or_prefix() {
        for path in ["/styles/site.CSS", "/icons/icon-192", "/images/cover"] {
            assert_eq!(table().resolve(&get(path)), Route::CacheFirst(PartitionKind::Static));
        }
    }

    #[test]
    fn html_navigation_is_network_first() {
        let request = get("/pustakein").with_header(
            header::ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml"),
        );
        assert_eq!(table().resolve(&request), Route::NetworkFirst(PartitionKind::Dynamic));
    }

    #[test]
    fn everything_else_falls_back_to_revalidation() {
        let (name, route) = table().resolve_named(&get("/manifest.webmanifest"));
        assert_eq!(name, "fallback");
        assert_eq!(route, Route::StaleWhileRevalidate(PartitionKind::Dynamic));
    }

    #[test]
    fn rule_order_is_stable() {
        assert_eq!(
            table().rule_names(),
            vec![
                "non-get",
                "cross-origin",
                "api",
                "admin",
                "poem-page",
                "poem-api",
                "three",
                "model",
                "texture",
                "static-asset",
                "html",
                "fallback",
            ]
        );
    }

    #[test]
    fn like_paths_need_exactly_one_id_segment() {
        assert!(is_like_path("/api/poems/42/like"));
        assert!(!is_like_path("/api/poems//like"));
        assert!(!is_like_path("/api/poems/42/comments/like"));
        assert!(!is_like_path("/api/poems/featured"));
    }

    #[test]
    fn poem_slug_rejects_nested_paths() {
        assert_eq!(poem_slug("/kavita/ek-din"), Some("ek-din"));
        assert_eq!(poem_slug("/kavita/ek-din/comments"), None);
        assert_eq!(poem_slug("/kavita/"), None);
    }
}
