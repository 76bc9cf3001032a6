//! `<link>` resource hints for document heads.

use std::collections::HashSet;
use std::fmt;

use serde::Serialize;
use url::Url;

use super::queue::AssetKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkRel {
    Preload,
    Preconnect,
}

impl LinkRel {
    fn as_str(self) -> &'static str {
        match self {
            Self::Preload => "preload",
            Self::Preconnect => "preconnect",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreloadLink {
    pub rel: LinkRel,
    pub href: String,
    #[serde(rename = "as", skip_serializing_if = "Option::is_none")]
    pub destination: Option<&'static str>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    pub crossorigin: bool,
}

impl PreloadLink {
    /// Preload hint for an asset of `kind`.
    pub fn preload(href: &str, kind: AssetKind) -> Self {
        let destination = match kind {
            AssetKind::Texture => "image",
            AssetKind::Model | AssetKind::Draco | AssetKind::Generic => "fetch",
        };
        Self {
            rel: LinkRel::Preload,
            href: href.to_string(),
            destination: Some(destination),
            mime_type: mime_type_of(href),
            crossorigin: destination == "fetch",
        }
    }

    pub fn preconnect(origin: &str) -> Self {
        Self {
            rel: LinkRel::Preconnect,
            href: origin.to_string(),
            destination: None,
            mime_type: None,
            crossorigin: true,
        }
    }
}

impl fmt::Display for PreloadLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            r#"<link rel="{}" href="{}""#,
            self.rel.as_str(),
            escape_attr(&self.href)
        )?;
        if let Some(destination) = self.destination {
            write!(f, r#" as="{destination}""#)?;
        }
        if let Some(mime_type) = &self.mime_type {
            write!(f, r#" type="{}""#, escape_attr(mime_type))?;
        }
        if self.crossorigin {
            f.write_str(" crossorigin")?;
        }
        f.write_str(">")
    }
}

/// One preconnect hint per distinct origin, in first-seen order.
pub fn preconnect_links<'a>(urls: impl IntoIterator<Item = &'a str>) -> Vec<PreloadLink> {
    let mut seen = HashSet::new();
    urls.into_iter()
        .filter_map(|raw| Url::parse(raw).ok())
        .map(|url| url.origin())
        .filter(|origin| origin.is_tuple())
        .map(|origin| origin.ascii_serialization())
        .filter(|origin| seen.insert(origin.clone()))
        .map(|origin| PreloadLink::preconnect(&origin))
        .collect()
}

fn mime_type_of(href: &str) -> Option<String> {
    let path = Url::parse(href)
        .map(|url| url.path().to_string())
        .unwrap_or_else(|_| href.to_string());
    match path.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase()) {
        Some(ext) if ext == "glb" => Some("model/gltf-binary".to_string()),
        Some(ext) if ext == "gltf" => Some("model/gltf+json".to_string()),
        _ => mime_guess::from_path(&path)
            .first_raw()
            .map(str::to_string),
    }
}

fn escape_attr(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
}
