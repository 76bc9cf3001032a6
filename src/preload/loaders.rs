//! Per-kind asset loaders.

use std::sync::Arc;

use axum::http::{HeaderName, HeaderValue, header};
use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::net::{FetchRequest, Network};

use super::hints::PreloadLink;
use super::queue::AssetKind;

pub const DRACO_DECODER_FILES: [&str; 2] = ["draco_decoder.wasm", "draco_wasm_wrapper.js"];

const TEXTURE_REWRITE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

/// Failure of one preload. `Clone` because every waiter on the same URL
/// receives it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PreloadError {
    #[error("invalid asset url `{0}`")]
    InvalidUrl(String),
    #[error("network error loading {url}: {message}")]
    Network { url: String, message: String },
    #[error("{url} answered {status}")]
    Status { url: String, status: u16 },
    #[error("cannot decode image {url}: {message}")]
    Decode { url: String, message: String },
    #[error("load of {0} was dropped before it finished")]
    Dropped(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Texture {
    /// URL actually loaded, after format negotiation.
    pub url: String,
    pub width: usize,
    pub height: usize,
    #[serde(skip)]
    pub bytes: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Asset {
    Model(Bytes),
    Texture(Texture),
    /// Decoder hints; nothing is fetched.
    Draco(Vec<PreloadLink>),
    Generic {
        bytes: Bytes,
        content_type: Option<String>,
    },
}

impl Asset {
    pub fn kind(&self) -> AssetKind {
        match self {
            Self::Model(_) => AssetKind::Model,
            Self::Texture(_) => AssetKind::Texture,
            Self::Draco(_) => AssetKind::Draco,
            Self::Generic { .. } => AssetKind::Generic,
        }
    }

    /// Bytes held in memory for this asset.
    pub fn size(&self) -> usize {
        match self {
            Self::Model(bytes) | Self::Generic { bytes, .. } => bytes.len(),
            Self::Texture(texture) => texture.bytes.len(),
            Self::Draco(_) => 0,
        }
    }
}

/// Image formats the client can decode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FormatSupport {
    pub avif: bool,
    pub webp: bool,
}

impl FormatSupport {
    /// Read support from an `Accept`-style list such as
    /// `image/avif,image/webp,*/*`.
    pub fn from_accept(accept: &str) -> Self {
        let mut support = Self::default();
        for media in accept.split(',') {
            let media = media.split(';').next().unwrap_or_default().trim();
            if media.eq_ignore_ascii_case("image/avif") {
                support.avif = true;
            } else if media.eq_ignore_ascii_case("image/webp") {
                support.webp = true;
            }
        }
        support
    }

    /// Best modern variant of a png/jpeg texture URL, if any is supported.
    pub fn negotiate(&self, url: &Url) -> Option<Url> {
        let target = if self.avif {
            "avif"
        } else if self.webp {
            "webp"
        } else {
            return None;
        };
        let path = url.path();
        let (stem, ext) = path.rsplit_once('.')?;
        if stem.ends_with('/')
            || !TEXTURE_REWRITE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str())
        {
            return None;
        }
        let mut rewritten = url.clone();
        rewritten.set_path(&format!("{stem}.{target}"));
        Some(rewritten)
    }
}

pub(crate) struct Loaders {
    network: Arc<dyn Network>,
    formats: FormatSupport,
}

impl Loaders {
    pub(crate) fn new(network: Arc<dyn Network>, formats: FormatSupport) -> Self {
        Self { network, formats }
    }

    pub(crate) async fn load(&self, url: &Url, kind: AssetKind) -> Result<Asset, PreloadError> {
        match kind {
            AssetKind::Model => self.load_model(url).await,
            AssetKind::Texture => self.load_texture(url).await,
            AssetKind::Draco => draco_links(url).map(Asset::Draco),
            AssetKind::Generic => self.load_generic(url).await,
        }
    }

    async fn load_model(&self, url: &Url) -> Result<Asset, PreloadError> {
        let request = FetchRequest::get(url.clone()).with_header(
            HeaderName::from_static("priority"),
            HeaderValue::from_static("u=1"),
        );
        let (bytes, _) = self.fetch_bytes(request).await?;
        Ok(Asset::Model(bytes))
    }

    async fn load_texture(&self, url: &Url) -> Result<Asset, PreloadError> {
        if let Some(variant) = self.formats.negotiate(url) {
            match self.load_image(&variant).await {
                Ok(texture) => return Ok(Asset::Texture(texture)),
                Err(err) => {
                    debug!(%variant, error = %err, "negotiated texture failed, using original")
                }
            }
        }
        self.load_image(url).await.map(Asset::Texture)
    }

    async fn load_image(&self, url: &Url) -> Result<Texture, PreloadError> {
        let (bytes, _) = self.fetch_bytes(FetchRequest::get(url.clone())).await?;
        let size = imagesize::blob_size(&bytes).map_err(|err| PreloadError::Decode {
            url: url.to_string(),
            message: err.to_string(),
        })?;
        Ok(Texture {
            url: url.to_string(),
            width: size.width,
            height: size.height,
            bytes,
        })
    }

    async fn load_generic(&self, url: &Url) -> Result<Asset, PreloadError> {
        let (bytes, content_type) = self.fetch_bytes(FetchRequest::get(url.clone())).await?;
        Ok(Asset::Generic {
            bytes,
            content_type,
        })
    }

    async fn fetch_bytes(
        &self,
        request: FetchRequest,
    ) -> Result<(Bytes, Option<String>), PreloadError> {
        let response = self
            .network
            .fetch(&request)
            .await
            .map_err(|err| PreloadError::Network {
                url: request.url.to_string(),
                message: err.to_string(),
            })?;
        if !response.ok() {
            return Err(PreloadError::Status {
                url: request.url.to_string(),
                status: response.status.as_u16(),
            });
        }
        let content_type = response
            .headers
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        Ok((response.body, content_type))
    }
}

/// Preload hints for the Draco decoder files under `base`.
pub fn draco_links(base: &Url) -> Result<Vec<PreloadLink>, PreloadError> {
    let mut directory = base.clone();
    if !directory.path().ends_with('/') {
        let path = format!("{}/", directory.path());
        directory.set_path(&path);
    }
    DRACO_DECODER_FILES
        .iter()
        .map(|file| {
            directory
                .join(file)
                .map(|url| PreloadLink::preload(url.as_str(), AssetKind::Draco))
                .map_err(|_| PreloadError::InvalidUrl(format!("{directory}{file}")))
        })
        .collect()
}
