use async_trait::async_trait;
use axum::http::StatusCode;
use bytes::Bytes;
use thiserror::Error;
use tracing::debug;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Failure classes of an origin fetch.  Non-2xx responses are not errors;
/// they are returned with their status so the TTL policy can decide whether
/// to cache them.
#[derive(Debug, Error)]
pub enum OriginError {
    /// Connect/read timeout, DNS failure, connection reset.
    #[error("origin transport error: {0}")]
    Transport(#[source] reqwest::Error),
    /// The request could not be constructed (e.g. invalid URL).
    #[error("origin request error: {0}")]
    Http(String),
    /// The response declared JSON but the body does not parse.
    #[error("origin response is not valid JSON: {0}")]
    Decode(#[from] serde_json::Error),
}

impl OriginError {
    /// Stable label for the origin-error metric.
    pub fn kind(&self) -> &'static str {
        match self {
            OriginError::Transport(_) => "transport",
            OriginError::Http(_) => "http",
            OriginError::Decode(_) => "decode",
        }
    }
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

/// A fully buffered origin response.
#[derive(Debug, Clone)]
pub struct OriginResponse {
    pub status: StatusCode,
    /// `Content-Type` captured verbatim; `application/octet-stream` when the
    /// origin sent none.
    pub content_type: String,
    pub body: Bytes,
}

impl OriginResponse {
    /// Whether the declared media type is a JSON type
    /// (`application/json` or `application/*+json`).
    pub fn is_json(&self) -> bool {
        let media = self
            .content_type
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();
        media == "application/json"
            || (media.starts_with("application/") && media.ends_with("+json"))
    }

    pub fn decode_json(&self) -> Result<serde_json::Value, OriginError> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Abstraction over the upstream origin, chosen at construction so tests
/// can substitute a scripted origin.
#[async_trait]
pub trait Origin: Send + Sync {
    /// GET `path_query` (path plus original query string) from the origin.
    async fn fetch(&self, path_query: &str) -> Result<OriginResponse, OriginError>;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

/// Production origin client over a shared, pooled [`reqwest::Client`].
pub struct HttpOrigin {
    client: reqwest::Client,
    base_url: String,
}

impl HttpOrigin {
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl Origin for HttpOrigin {
    async fn fetch(&self, path_query: &str) -> Result<OriginResponse, OriginError> {
        let raw = format!("{}/{}", self.base_url, path_query.trim_start_matches('/'));
        let url = reqwest::Url::parse(&raw).map_err(|e| OriginError::Http(e.to_string()))?;

        debug!(%url, "fetching from origin");
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(OriginError::Transport)?;

        let status = response.status();
        let content_type = response
            .headers()
            .get(axum::http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();

        let body = response.bytes().await.map_err(OriginError::Transport)?;

        Ok(OriginResponse {
            status,
            content_type,
            body,
        })
    }
}
