//! HTTP access for assets, verification modules and remote manifests.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::CONTENT_TYPE;

use crate::error::{Error, Result};

/// A downloaded response body.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedBody {
    /// Response bytes.
    pub bytes: Bytes,
    /// Raw `Content-Type` header, if the server sent one.
    pub content_type: Option<String>,
}

impl FetchedBody {
    pub fn new(bytes: impl Into<Bytes>, content_type: Option<&str>) -> Self {
        Self {
            bytes: bytes.into(),
            content_type: content_type.map(str::to_string),
        }
    }

    /// The MIME type without parameters (`image/jpeg; q=1` -> `image/jpeg`).
    pub fn mime_type(&self) -> Option<&str> {
        self.content_type
            .as_deref()
            .and_then(|value| value.split(';').next())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }
}

/// Plain HTTP GET.
///
/// The reader only ever needs whole-body GETs; implementations other than
/// [`HttpClient`] exist mainly for tests and embedding applications that
/// already own an HTTP stack.
#[async_trait]
pub trait HttpFetch: Send + Sync {
    /// Fetch `url`, failing with [`Error::Fetch`] on transport errors and
    /// non-success statuses.
    async fn get(&self, url: &str) -> Result<FetchedBody>;
}

/// [`HttpFetch`] over a shared `reqwest` client.
#[derive(Debug, Clone, Default)]
pub struct HttpClient {
    client: reqwest::Client,
}

impl HttpClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a client with a total request timeout.
    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Fetch {
                url: String::new(),
                status: None,
                message: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpFetch for HttpClient {
    async fn get(&self, url: &str) -> Result<FetchedBody> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| transport_error(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Fetch {
                url: url.to_string(),
                status: Some(status.as_u16()),
                message: format!("HTTP {status}"),
            });
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let bytes = response.bytes().await.map_err(|e| transport_error(url, e))?;

        Ok(FetchedBody { bytes, content_type })
    }
}

fn transport_error(url: &str, error: reqwest::Error) -> Error {
    Error::Fetch {
        url: url.to_string(),
        status: error.status().map(|status| status.as_u16()),
        message: error.to_string(),
    }
}
