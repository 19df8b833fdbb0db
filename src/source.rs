//! Asset acquisition: turn a caller's input into bytes plus a MIME type.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use crate::error::Error;
use crate::fetch::HttpFetch;

/// MIME type used when nothing better is known.
pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// What the caller wants read.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceInput {
    /// Bytes already in memory.
    Bytes { data: Bytes, mime_type: String },
    /// An asset to download.
    Url(String),
    /// A local file.
    File(PathBuf),
}

impl SourceInput {
    pub fn bytes(data: impl Into<Bytes>, mime_type: impl Into<String>) -> Self {
        Self::Bytes {
            data: data.into(),
            mime_type: mime_type.into(),
        }
    }
}

impl From<&str> for SourceInput {
    fn from(url: &str) -> Self {
        Self::Url(url.to_string())
    }
}

impl From<PathBuf> for SourceInput {
    fn from(path: PathBuf) -> Self {
        Self::File(path)
    }
}

/// A resolved asset.
///
/// A source without content is still a valid source; `unavailable_reason`
/// says why nothing could be read.
#[derive(Clone, PartialEq)]
pub struct Source {
    data: Option<Bytes>,
    mime_type: String,
    url: Option<String>,
    filename: Option<String>,
    unavailable: Option<Error>,
}

impl Source {
    fn available(
        data: Bytes,
        mime_type: String,
        url: Option<String>,
        filename: Option<String>,
    ) -> Self {
        if data.is_empty() {
            return Self::unavailable(
                Error::SourceUnavailable("asset is empty".to_string()),
                mime_type,
                url,
                filename,
            );
        }
        Self {
            data: Some(data),
            mime_type,
            url,
            filename,
            unavailable: None,
        }
    }

    fn unavailable(
        reason: Error,
        mime_type: String,
        url: Option<String>,
        filename: Option<String>,
    ) -> Self {
        Self {
            data: None,
            mime_type,
            url,
            filename,
            unavailable: Some(reason),
        }
    }

    /// Asset content, if it could be obtained.
    pub fn bytes(&self) -> Option<&Bytes> {
        self.data.as_ref()
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    pub fn filename(&self) -> Option<&str> {
        self.filename.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.data.as_ref().map_or(true, Bytes::is_empty)
    }

    /// Why the content could not be read, as an [`Error::SourceUnavailable`].
    pub fn unavailable_reason(&self) -> Option<&Error> {
        self.unavailable.as_ref()
    }
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Source")
            .field("len", &self.data.as_ref().map(Bytes::len))
            .field("mime_type", &self.mime_type)
            .field("url", &self.url)
            .field("filename", &self.filename)
            .field("unavailable", &self.unavailable)
            .finish()
    }
}

/// Resolves [`SourceInput`]s. Never fails; problems are recorded on the
/// returned [`Source`].
#[derive(Clone)]
pub struct SourceResolver {
    fetcher: Arc<dyn HttpFetch>,
}

impl SourceResolver {
    pub fn new(fetcher: Arc<dyn HttpFetch>) -> Self {
        Self { fetcher }
    }

    pub async fn resolve(&self, input: SourceInput) -> Source {
        match input {
            SourceInput::Bytes { data, mime_type } => {
                Source::available(data, mime_type, None, None)
            }
            SourceInput::Url(url) => self.resolve_url(url).await,
            SourceInput::File(path) => resolve_file(&path).await,
        }
    }

    async fn resolve_url(&self, url: String) -> Source {
        let path = url_path(&url);
        let filename = file_name(Path::new(&path));
        let guessed = guess_mime_type(&path);

        match self.fetcher.get(&url).await {
            Ok(body) => {
                let mime_type = body.mime_type().map(str::to_string).unwrap_or(guessed);
                debug!(%url, bytes = body.bytes.len(), %mime_type, "fetched asset");
                Source::available(body.bytes, mime_type, Some(url), filename)
            }
            Err(e) => {
                debug!(%url, error = %e, "asset unavailable");
                let reason =
                    Error::SourceUnavailable(format!("failed to fetch {url}: {}", e.message()));
                Source::unavailable(reason, guessed, Some(url), filename)
            }
        }
    }
}

impl fmt::Debug for SourceResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceResolver").finish_non_exhaustive()
    }
}

async fn resolve_file(path: &Path) -> Source {
    let mime_type = guess_mime_type(&path.to_string_lossy());
    let filename = file_name(path);

    match tokio::fs::read(path).await {
        Ok(data) => Source::available(Bytes::from(data), mime_type, None, filename),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "asset unavailable");
            let reason =
                Error::SourceUnavailable(format!("failed to read {}: {e}", path.display()));
            Source::unavailable(reason, mime_type, None, filename)
        }
    }
}

/// The path component of `url`, or the whole string if it does not parse.
fn url_path(url: &str) -> String {
    reqwest::Url::parse(url)
        .map(|parsed| parsed.path().to_string())
        .unwrap_or_else(|_| url.to_string())
}

fn file_name(path: &Path) -> Option<String> {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .filter(|name| !name.is_empty())
}

fn guess_mime_type(path: &str) -> String {
    mime_guess::from_path(path)
        .first_raw()
        .unwrap_or(DEFAULT_MIME_TYPE)
        .to_string()
}
