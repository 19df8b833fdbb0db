//! The read pipeline: acquire an asset, verify it on a worker, recover from
//! remote manifest pointers, deliver the manifest store.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::future::join_all;
use tracing::debug;

use crate::config::{Settings, SettingsError};
use crate::error::{Error, Result};
use crate::fetch::{HttpClient, HttpFetch};
use crate::module::{CompiledModule, ModuleLoader, ModuleSource};
use crate::pool::{default_channel_count, ChannelFactory, WorkerPool};
use crate::report::ManifestStore;
use crate::source::{Source, SourceInput, SourceResolver};

const VERIFY_URL: &str = "https://verify.contentauthenticity.org/inspect";

/// Options for [`Reader::new`].
#[derive(Clone)]
pub struct ReaderOptions {
    /// Where the verification module comes from.
    pub module_src: ModuleSource,

    /// Number of workers. Defaults to the CPU count.
    pub channel_count: Option<usize>,

    /// Follow remote manifest pointers reported by the engine.
    pub fetch_remote_manifests: bool,

    /// HTTP client for assets, the module and remote manifests.
    pub fetcher: Option<Arc<dyn HttpFetch>>,
}

impl ReaderOptions {
    pub fn new(module_src: impl Into<ModuleSource>) -> Self {
        Self {
            module_src: module_src.into(),
            channel_count: None,
            fetch_remote_manifests: true,
            fetcher: None,
        }
    }

    pub fn with_channel_count(mut self, channel_count: usize) -> Self {
        self.channel_count = Some(channel_count);
        self
    }

    pub fn with_fetch_remote_manifests(mut self, enabled: bool) -> Self {
        self.fetch_remote_manifests = enabled;
        self
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn HttpFetch>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Build options from the `[module]`, `[worker]`, `[reader]` and
    /// `[downloader]` sections.
    pub fn from_settings(settings: &Settings) -> std::result::Result<Self, SettingsError> {
        let module_src = settings
            .module_src()?
            .ok_or_else(|| SettingsError::InvalidConfig("module.src is required".to_string()))?;

        let fetcher = match settings.download_timeout() {
            Some(timeout) => {
                let client = HttpClient::with_timeout(timeout)
                    .map_err(|e| SettingsError::InvalidConfig(e.to_string()))?;
                Some(Arc::new(client) as Arc<dyn HttpFetch>)
            }
            None => None,
        };

        Ok(Self {
            module_src: ModuleSource::Url(module_src),
            channel_count: Some(settings.channel_count()),
            fetch_remote_manifests: settings.reader.fetch_remote_manifests,
            fetcher,
        })
    }
}

impl fmt::Debug for ReaderOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReaderOptions")
            .field("module_src", &self.module_src)
            .field("channel_count", &self.channel_count)
            .field("fetch_remote_manifests", &self.fetch_remote_manifests)
            .field("fetcher", &self.fetcher.as_ref().map(|_| "dyn HttpFetch"))
            .finish()
    }
}

/// Outcome of one read.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadResult {
    /// `None` when the asset carries no provenance or could not be read.
    pub manifest_store: Option<ManifestStore>,
    pub source: Source,
}

/// A provenance reading pipeline over a pool of workers.
///
/// # Example
///
/// ```ignore
/// use c2pa_reader::{Reader, ReaderOptions, SourceInput, ThreadFactory};
///
/// let reader = Reader::new(
///     ReaderOptions::new("https://cdn.example.com/toolkit_bg.wasm"),
///     &ThreadFactory::new(engine),
/// )?;
///
/// let result = reader.read(SourceInput::Url("https://example.com/a.jpg".into())).await?;
/// if let Some(store) = result.manifest_store {
///     println!("{:?}", store.active().and_then(|m| m.formatted_generator()));
/// }
/// reader.dispose();
/// ```
pub struct Reader {
    pool: WorkerPool,
    loader: ModuleLoader,
    module_src: ModuleSource,
    resolver: SourceResolver,
    fetcher: Arc<dyn HttpFetch>,
    fetch_remote_manifests: bool,
    jobs: AtomicU64,
}

impl Reader {
    /// Create the pipeline and its workers.
    ///
    /// The verification module is loaded on the first read.
    pub fn new(options: ReaderOptions, factory: &dyn ChannelFactory) -> Result<Self> {
        let channel_count = options.channel_count.unwrap_or_else(default_channel_count);
        debug!(?options, channel_count, "creating reader");

        let fetcher = options
            .fetcher
            .unwrap_or_else(|| Arc::new(HttpClient::new()));
        let pool = WorkerPool::new(channel_count, factory)?;

        Ok(Self {
            pool,
            loader: ModuleLoader::new(fetcher.clone()),
            module_src: options.module_src,
            resolver: SourceResolver::new(fetcher.clone()),
            fetcher,
            fetch_remote_manifests: options.fetch_remote_manifests,
            jobs: AtomicU64::new(0),
        })
    }

    /// Read the provenance of one asset.
    ///
    /// An asset without provenance, or one that cannot be obtained, yields a
    /// result with no manifest store.
    ///
    /// # Errors
    ///
    /// - [`Error::PoolDisposed`] after [`dispose`](Self::dispose)
    /// - module load failures
    /// - engine errors other than "no provenance"
    /// - failures while fetching or reading a remote manifest
    pub async fn read(&self, input: SourceInput) -> Result<ReadResult> {
        let job = self.jobs.fetch_add(1, Ordering::Relaxed) + 1;

        if self.pool.is_disposed() {
            return Err(Error::pool_disposed());
        }

        debug!(job, "reading from input");
        let source = self.resolver.resolve(input).await;

        let Some(asset) = source.bytes().cloned() else {
            debug!(job, reason = ?source.unavailable_reason(), "no asset content");
            return Ok(ReadResult {
                manifest_store: None,
                source,
            });
        };

        debug!(job, bytes = asset.len(), mime_type = source.mime_type(), "processing input");
        let module = self.loader.load(&self.module_src, &self.pool).await?;

        let manifest_store = match self
            .pool
            .get_report(module.clone(), asset, source.mime_type())
            .await
        {
            Ok(report) => {
                debug!(job, "received worker result");
                Some(ManifestStore::from_report(report)?)
            }
            Err(e) => self.handle_error(job, e, module).await?,
        };

        Ok(ReadResult {
            manifest_store,
            source,
        })
    }

    async fn handle_error(
        &self,
        job: u64,
        error: Error,
        module: CompiledModule,
    ) -> Result<Option<ManifestStore>> {
        match error {
            Error::RemoteManifestPointer { url: Some(url), .. } if self.fetch_remote_manifests => {
                self.fetch_remote_manifest(job, &url, module).await.map(Some)
            }
            Error::RemoteManifestPointer { .. } => {
                debug!(job, "remote manifest not followed");
                Ok(None)
            }
            e if e.is_no_provenance() => {
                debug!(job, "no provenance data found");
                Ok(None)
            }
            e => Err(e),
        }
    }

    async fn fetch_remote_manifest(
        &self,
        job: u64,
        url: &str,
        module: CompiledModule,
    ) -> Result<ManifestStore> {
        debug!(job, url, "fetching remote manifest");

        let body = self.fetcher.get(url).await?;
        let content_type = body.content_type.unwrap_or_default();
        let report = self.pool.get_report(module, body.bytes, &content_type).await?;

        ManifestStore::from_report(report)
    }

    /// Read several assets concurrently. Entry `i` belongs to input `i`.
    pub async fn read_all(
        &self,
        inputs: impl IntoIterator<Item = SourceInput>,
    ) -> Vec<Result<ReadResult>> {
        join_all(inputs.into_iter().map(|input| self.read(input))).await
    }

    /// Read the provenance of in-memory bytes.
    pub async fn read_bytes(&self, data: impl Into<Bytes>, mime_type: &str) -> Result<ReadResult> {
        self.read(SourceInput::bytes(data, mime_type)).await
    }

    /// Terminate every worker. Later reads fail with [`Error::PoolDisposed`].
    pub fn dispose(&self) {
        self.pool.dispose();
    }

    pub fn is_disposed(&self) -> bool {
        self.pool.is_disposed()
    }
}

impl fmt::Debug for Reader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reader")
            .field("pool", &self.pool)
            .field("module_src", &self.module_src)
            .field("fetch_remote_manifests", &self.fetch_remote_manifests)
            .finish_non_exhaustive()
    }
}

/// Link to the Content Credentials inspector for a public asset URL.
pub fn generate_verify_url(asset_url: &str) -> String {
    let mut url = reqwest::Url::parse(VERIFY_URL).expect("valid verify URL");
    url.query_pairs_mut().append_pair("source", asset_url);
    url.to_string()
}
