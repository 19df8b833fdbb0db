//! Verification module handles and the load-once module loader.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use sha2::{Digest, Sha256};
use tokio::sync::OnceCell;
use tracing::debug;

use crate::error::{Error, Result};
use crate::fetch::HttpFetch;
use crate::pool::WorkerPool;

/// Compute the SHA256 digest of module source bytes.
///
/// Returns a 64-character lowercase hexadecimal string.
pub fn digest_of(source: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source);
    format!("{:x}", hasher.finalize())
}

/// A compiled verification module.
///
/// The handle is cheap to clone and every clone refers to the same compiled
/// form. `artifact` is whatever the hosting engine produced when compiling;
/// handles that crossed a process boundary carry only digest and source.
#[derive(Clone)]
pub struct CompiledModule {
    inner: Arc<ModuleInner>,
}

struct ModuleInner {
    digest: String,
    source: Bytes,
    artifact: Option<Arc<dyn Any + Send + Sync>>,
}

impl CompiledModule {
    /// Wrap an engine artifact compiled from `source`.
    pub fn new<A: Any + Send + Sync>(source: Bytes, artifact: A) -> Self {
        Self::build(source, Some(Arc::new(artifact)))
    }

    /// A handle without an in-process artifact.
    pub fn detached(source: Bytes) -> Self {
        Self::build(source, None)
    }

    fn build(source: Bytes, artifact: Option<Arc<dyn Any + Send + Sync>>) -> Self {
        Self {
            inner: Arc::new(ModuleInner {
                digest: digest_of(&source),
                source,
                artifact,
            }),
        }
    }

    pub fn digest(&self) -> &str {
        &self.inner.digest
    }

    pub fn source(&self) -> &Bytes {
        &self.inner.source
    }

    /// The engine artifact, if this handle carries one of type `A`.
    pub fn artifact<A: Any>(&self) -> Option<&A> {
        self.inner.artifact.as_deref()?.downcast_ref::<A>()
    }

    /// Whether both handles share the same compiled form.
    pub fn ptr_eq(&self, other: &CompiledModule) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl PartialEq for CompiledModule {
    fn eq(&self, other: &Self) -> bool {
        self.inner.digest == other.inner.digest
    }
}

impl fmt::Debug for CompiledModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledModule")
            .field("digest", &self.inner.digest)
            .field("source_len", &self.inner.source.len())
            .field("has_artifact", &self.inner.artifact.is_some())
            .finish()
    }
}

/// Where the verification module comes from.
#[derive(Debug, Clone)]
pub enum ModuleSource {
    /// Download and compile from this URL.
    Url(String),
    /// Use an already compiled handle as-is.
    Compiled(CompiledModule),
}

impl From<CompiledModule> for ModuleSource {
    fn from(module: CompiledModule) -> Self {
        Self::Compiled(module)
    }
}

impl From<&str> for ModuleSource {
    fn from(url: &str) -> Self {
        Self::Url(url.to_string())
    }
}

impl From<String> for ModuleSource {
    fn from(url: String) -> Self {
        Self::Url(url)
    }
}

type LoadCell = Arc<OnceCell<Result<CompiledModule>>>;

/// Fetches and compiles verification modules exactly once per location.
///
/// The outcome of the first load of a URL, success or a fetch or compile
/// failure, is kept for the lifetime of the loader. Callers that arrive
/// while that load is in flight wait on it instead of starting their own.
/// A load that fails because its worker died is not kept.
pub struct ModuleLoader {
    fetcher: Arc<dyn HttpFetch>,
    loads: Mutex<HashMap<String, LoadCell>>,
}

impl ModuleLoader {
    pub fn new(fetcher: Arc<dyn HttpFetch>) -> Self {
        Self {
            fetcher,
            loads: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve `source` to a compiled module, compiling through `pool`.
    ///
    /// # Errors
    ///
    /// - [`Error::ModuleFetch`] if the module cannot be downloaded
    /// - [`Error::ModuleCompile`] if the engine rejects the binary
    /// - pool infrastructure errors unchanged
    pub async fn load(&self, source: &ModuleSource, pool: &WorkerPool) -> Result<CompiledModule> {
        let url = match source {
            ModuleSource::Compiled(module) => return Ok(module.clone()),
            ModuleSource::Url(url) => url,
        };

        let cell = {
            let mut loads = self.loads.lock().unwrap_or_else(PoisonError::into_inner);
            loads.entry(url.clone()).or_default().clone()
        };

        // Infrastructure failures belong to the calling job and leave the
        // cell empty for the next caller
        let outcome = cell
            .get_or_try_init(|| async {
                match self.fetch_and_compile(url, pool).await {
                    Err(e) if e.is_infrastructure() => Err(e),
                    outcome => Ok(outcome),
                }
            })
            .await?;
        outcome.clone()
    }

    async fn fetch_and_compile(&self, url: &str, pool: &WorkerPool) -> Result<CompiledModule> {
        debug!(url, "fetching verification module");

        let body = self.fetcher.get(url).await.map_err(|e| Error::ModuleFetch {
            url: url.to_string(),
            message: e.to_string(),
        })?;

        if body.bytes.is_empty() {
            return Err(Error::ModuleFetch {
                url: url.to_string(),
                message: "response body is empty".to_string(),
            });
        }

        debug!(url, bytes = body.bytes.len(), "compiling verification module");

        match pool.compile_module(body.bytes).await {
            Ok(module) => Ok(module),
            Err(e) if e.is_infrastructure() => Err(e),
            Err(Error::ModuleCompile(message)) => Err(Error::ModuleCompile(message)),
            Err(e) => Err(Error::ModuleCompile(e.to_string())),
        }
    }
}

impl fmt::Debug for ModuleLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let loads = self.loads.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("ModuleLoader")
            .field("locations", &loads.keys().collect::<Vec<_>>())
            .finish()
    }
}
