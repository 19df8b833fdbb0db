//! Error taxonomy shared by the pool, the workers and the reader.

use std::fmt;

use serde_json::{Map, Value};
use thiserror::Error;

/// Result type for reader and worker operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while reading provenance.
///
/// Every variant carries the message it was created with so a value can
/// cross the worker boundary through [`crate::codec`] and come back intact.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// The asset bytes could not be obtained.
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    /// The verification module could not be downloaded.
    #[error("failed to fetch verification module from {url}: {message}")]
    ModuleFetch {
        /// Location the module was requested from.
        url: String,
        /// Failure description.
        message: String,
    },

    /// The verification module binary was rejected by the engine.
    #[error("failed to compile verification module: {0}")]
    ModuleCompile(String),

    /// A channel was asked to run a second request concurrently.
    #[error("worker channel busy: {0}")]
    ChannelBusy(String),

    /// The worker context was terminated.
    #[error("worker terminated: {0}")]
    WorkerTerminated(String),

    /// The worker context died while a request was in flight.
    #[error("worker crashed: {0}")]
    WorkerCrashed(String),

    /// The worker pool has been disposed.
    #[error("worker pool disposed: {0}")]
    PoolDisposed(String),

    /// The asset carries no provenance data.
    #[error("no provenance data found: {0}")]
    ProvenanceMissing(String),

    /// The engine does not recognize the asset container.
    #[error("container format not recognized: {0}")]
    ContainerFormatNotRecognized(String),

    /// The manifest is not embedded but referenced by URL.
    #[error("manifest is stored remotely: {message}")]
    RemoteManifestPointer {
        /// Remote manifest location, when the engine provided one.
        url: Option<String>,
        /// Failure description.
        message: String,
    },

    /// An HTTP request failed.
    #[error("request to {url} failed: {message}")]
    Fetch {
        /// Requested location.
        url: String,
        /// HTTP status code, if a response arrived.
        status: Option<u16>,
        /// Failure description.
        message: String,
    },

    /// The configured worker executable cannot be used.
    #[error("invalid worker source: {0}")]
    InvalidWorkerSource(String),

    /// A worker received arguments that do not fit the method.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The engine returned a report that is not a manifest store.
    #[error("invalid report: {0}")]
    InvalidReport(String),

    /// Any error the codec could not classify.
    #[error("{kind}: {message}")]
    Unknown {
        /// Kind name as reported by the worker.
        kind: String,
        /// Failure description.
        message: String,
        /// Structured fields carried alongside the error.
        fields: Map<String, Value>,
    },
}

/// Well-known error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    SourceUnavailable,
    ModuleFetch,
    ModuleCompile,
    ChannelBusy,
    WorkerTerminated,
    WorkerCrashed,
    PoolDisposed,
    ProvenanceMissing,
    ContainerFormatNotRecognized,
    RemoteManifestPointer,
    Fetch,
    InvalidWorkerSource,
    InvalidRequest,
    InvalidReport,
    Unknown,
}

impl ErrorKind {
    /// All kinds with a stable transport name.
    pub const ALL: [ErrorKind; 15] = [
        ErrorKind::SourceUnavailable,
        ErrorKind::ModuleFetch,
        ErrorKind::ModuleCompile,
        ErrorKind::ChannelBusy,
        ErrorKind::WorkerTerminated,
        ErrorKind::WorkerCrashed,
        ErrorKind::PoolDisposed,
        ErrorKind::ProvenanceMissing,
        ErrorKind::ContainerFormatNotRecognized,
        ErrorKind::RemoteManifestPointer,
        ErrorKind::Fetch,
        ErrorKind::InvalidWorkerSource,
        ErrorKind::InvalidRequest,
        ErrorKind::InvalidReport,
        ErrorKind::Unknown,
    ];

    /// The name used for this kind on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::SourceUnavailable => "SourceUnavailable",
            ErrorKind::ModuleFetch => "ModuleFetchError",
            ErrorKind::ModuleCompile => "ModuleCompileError",
            ErrorKind::ChannelBusy => "ChannelBusy",
            ErrorKind::WorkerTerminated => "WorkerTerminated",
            ErrorKind::WorkerCrashed => "WorkerCrashed",
            ErrorKind::PoolDisposed => "PoolDisposed",
            ErrorKind::ProvenanceMissing => "ProvenanceMissing",
            ErrorKind::ContainerFormatNotRecognized => "ContainerFormatNotRecognized",
            ErrorKind::RemoteManifestPointer => "RemoteManifestPointer",
            ErrorKind::Fetch => "FetchError",
            ErrorKind::InvalidWorkerSource => "InvalidWorkerSource",
            ErrorKind::InvalidRequest => "InvalidRequest",
            ErrorKind::InvalidReport => "InvalidReport",
            ErrorKind::Unknown => "Unknown",
        }
    }

    /// Look up a kind by its wire name, accepting the engine's native names.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "Toolkit(RemoteManifestUrl)" => Some(ErrorKind::RemoteManifestPointer),
            "C2pa(ProvenanceMissing)" => Some(ErrorKind::ProvenanceMissing),
            "C2pa(JumbfNotFound)" => Some(ErrorKind::ContainerFormatNotRecognized),
            _ => Self::ALL.into_iter().find(|kind| kind.as_str() == name),
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    /// The kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::SourceUnavailable(_) => ErrorKind::SourceUnavailable,
            Error::ModuleFetch { .. } => ErrorKind::ModuleFetch,
            Error::ModuleCompile(_) => ErrorKind::ModuleCompile,
            Error::ChannelBusy(_) => ErrorKind::ChannelBusy,
            Error::WorkerTerminated(_) => ErrorKind::WorkerTerminated,
            Error::WorkerCrashed(_) => ErrorKind::WorkerCrashed,
            Error::PoolDisposed(_) => ErrorKind::PoolDisposed,
            Error::ProvenanceMissing(_) => ErrorKind::ProvenanceMissing,
            Error::ContainerFormatNotRecognized(_) => ErrorKind::ContainerFormatNotRecognized,
            Error::RemoteManifestPointer { .. } => ErrorKind::RemoteManifestPointer,
            Error::Fetch { .. } => ErrorKind::Fetch,
            Error::InvalidWorkerSource(_) => ErrorKind::InvalidWorkerSource,
            Error::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Error::InvalidReport(_) => ErrorKind::InvalidReport,
            Error::Unknown { .. } => ErrorKind::Unknown,
        }
    }

    /// The message this error was created with, without the kind prefix.
    pub fn message(&self) -> &str {
        match self {
            Error::SourceUnavailable(message)
            | Error::ModuleCompile(message)
            | Error::ChannelBusy(message)
            | Error::WorkerTerminated(message)
            | Error::WorkerCrashed(message)
            | Error::PoolDisposed(message)
            | Error::ProvenanceMissing(message)
            | Error::ContainerFormatNotRecognized(message)
            | Error::InvalidWorkerSource(message)
            | Error::InvalidRequest(message)
            | Error::InvalidReport(message) => message,
            Error::ModuleFetch { message, .. }
            | Error::RemoteManifestPointer { message, .. }
            | Error::Fetch { message, .. }
            | Error::Unknown { message, .. } => message,
        }
    }

    pub(crate) fn pool_disposed() -> Self {
        Self::PoolDisposed("the worker pool has been disposed".to_string())
    }

    pub(crate) fn worker_terminated() -> Self {
        Self::WorkerTerminated("the worker was terminated".to_string())
    }

    /// Check if this error means "no provenance present" rather than a failure.
    pub fn is_no_provenance(&self) -> bool {
        matches!(
            self,
            Self::ProvenanceMissing(_) | Self::ContainerFormatNotRecognized(_)
        )
    }

    /// Check if this error comes from the pool or channel infrastructure.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            Self::ChannelBusy(_)
                | Self::WorkerTerminated(_)
                | Self::WorkerCrashed(_)
                | Self::PoolDisposed(_)
        )
    }
}
