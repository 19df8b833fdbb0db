//! Error codec for the worker boundary.
//!
//! Errors cannot carry their Rust identity across a thread or process
//! boundary, so they travel as a [`TransportError`]: a kind name, a message
//! and a small map of structured fields. [`encode`] and [`decode`] are
//! inverse for every well-known kind.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, ErrorKind};

const FIELD_URL: &str = "url";
const FIELD_CODE: &str = "code";

/// Transport-safe representation of an [`Error`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportError {
    /// Kind name (see [`ErrorKind::as_str`]).
    pub kind: String,
    /// Human-readable message.
    pub message: String,
    /// Structured fields, e.g. `url` or `code`.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub fields: Map<String, Value>,
}

impl TransportError {
    /// Create a transport error without fields.
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            fields: Map::new(),
        }
    }

    /// Attach a structured field.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    fn str_field(&self, key: &str) -> Option<String> {
        self.fields.get(key).and_then(Value::as_str).map(str::to_string)
    }
}

/// Convert an error into its transport form.
pub fn encode(error: &Error) -> TransportError {
    let message = error.message().to_string();
    match error {
        Error::ModuleFetch { url, .. } => {
            TransportError::new(ErrorKind::ModuleFetch.as_str(), message)
                .with_field(FIELD_URL, url.as_str())
        }
        Error::RemoteManifestPointer { url, .. } => {
            let encoded = TransportError::new(ErrorKind::RemoteManifestPointer.as_str(), message);
            match url {
                Some(url) => encoded.with_field(FIELD_URL, url.as_str()),
                None => encoded,
            }
        }
        Error::Fetch { url, status, .. } => {
            let encoded = TransportError::new(ErrorKind::Fetch.as_str(), message)
                .with_field(FIELD_URL, url.as_str());
            match status {
                Some(code) => encoded.with_field(FIELD_CODE, *code),
                None => encoded,
            }
        }
        Error::Unknown { kind, fields, .. } => TransportError {
            kind: kind.clone(),
            message,
            fields: fields.clone(),
        },
        other => TransportError::new(other.kind().as_str(), message),
    }
}

/// Rebuild an error from its transport form.
///
/// Kinds that are not recognized decode to [`Error::Unknown`], keeping the
/// original kind name, message and fields.
pub fn decode(error: TransportError) -> Error {
    let Some(kind) = ErrorKind::from_name(&error.kind) else {
        return unknown(error);
    };

    match kind {
        ErrorKind::SourceUnavailable => Error::SourceUnavailable(error.message),
        ErrorKind::ModuleFetch => Error::ModuleFetch {
            url: error.str_field(FIELD_URL).unwrap_or_default(),
            message: error.message,
        },
        ErrorKind::ModuleCompile => Error::ModuleCompile(error.message),
        ErrorKind::ChannelBusy => Error::ChannelBusy(error.message),
        ErrorKind::WorkerTerminated => Error::WorkerTerminated(error.message),
        ErrorKind::WorkerCrashed => Error::WorkerCrashed(error.message),
        ErrorKind::PoolDisposed => Error::PoolDisposed(error.message),
        ErrorKind::ProvenanceMissing => Error::ProvenanceMissing(error.message),
        ErrorKind::ContainerFormatNotRecognized => {
            Error::ContainerFormatNotRecognized(error.message)
        }
        ErrorKind::RemoteManifestPointer => Error::RemoteManifestPointer {
            url: error.str_field(FIELD_URL),
            message: error.message,
        },
        ErrorKind::Fetch => Error::Fetch {
            url: error.str_field(FIELD_URL).unwrap_or_default(),
            status: error
                .fields
                .get(FIELD_CODE)
                .and_then(Value::as_u64)
                .and_then(|code| u16::try_from(code).ok()),
            message: error.message,
        },
        ErrorKind::InvalidWorkerSource => Error::InvalidWorkerSource(error.message),
        ErrorKind::InvalidRequest => Error::InvalidRequest(error.message),
        ErrorKind::InvalidReport => Error::InvalidReport(error.message),
        ErrorKind::Unknown => unknown(error),
    }
}

fn unknown(error: TransportError) -> Error {
    Error::Unknown {
        kind: error.kind,
        message: error.message,
        fields: error.fields,
    }
}
