//! Protocol types for worker communication.
//!
//! In-process contexts exchange [`WorkerRequest`] and [`WorkerResponse`]
//! directly. Stream contexts (child processes) speak NDJSON using the
//! `Wire*` mirrors defined at the bottom of this module.

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

use crate::codec::TransportError;
use crate::module::CompiledModule;

// ============================================================================
// Methods
// ============================================================================

/// Operations exposed by a verification worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    /// `compileModule(source)`
    #[serde(rename = "compileModule")]
    CompileModule,
    /// `getReport(module, asset, mimeType)`
    #[serde(rename = "getReport")]
    GetReport,
    /// `getReportFromAssetAndManifestBuffer(module, manifest, asset, mimeType)`
    #[serde(rename = "getReportFromAssetAndManifestBuffer")]
    GetReportFromBuffer,
    /// `scanInput(module, data)`
    #[serde(rename = "scanInput")]
    ScanInput,
}

impl Method {
    /// Wire name of the method.
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::CompileModule => "compileModule",
            Method::GetReport => "getReport",
            Method::GetReportFromBuffer => "getReportFromAssetAndManifestBuffer",
            Method::ScanInput => "scanInput",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Request/Response
// ============================================================================

/// A value passed to or returned from a worker.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Null,
    Json(serde_json::Value),
    Text(String),
    /// Raw bytes. Cloning shares the buffer.
    Bytes(Bytes),
    Module(CompiledModule),
}

impl Payload {
    pub fn type_name(&self) -> &'static str {
        match self {
            Payload::Null => "null",
            Payload::Json(_) => "json",
            Payload::Text(_) => "text",
            Payload::Bytes(_) => "bytes",
            Payload::Module(_) => "module",
        }
    }
}

/// One call to a worker.
///
/// Requests are immutable once built; buffers moved in are owned by the
/// request until a channel hands them to its context.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerRequest {
    method: Method,
    args: Vec<Payload>,
}

impl WorkerRequest {
    pub fn new(method: Method, args: Vec<Payload>) -> Self {
        Self { method, args }
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn args(&self) -> &[Payload] {
        &self.args
    }

    /// Split into method and arguments, giving up the request.
    pub fn into_parts(self) -> (Method, Vec<Payload>) {
        (self.method, self.args)
    }
}

/// The reply to exactly one [`WorkerRequest`].
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerResponse {
    Success { data: Payload },
    Error { error: TransportError },
}

// ============================================================================
// Wire format (NDJSON)
// ============================================================================

/// Bytes encoded as a base64 string on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Base64(pub Bytes);

impl Serialize for Base64 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for Base64 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(|decoded| Base64(Bytes::from(decoded)))
            .map_err(de::Error::custom)
    }
}

/// Reference to a compiled module on the wire.
///
/// `source` is sent only the first time a digest crosses a stream; the
/// worker side keeps compiled modules keyed by digest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleRef {
    pub digest: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Base64>,
}

/// A [`Payload`] as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireValue {
    Null,
    Json(serde_json::Value),
    Text(String),
    Bytes(Base64),
    Module(ModuleRef),
}

/// Request line sent to a worker process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireRequest {
    pub method: Method,
    pub args: Vec<WireValue>,
}

/// Response line received from a worker process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WireResponse {
    Success { data: WireValue },
    Error { error: TransportError },
}

impl WireValue {
    /// Convert a payload; modules need per-stream bookkeeping and are
    /// mapped by `module`.
    pub fn from_payload(
        payload: Payload,
        module: impl FnOnce(CompiledModule) -> ModuleRef,
    ) -> Self {
        match payload {
            Payload::Null => WireValue::Null,
            Payload::Json(value) => WireValue::Json(value),
            Payload::Text(text) => WireValue::Text(text),
            Payload::Bytes(bytes) => WireValue::Bytes(Base64(bytes)),
            Payload::Module(compiled) => WireValue::Module(module(compiled)),
        }
    }
}
