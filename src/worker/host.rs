//! Worker-side request handling.
//!
//! A [`WorkerHost`] runs inside an isolated context. It maps each request
//! onto the [`VerificationEngine`] and turns every failure into a
//! [`TransportError`](crate::codec::TransportError) so nothing but plain
//! data crosses back to the pool.
//!
//! A worker executable is just [`serve_stdio`] with an engine:
//!
//! ```ignore
//! #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     c2pa_reader::worker::serve_stdio(Arc::new(MyEngine::default())).await
//! }
//! ```

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tracing::{debug, warn};

use super::protocol::{
    Base64, Method, ModuleRef, Payload, WireRequest, WireResponse, WireValue, WorkerRequest,
    WorkerResponse,
};
use crate::codec;
use crate::error::{Error, Result};
use crate::module::{digest_of, CompiledModule};

/// The opaque verification engine hosted by a worker.
///
/// Engines are synchronous and stateless between calls; the host owns
/// module caching.
pub trait VerificationEngine: Send + Sync {
    /// Compile module source bytes.
    fn compile_module(&self, source: Bytes) -> Result<CompiledModule>;

    /// Produce a report for an asset with an embedded or referenced manifest.
    fn get_report(
        &self,
        module: &CompiledModule,
        asset: &[u8],
        mime_type: &str,
    ) -> Result<serde_json::Value>;

    /// Produce a report from a detached manifest and its asset.
    fn get_report_from_asset_and_manifest_buffer(
        &self,
        module: &CompiledModule,
        manifest: &[u8],
        asset: &[u8],
        mime_type: &str,
    ) -> Result<serde_json::Value>;

    /// Quick scan of a (possibly partial) buffer for provenance markers.
    fn scan_input(&self, module: &CompiledModule, data: &[u8]) -> Result<serde_json::Value>;
}

/// Dispatches requests to an engine.
#[derive(Clone)]
pub struct WorkerHost {
    engine: Arc<dyn VerificationEngine>,
    modules: Arc<Mutex<HashMap<String, CompiledModule>>>,
}

impl WorkerHost {
    pub fn new(engine: Arc<dyn VerificationEngine>) -> Self {
        Self {
            engine,
            modules: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Handle one request. Never fails; errors become error responses.
    pub fn handle(&self, request: WorkerRequest) -> WorkerResponse {
        let method = request.method();
        match self.dispatch(request) {
            Ok(data) => WorkerResponse::Success { data },
            Err(e) => {
                debug!(%method, kind = %e.kind(), "worker request failed");
                WorkerResponse::Error {
                    error: codec::encode(&e),
                }
            }
        }
    }

    fn dispatch(&self, request: WorkerRequest) -> Result<Payload> {
        let (method, args) = request.into_parts();
        let mut args = Args::new(method, args);

        match method {
            Method::CompileModule => {
                let source = args.bytes()?;
                args.finish()?;
                let module = self.engine.compile_module(source)?;
                self.remember(&module);
                Ok(Payload::Module(module))
            }
            Method::GetReport => {
                let module = args.module()?;
                let asset = args.bytes()?;
                let mime_type = args.text()?;
                args.finish()?;
                self.engine
                    .get_report(&module, &asset, &mime_type)
                    .map(Payload::Json)
            }
            Method::GetReportFromBuffer => {
                let module = args.module()?;
                let manifest = args.bytes()?;
                let asset = args.bytes()?;
                let mime_type = args.text()?;
                args.finish()?;
                self.engine
                    .get_report_from_asset_and_manifest_buffer(
                        &module,
                        &manifest,
                        &asset,
                        &mime_type,
                    )
                    .map(Payload::Json)
            }
            Method::ScanInput => {
                let module = args.module()?;
                let data = args.bytes()?;
                args.finish()?;
                self.engine.scan_input(&module, &data).map(Payload::Json)
            }
        }
    }

    /// Handle one request received over a stream.
    pub fn handle_wire(&self, request: WireRequest) -> WireResponse {
        let response = match self.from_wire(request) {
            Ok(request) => self.handle(request),
            Err(e) => WorkerResponse::Error {
                error: codec::encode(&e),
            },
        };

        match response {
            WorkerResponse::Success { data } => WireResponse::Success {
                data: WireValue::from_payload(data, |module| ModuleRef {
                    digest: module.digest().to_string(),
                    source: Some(Base64(module.source().clone())),
                }),
            },
            WorkerResponse::Error { error } => WireResponse::Error { error },
        }
    }

    fn from_wire(&self, request: WireRequest) -> Result<WorkerRequest> {
        let args = request
            .args
            .into_iter()
            .map(|value| match value {
                WireValue::Null => Ok(Payload::Null),
                WireValue::Json(value) => Ok(Payload::Json(value)),
                WireValue::Text(text) => Ok(Payload::Text(text)),
                WireValue::Bytes(Base64(bytes)) => Ok(Payload::Bytes(bytes)),
                WireValue::Module(reference) => self.resolve_module(reference).map(Payload::Module),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(WorkerRequest::new(request.method, args))
    }

    /// Look up a module by digest, compiling it on first sight.
    fn resolve_module(&self, reference: ModuleRef) -> Result<CompiledModule> {
        if let Some(module) = self.lock_modules().get(&reference.digest) {
            return Ok(module.clone());
        }

        let Some(Base64(source)) = reference.source else {
            return Err(Error::InvalidRequest(format!(
                "module {} has not been loaded in this worker",
                reference.digest
            )));
        };
        if digest_of(&source) != reference.digest {
            return Err(Error::InvalidRequest(format!(
                "module source does not match digest {}",
                reference.digest
            )));
        }

        let module = self.engine.compile_module(source)?;
        self.remember(&module);
        Ok(module)
    }

    fn remember(&self, module: &CompiledModule) {
        self.lock_modules()
            .entry(module.digest().to_string())
            .or_insert_with(|| module.clone());
    }

    fn lock_modules(&self) -> std::sync::MutexGuard<'_, HashMap<String, CompiledModule>> {
        self.modules.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Positional argument reader for one request.
struct Args {
    method: Method,
    args: std::vec::IntoIter<Payload>,
    position: usize,
}

impl Args {
    fn new(method: Method, args: Vec<Payload>) -> Self {
        Self {
            method,
            args: args.into_iter(),
            position: 0,
        }
    }

    fn next(&mut self, expected: &str) -> Result<Payload> {
        self.position += 1;
        self.args.next().ok_or_else(|| {
            Error::InvalidRequest(format!(
                "{}: missing argument {} ({expected})",
                self.method, self.position
            ))
        })
    }

    fn mismatch(&self, expected: &str, found: &Payload) -> Error {
        Error::InvalidRequest(format!(
            "{}: argument {} must be {expected}, found {}",
            self.method,
            self.position,
            found.type_name()
        ))
    }

    fn bytes(&mut self) -> Result<Bytes> {
        match self.next("bytes")? {
            Payload::Bytes(bytes) => Ok(bytes),
            other => Err(self.mismatch("bytes", &other)),
        }
    }

    fn text(&mut self) -> Result<String> {
        match self.next("text")? {
            Payload::Text(text) => Ok(text),
            other => Err(self.mismatch("text", &other)),
        }
    }

    fn module(&mut self) -> Result<CompiledModule> {
        match self.next("module")? {
            Payload::Module(module) => Ok(module),
            other => Err(self.mismatch("module", &other)),
        }
    }

    fn finish(self) -> Result<()> {
        let extra = self.args.len();
        if extra == 0 {
            Ok(())
        } else {
            Err(Error::InvalidRequest(format!(
                "{}: {extra} unexpected trailing argument(s)",
                self.method
            )))
        }
    }
}

/// Serve NDJSON requests from `reader`, writing one response line each.
///
/// Returns when the reader reaches EOF. An engine panic ends the loop with
/// an error so the worker process exits and the pool sees the crash.
pub async fn serve<R, W>(host: WorkerHost, reader: R, writer: W) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();
    let mut writer = BufWriter::new(writer);

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<WireRequest>(&line) {
            Ok(request) => {
                let host = host.clone();
                tokio::task::spawn_blocking(move || host.handle_wire(request))
                    .await
                    .map_err(io::Error::other)?
            }
            Err(e) => {
                warn!(error = %e, "malformed worker request");
                WireResponse::Error {
                    error: codec::encode(&Error::InvalidRequest(format!("malformed request: {e}"))),
                }
            }
        };

        let line = serde_json::to_string(&response).map_err(io::Error::other)? + "\n";
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
    }

    Ok(())
}

/// Serve requests on this process's stdin/stdout.
pub async fn serve_stdio(engine: Arc<dyn VerificationEngine>) -> io::Result<()> {
    serve(
        WorkerHost::new(engine),
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
    )
    .await
}
