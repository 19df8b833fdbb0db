//! Worker contexts over byte streams, usually a child process's stdio.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::channel::{ContextFault, WorkerContext};
use super::protocol::{
    Base64, ModuleRef, Payload, WireRequest, WireResponse, WireValue, WorkerRequest, WorkerResponse,
};
use crate::codec;
use crate::config::{expand_env_vars, Settings};
use crate::error::{Error, Result};
use crate::module::CompiledModule;
use crate::pool::ChannelFactory;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type Reply = std::result::Result<WireResponse, ContextFault>;

/// The single reply slot of a stream. Closed once the reader task ends.
#[derive(Default)]
struct PendingSlot {
    closed: bool,
    reply: Option<oneshot::Sender<Reply>>,
}

/// Worker context speaking NDJSON over a reader/writer pair.
///
/// One request line is written per call and the next response line
/// answers it; a background task reads responses. When the stream ends, or
/// a response line cannot be parsed, the in-flight call fails with a
/// [`ContextFault`].
pub struct StreamContext {
    /// Writer for sending requests to the worker.
    writer: tokio::sync::Mutex<BufWriter<BoxedWriter>>,

    /// Reply slot for the request in flight.
    pending: Arc<Mutex<PendingSlot>>,

    /// Module digests whose source this worker has already received.
    shipped: Mutex<HashSet<String>>,

    /// Handle to the background reader task.
    reader_task: JoinHandle<()>,

    /// Child process owning the streams, if any.
    child: Mutex<Option<Child>>,
}

impl StreamContext {
    /// Wrap an already connected stream pair.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::build(reader, writer, None)
    }

    fn build<R, W>(reader: R, writer: W, child: Option<Child>) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let pending = Arc::new(Mutex::new(PendingSlot::default()));
        let reader_task = Self::spawn_reader_task(reader, pending.clone());
        let writer: BoxedWriter = Box::new(writer);

        Self {
            writer: tokio::sync::Mutex::new(BufWriter::new(writer)),
            pending,
            shipped: Mutex::new(HashSet::new()),
            reader_task,
            child: Mutex::new(child),
        }
    }

    /// Spawn a worker executable and talk to it over stdin/stdout.
    pub fn spawn<P: AsRef<Path>>(program: P, args: &[String]) -> Result<Self> {
        let program = program.as_ref();
        let mut child = Command::new(program)
            .args(args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::InvalidWorkerSource(format!("failed to spawn {}: {e}", program.display()))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::InvalidWorkerSource("worker stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::InvalidWorkerSource("worker stdout not captured".to_string()))?;

        debug!(program = %program.display(), pid = child.id(), "spawned worker process");
        Ok(Self::build(stdout, stdin, Some(child)))
    }

    /// Spawn the background task that reads responses from the worker.
    fn spawn_reader_task<R>(reader: R, pending: Arc<Mutex<PendingSlot>>) -> JoinHandle<()>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        tokio::spawn(async move {
            let mut reader = BufReader::new(reader);
            let mut line = String::new();

            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    // EOF - worker exited
                    Ok(0) => break,
                    Ok(_) if line.trim().is_empty() => continue,
                    Ok(_) => match serde_json::from_str::<WireResponse>(&line) {
                        Ok(response) => match lock(&pending).reply.take() {
                            Some(tx) => {
                                let _ = tx.send(Ok(response));
                            }
                            None => warn!("worker sent a response with no request in flight"),
                        },
                        Err(e) => {
                            // Later lines can no longer be paired with requests
                            warn!(error = %e, "failed to parse worker response");
                            if let Some(tx) = lock(&pending).reply.take() {
                                let fault = ContextFault(format!("malformed worker response: {e}"));
                                let _ = tx.send(Err(fault));
                            }
                            break;
                        }
                    },
                    Err(e) => {
                        warn!(error = %e, "worker read error");
                        break;
                    }
                }
            }

            // Dropping the sender fails the request in flight.
            let mut slot = lock(&pending);
            slot.closed = true;
            slot.reply = None;
        })
    }

    /// Convert `request` for the wire, attaching module sources the worker
    /// has not seen. Returns the digests shipped by this request.
    fn to_wire(&self, request: WorkerRequest) -> (WireRequest, Vec<String>) {
        let (method, args) = request.into_parts();
        let mut shipped = lock(&self.shipped);
        let mut first_shipped = Vec::new();
        let args = args
            .into_iter()
            .map(|payload| {
                WireValue::from_payload(payload, |module| {
                    let digest = module.digest().to_string();
                    let first_time = shipped.insert(digest.clone());
                    if first_time {
                        first_shipped.push(digest.clone());
                    }
                    ModuleRef {
                        digest,
                        source: first_time.then(|| Base64(module.source().clone())),
                    }
                })
            })
            .collect();
        (WireRequest { method, args }, first_shipped)
    }

    /// Ship these sources again next time; the worker may not have kept them.
    fn forget_shipped(&self, digests: &[String]) {
        if digests.is_empty() {
            return;
        }
        let mut shipped = lock(&self.shipped);
        for digest in digests {
            shipped.remove(digest);
        }
    }

    fn from_wire(&self, response: WireResponse) -> WorkerResponse {
        let value = match response {
            WireResponse::Error { error } => return WorkerResponse::Error { error },
            WireResponse::Success { data } => data,
        };

        let data = match value {
            WireValue::Null => Payload::Null,
            WireValue::Json(value) => Payload::Json(value),
            WireValue::Text(text) => Payload::Text(text),
            WireValue::Bytes(Base64(bytes)) => Payload::Bytes(bytes),
            WireValue::Module(ModuleRef {
                digest,
                source: Some(Base64(source)),
            }) => {
                let module = CompiledModule::detached(source);
                if module.digest() != digest {
                    return invalid_response(format!(
                        "module source does not match digest {digest}"
                    ));
                }
                lock(&self.shipped).insert(digest);
                Payload::Module(module)
            }
            WireValue::Module(ModuleRef { digest, source: None }) => {
                return invalid_response(format!(
                    "worker returned module {digest} without its source"
                ));
            }
        };
        WorkerResponse::Success { data }
    }

    /// Check if the worker stream is still open.
    pub fn is_alive(&self) -> bool {
        !self.reader_task.is_finished()
    }
}

#[async_trait]
impl WorkerContext for StreamContext {
    async fn post(
        &self,
        request: WorkerRequest,
    ) -> std::result::Result<WorkerResponse, ContextFault> {
        let method = request.method();
        let (request, first_shipped) = self.to_wire(request);
        let line = serde_json::to_string(&request)
            .map_err(|e| ContextFault(format!("failed to serialize request: {e}")))?
            + "\n";

        // Register the reply slot before writing so a fast reply is not lost
        let (tx, rx) = oneshot::channel();
        {
            let mut slot = lock(&self.pending);
            if slot.closed {
                return Err(ContextFault("worker stream is closed".to_string()));
            }
            slot.reply = Some(tx);
        }

        {
            let mut writer = self.writer.lock().await;
            writer
                .write_all(line.as_bytes())
                .await
                .map_err(|e| ContextFault(format!("failed to write to worker: {e}")))?;
            writer
                .flush()
                .await
                .map_err(|e| ContextFault(format!("failed to write to worker: {e}")))?;
        }
        debug!(%method, bytes = line.len(), "sent worker request");

        let response = rx
            .await
            .map_err(|_| ContextFault("worker process exited unexpectedly".to_string()))??;
        if matches!(response, WireResponse::Error { .. }) {
            self.forget_shipped(&first_shipped);
        }
        Ok(self.from_wire(response))
    }

    fn terminate(&self) {
        self.reader_task.abort();
        {
            let mut slot = lock(&self.pending);
            slot.closed = true;
            slot.reply = None;
        }
        if let Some(mut child) = lock(&self.child).take() {
            let _ = child.start_kill();
        }
    }
}

impl Drop for StreamContext {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

fn invalid_response(message: String) -> WorkerResponse {
    WorkerResponse::Error {
        error: codec::encode(&Error::InvalidRequest(message)),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Spawns one worker process per channel.
#[derive(Debug, Clone)]
pub struct ProcessFactory {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessFactory {
    /// Use `program` as the worker executable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidWorkerSource`] if `program` is a path that
    /// does not exist. Bare names are looked up on `PATH` at spawn time.
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Result<Self> {
        let program = program.into();
        if program.components().count() > 1 && !program.exists() {
            return Err(Error::InvalidWorkerSource(format!(
                "worker executable not found: {}",
                program.display()
            )));
        }
        Ok(Self { program, args })
    }

    /// Build a factory from the `[worker]` section of the settings.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let src = settings.worker.src.as_deref().ok_or_else(|| {
            Error::InvalidWorkerSource("no worker executable configured (worker.src)".to_string())
        })?;
        let src = expand_env_vars(src).map_err(|e| Error::InvalidWorkerSource(e.to_string()))?;
        Self::new(src, settings.worker.args.clone())
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

impl ChannelFactory for ProcessFactory {
    fn create(&self, _id: usize) -> Result<Box<dyn WorkerContext>> {
        Ok(Box::new(StreamContext::spawn(&self.program, &self.args)?))
    }
}
