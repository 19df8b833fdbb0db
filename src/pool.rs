//! A fixed set of worker channels behind an async method-call surface.
//!
//! Calls are admitted in strict FIFO order. At most one request runs on each
//! channel, so at most `channel_count` requests are in flight; the rest wait
//! in the queue until a channel frees up.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::{info, trace};

use crate::error::{Error, Result};
use crate::module::CompiledModule;
use crate::worker::{Method, Payload, WorkerChannel, WorkerContext, WorkerRequest};

/// Creates the isolated context behind each pool channel.
pub trait ChannelFactory: Send + Sync {
    /// Create the context for channel `id`.
    fn create(&self, id: usize) -> Result<Box<dyn WorkerContext>>;
}

/// Number of channels used when none is configured.
pub fn default_channel_count() -> usize {
    num_cpus::get().max(1)
}

struct QueuedJob {
    id: u64,
    request: WorkerRequest,
    reply: oneshot::Sender<Result<Payload>>,
}

struct PoolState {
    disposed: bool,
    next_job: u64,
    /// `reserved[i]` is set while a job is dispatched to channel `i`.
    reserved: Vec<bool>,
    queue: VecDeque<QueuedJob>,
}

struct PoolInner {
    channels: Vec<Arc<WorkerChannel>>,
    state: Mutex<PoolState>,
}

/// A pool of worker channels.
///
/// Cloning is cheap and every clone drives the same channels.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// Create `channel_count` channels eagerly through `factory`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidWorkerSource`] if `channel_count` is zero, or
    /// the factory's error if a context cannot be created. Contexts created
    /// before the failure are terminated.
    pub fn new(channel_count: usize, factory: &dyn ChannelFactory) -> Result<Self> {
        if channel_count == 0 {
            return Err(Error::InvalidWorkerSource(
                "a worker pool needs at least one channel".to_string(),
            ));
        }

        let mut channels = Vec::with_capacity(channel_count);
        for id in 0..channel_count {
            match factory.create(id) {
                Ok(context) => channels.push(Arc::new(WorkerChannel::new(id, context))),
                Err(e) => {
                    for channel in &channels {
                        channel.terminate();
                    }
                    return Err(e);
                }
            }
        }

        info!(channels = channel_count, "created worker pool");

        Ok(Self {
            inner: Arc::new(PoolInner {
                channels,
                state: Mutex::new(PoolState {
                    disposed: false,
                    next_job: 0,
                    reserved: vec![false; channel_count],
                    queue: VecDeque::new(),
                }),
            }),
        })
    }

    pub fn channel_count(&self) -> usize {
        self.inner.channels.len()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.lock().disposed
    }

    /// Number of calls waiting for a free channel.
    pub fn queued(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Number of channels currently running a call.
    pub fn in_flight(&self) -> usize {
        self.inner.lock().reserved.iter().filter(|r| **r).count()
    }

    /// Submit `request` and wait for its result.
    ///
    /// # Errors
    ///
    /// - [`Error::PoolDisposed`] if the pool is or becomes disposed before
    ///   the call is dispatched
    /// - [`Error::WorkerTerminated`] if no live channel is left
    /// - any error produced by the channel or the worker
    pub async fn call(&self, request: WorkerRequest) -> Result<Payload> {
        let (reply, rx) = oneshot::channel();
        {
            let mut state = self.inner.lock();
            if state.disposed {
                return Err(Error::pool_disposed());
            }
            if self.inner.channels.iter().all(|c| c.is_terminated()) {
                return Err(Error::WorkerTerminated(
                    "every worker in the pool has died".to_string(),
                ));
            }
            let id = state.next_job;
            state.next_job += 1;
            trace!(
                job = id,
                method = %request.method(),
                queued = state.queue.len(),
                "queued pool call"
            );
            state.queue.push_back(QueuedJob { id, request, reply });
        }
        self.inner.pump();

        rx.await.unwrap_or_else(|_| Err(Error::pool_disposed()))
    }

    /// Compile module `source` on a worker.
    pub async fn compile_module(&self, source: Bytes) -> Result<CompiledModule> {
        let request = WorkerRequest::new(Method::CompileModule, vec![Payload::Bytes(source)]);
        match self.call(request).await? {
            Payload::Module(module) => Ok(module),
            other => Err(Error::ModuleCompile(format!(
                "worker returned {} instead of a module",
                other.type_name()
            ))),
        }
    }

    /// Produce the provenance report for an asset.
    pub async fn get_report(
        &self,
        module: CompiledModule,
        asset: Bytes,
        mime_type: &str,
    ) -> Result<serde_json::Value> {
        let request = WorkerRequest::new(
            Method::GetReport,
            vec![
                Payload::Module(module),
                Payload::Bytes(asset),
                Payload::Text(mime_type.to_string()),
            ],
        );
        expect_json(self.call(request).await?)
    }

    /// Produce the report for an asset whose manifest is supplied separately.
    pub async fn get_report_from_asset_and_manifest_buffer(
        &self,
        module: CompiledModule,
        manifest: Bytes,
        asset: Bytes,
        mime_type: &str,
    ) -> Result<serde_json::Value> {
        let request = WorkerRequest::new(
            Method::GetReportFromBuffer,
            vec![
                Payload::Module(module),
                Payload::Bytes(manifest),
                Payload::Bytes(asset),
                Payload::Text(mime_type.to_string()),
            ],
        );
        expect_json(self.call(request).await?)
    }

    /// Scan raw input for embedded provenance markers.
    pub async fn scan_input(
        &self,
        module: CompiledModule,
        data: Bytes,
    ) -> Result<serde_json::Value> {
        let request = WorkerRequest::new(
            Method::ScanInput,
            vec![Payload::Module(module), Payload::Bytes(data)],
        );
        expect_json(self.call(request).await?)
    }

    /// Terminate every channel and reject every queued call.
    ///
    /// In-flight calls fail with [`Error::WorkerTerminated`], queued ones with
    /// [`Error::PoolDisposed`]. Calling this again does nothing.
    pub fn dispose(&self) {
        let queued = {
            let mut state = self.inner.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
            std::mem::take(&mut state.queue)
        };

        for channel in &self.inner.channels {
            channel.terminate();
        }

        info!(rejected = queued.len(), "disposed worker pool");
        for job in queued {
            let _ = job.reply.send(Err(Error::pool_disposed()));
        }
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("channels", &self.inner.channels)
            .finish_non_exhaustive()
    }
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Dispatch queued jobs onto free live channels, oldest first.
    fn pump(self: &Arc<Self>) {
        let mut dispatched = Vec::new();
        {
            let mut state = self.lock();
            if state.disposed {
                return;
            }
            while !state.queue.is_empty() {
                let free = self
                    .channels
                    .iter()
                    .enumerate()
                    .position(|(idx, channel)| !state.reserved[idx] && !channel.is_terminated());
                let Some(idx) = free else { break };
                let Some(job) = state.queue.pop_front() else { break };
                state.reserved[idx] = true;
                dispatched.push((idx, job));
            }
        }

        for (idx, job) in dispatched {
            let pool = Arc::clone(self);
            tokio::spawn(async move {
                let channel = &pool.channels[idx];
                trace!(
                    job = job.id,
                    channel = channel.id(),
                    method = %job.request.method(),
                    "dispatching pool call"
                );
                let result = channel.execute(job.request).await;
                let _ = job.reply.send(result);
                pool.release(idx);
            });
        }
    }

    /// Free channel `idx` and hand it the next job.
    fn release(self: &Arc<Self>, idx: usize) {
        let orphaned = {
            let mut state = self.lock();
            state.reserved[idx] = false;
            if self.channels.iter().all(|c| c.is_terminated()) {
                std::mem::take(&mut state.queue)
            } else {
                VecDeque::new()
            }
        };

        for job in orphaned {
            let _ = job.reply.send(Err(Error::WorkerTerminated(
                "every worker in the pool has died".to_string(),
            )));
        }
        self.pump();
    }
}

fn expect_json(payload: Payload) -> Result<serde_json::Value> {
    match payload {
        Payload::Json(value) => Ok(value),
        other => Err(Error::InvalidReport(format!(
            "worker returned {} instead of a report",
            other.type_name()
        ))),
    }
}
