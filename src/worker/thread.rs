//! In-process worker contexts on dedicated OS threads.

use std::io;
use std::sync::{mpsc, Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::oneshot;

use super::channel::{ContextFault, WorkerContext};
use super::host::{VerificationEngine, WorkerHost};
use super::protocol::{WorkerRequest, WorkerResponse};
use crate::error::{Error, Result};
use crate::pool::ChannelFactory;

/// A request handed to the worker thread.
struct ThreadJob {
    request: WorkerRequest,
    reply: oneshot::Sender<WorkerResponse>,
}

/// A worker context that owns one OS thread.
///
/// The thread shares nothing with the caller except the message channel.
/// A panic inside the engine kills the thread; the pending call then sees a
/// [`ContextFault`]. Threads cannot be killed from outside, so
/// [`terminate`](WorkerContext::terminate) closes the channel and the
/// thread exits once its current request returns.
pub struct ThreadContext {
    tx: Mutex<Option<mpsc::Sender<ThreadJob>>>,
}

impl ThreadContext {
    /// Spawn a named worker thread running `host`.
    pub fn spawn(name: String, host: WorkerHost) -> io::Result<Self> {
        let (tx, rx) = mpsc::channel::<ThreadJob>();

        std::thread::Builder::new().name(name).spawn(move || {
            while let Ok(job) = rx.recv() {
                let response = host.handle(job.request);
                let _ = job.reply.send(response);
            }
        })?;

        Ok(Self {
            tx: Mutex::new(Some(tx)),
        })
    }
}

#[async_trait]
impl WorkerContext for ThreadContext {
    async fn post(
        &self,
        request: WorkerRequest,
    ) -> std::result::Result<WorkerResponse, ContextFault> {
        let (reply, rx) = oneshot::channel();
        {
            let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
            let tx = tx
                .as_ref()
                .ok_or_else(|| ContextFault("worker thread has been stopped".to_string()))?;
            tx.send(ThreadJob { request, reply })
                .map_err(|_| ContextFault("worker thread has exited".to_string()))?;
        }

        rx.await
            .map_err(|_| ContextFault("worker thread exited before replying".to_string()))
    }

    fn terminate(&self) {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
    }
}

/// Creates [`ThreadContext`]s that all share one [`WorkerHost`].
///
/// Sharing the host means a module compiled by any thread is visible to
/// every other thread.
#[derive(Clone)]
pub struct ThreadFactory {
    host: WorkerHost,
}

impl ThreadFactory {
    pub fn new(engine: Arc<dyn VerificationEngine>) -> Self {
        Self {
            host: WorkerHost::new(engine),
        }
    }
}

impl ChannelFactory for ThreadFactory {
    fn create(&self, id: usize) -> Result<Box<dyn WorkerContext>> {
        let context = ThreadContext::spawn(format!("c2pa-worker-{id}"), self.host.clone())
            .map_err(|e| {
                Error::InvalidWorkerSource(format!("failed to spawn worker thread: {e}"))
            })?;
        Ok(Box::new(context))
    }
}
