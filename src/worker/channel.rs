//! One-at-a-time message exchange with a single isolated worker context.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;
use tracing::warn;

use super::protocol::{Payload, WorkerRequest, WorkerResponse};
use crate::codec;
use crate::error::{Error, Result};

const IDLE: u8 = 0;
const BUSY: u8 = 1;
const TERMINATED: u8 = 2;

/// The isolated context died or became unreachable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ContextFault(pub String);

/// An isolated execution context hosting a verification engine.
///
/// Implementations only move messages; busy tracking and termination
/// semantics live in [`WorkerChannel`].
#[async_trait]
pub trait WorkerContext: Send + Sync {
    /// Deliver `request` and wait for its response.
    async fn post(
        &self,
        request: WorkerRequest,
    ) -> std::result::Result<WorkerResponse, ContextFault>;

    /// Forcefully end the context. Must be idempotent.
    fn terminate(&self);
}

/// Lifecycle of a [`WorkerChannel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Busy,
    Terminated,
}

/// A worker context plus its busy/idle state.
pub struct WorkerChannel {
    id: usize,
    context: Box<dyn WorkerContext>,
    state: AtomicU8,
    terminated: watch::Sender<bool>,
}

impl WorkerChannel {
    pub fn new(id: usize, context: Box<dyn WorkerContext>) -> Self {
        let (terminated, _) = watch::channel(false);
        Self {
            id,
            context,
            state: AtomicU8::new(IDLE),
            terminated,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn state(&self) -> ChannelState {
        match self.state.load(Ordering::Acquire) {
            IDLE => ChannelState::Idle,
            BUSY => ChannelState::Busy,
            _ => ChannelState::Terminated,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.state() == ChannelState::Busy
    }

    pub fn is_terminated(&self) -> bool {
        self.state() == ChannelState::Terminated
    }

    /// Run one request on this channel.
    ///
    /// # Errors
    ///
    /// - [`Error::ChannelBusy`] if a previous call has not resolved yet
    /// - [`Error::WorkerTerminated`] if the channel is or becomes terminated
    /// - [`Error::WorkerCrashed`] if the context dies mid-call; the channel
    ///   is terminated afterwards
    /// - the decoded worker error for error responses
    pub async fn execute(&self, request: WorkerRequest) -> Result<Payload> {
        match self
            .state
            .compare_exchange(IDLE, BUSY, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {}
            Err(BUSY) => {
                return Err(Error::ChannelBusy(format!(
                    "channel {} already has a request in flight",
                    self.id
                )))
            }
            Err(_) => return Err(Error::worker_terminated()),
        }
        let _busy = BusyGuard(&self.state);

        let mut terminated = self.terminated.subscribe();
        let outcome = tokio::select! {
            biased;
            _ = terminated.wait_for(|terminated| *terminated) => {
                return Err(Error::worker_terminated());
            }
            outcome = self.context.post(request) => outcome,
        };

        match outcome {
            Ok(WorkerResponse::Success { data }) => Ok(data),
            Ok(WorkerResponse::Error { error }) => Err(codec::decode(error)),
            Err(_) if self.is_terminated() => Err(Error::worker_terminated()),
            Err(fault) => {
                warn!(channel = self.id, %fault, "worker context died");
                self.terminate();
                Err(Error::WorkerCrashed(fault.0))
            }
        }
    }

    /// End the underlying context. In-flight and later calls fail with
    /// [`Error::WorkerTerminated`]; calling this again does nothing.
    pub fn terminate(&self) {
        if self.state.swap(TERMINATED, Ordering::AcqRel) == TERMINATED {
            return;
        }
        self.terminated.send_replace(true);
        self.context.terminate();
    }
}

impl fmt::Debug for WorkerChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerChannel")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

/// Returns a busy channel to idle when the call ends, however it ends.
struct BusyGuard<'a>(&'a AtomicU8);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        let _ = self
            .0
            .compare_exchange(BUSY, IDLE, Ordering::AcqRel, Ordering::Acquire);
    }
}
