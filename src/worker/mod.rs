//! Isolated worker contexts hosting the verification engine.
//!
//! Each worker owns its own copy of engine state and exchanges messages with
//! the orchestrator one request at a time.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                   Orchestrator (Rust + Tokio)                   │
//! │  ┌───────────────────────────────────────────────────────────┐  │
//! │  │                  WorkerChannel (Async)                    │  │
//! │  │  - One request in flight, busy/idle tracking              │  │
//! │  │  - Forceful termination, errors decoded via the codec     │  │
//! │  └───────────────────────────────────────────────────────────┘  │
//! │                              │                                  │
//! │           WorkerContext::post│ (thread or NDJSON stdio)         │
//! │                              ▼                                  │
//! └─────────────────────────────────────────────────────────────────┘
//!                                │
//!                                ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │       WorkerHost (dedicated thread or child process)            │
//! │  - Dispatches compileModule / getReport / scanInput             │
//! │  - Encodes engine failures as transport errors                  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use c2pa_reader::worker::{serve_stdio, VerificationEngine};
//!
//! // main() of a worker executable
//! serve_stdio(Arc::new(MyEngine::new())).await?;
//! ```

mod channel;
mod host;
mod process;
pub mod protocol;
mod thread;

pub use channel::{ChannelState, ContextFault, WorkerChannel, WorkerContext};
pub use host::{serve, serve_stdio, VerificationEngine, WorkerHost};
pub use process::{ProcessFactory, StreamContext};
pub use protocol::{Method, Payload, WorkerRequest, WorkerResponse};
pub use thread::{ThreadContext, ThreadFactory};
