//! # c2pa-reader
//!
//! Reads C2PA provenance reports from images and videos by dispatching them
//! to a pool of isolated workers that host a verification engine.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │            SourceInput (bytes, URL, file)                │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [source]
//! ┌─────────────────────────────────────────────────────────┐
//! │                Source (bytes + MIME type)                │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [reader + module loader]
//! ┌─────────────────────────────────────────────────────────┐
//! │        WorkerPool (FIFO queue, N WorkerChannels)         │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [worker: thread or process]
//! ┌─────────────────────────────────────────────────────────┐
//! │      VerificationEngine  ->  report / TransportError     │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [codec + report]
//! ┌─────────────────────────────────────────────────────────┐
//! │       ManifestStore, or None when no provenance          │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! When the engine reports that the manifest lives remotely, the reader
//! fetches it once and asks the engine again.

pub mod codec;
pub mod config;
pub mod error;
pub mod fetch;
pub mod module;
pub mod pool;
pub mod reader;
pub mod report;
pub mod source;
pub mod worker;

pub use error::{Error, ErrorKind, Result};
pub use fetch::{FetchedBody, HttpClient, HttpFetch};
pub use module::{CompiledModule, ModuleLoader, ModuleSource};
pub use pool::{ChannelFactory, WorkerPool};
pub use reader::{generate_verify_url, ReadResult, Reader, ReaderOptions};
pub use report::{CawgReport, GenerativeInfo, GenerativeType, Manifest, ManifestStore};
pub use source::{Source, SourceInput, SourceResolver};
pub use worker::{ProcessFactory, ThreadFactory, VerificationEngine};
