#[path = "../common/mod.rs"]
mod common;

use std::sync::Arc;

use bytes::Bytes;
use c2pa_reader::codec::TransportError;
use c2pa_reader::error::{Error, Result};
use c2pa_reader::pool::{ChannelFactory, WorkerPool};
use c2pa_reader::worker::protocol::{Method, WireResponse};
use c2pa_reader::worker::{
    serve, StreamContext, WorkerChannel, WorkerContext, WorkerHost, WorkerRequest,
};
use common::{init_tracing, FakeEngine};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

/// Connects each channel to an in-process `serve` loop over a duplex pipe.
struct DuplexFactory {
    host: WorkerHost,
}

impl DuplexFactory {
    fn new(engine: Arc<FakeEngine>) -> Self {
        Self {
            host: WorkerHost::new(engine),
        }
    }
}

impl ChannelFactory for DuplexFactory {
    fn create(&self, _id: usize) -> Result<Box<dyn WorkerContext>> {
        let (client, worker) = tokio::io::duplex(64 * 1024);

        let (worker_read, worker_write) = tokio::io::split(worker);
        tokio::spawn(serve(self.host.clone(), BufReader::new(worker_read), worker_write));

        let (client_read, client_write) = tokio::io::split(client);
        Ok(Box::new(StreamContext::new(client_read, client_write)))
    }
}

const WASM: &[u8] = b"\0asm\x01\0\0\0";

#[tokio::test]
async fn test_compile_then_report_over_stream() {
    init_tracing();
    let engine = FakeEngine::new();
    let pool = WorkerPool::new(1, &DuplexFactory::new(engine.clone())).unwrap();

    let module = pool.compile_module(Bytes::from_static(WASM)).await.unwrap();
    assert_eq!(module.source().as_ref(), WASM);
    // The orchestrator side never holds the engine artifact
    assert!(module.artifact::<String>().is_none());

    for _ in 0..3 {
        let report = pool
            .get_report(module.clone(), Bytes::from_static(b"photo"), "image/jpeg")
            .await
            .unwrap();
        assert_eq!(report["manifests"]["urn:uuid:fake"]["title"], "photo");
    }

    // Compiled once by compileModule; later calls resolve by digest
    assert_eq!(engine.compiles(), 1);
}

#[tokio::test]
async fn test_engine_error_crosses_stream() {
    let engine = FakeEngine::new();
    let pool = WorkerPool::new(1, &DuplexFactory::new(engine.clone())).unwrap();
    let module = pool.compile_module(Bytes::from_static(WASM)).await.unwrap();

    let err = pool
        .get_report(module.clone(), Bytes::from_static(b"remote"), "image/jpeg")
        .await
        .unwrap_err();
    assert_eq!(
        err,
        Error::RemoteManifestPointer {
            url: Some(common::REMOTE_MANIFEST_URL.to_string()),
            message: "manifest is stored remotely".to_string(),
        }
    );

    let err = pool
        .get_report(module, Bytes::from_static(b"boom"), "image/jpeg")
        .await
        .unwrap_err();
    assert_eq!(err.kind().as_str(), "Unknown");
    assert!(matches!(err, Error::Unknown { ref kind, .. } if kind == "Toolkit(Other)"));
}

#[tokio::test]
async fn test_module_shipped_to_fresh_worker() {
    let engine = FakeEngine::new();
    let factory = DuplexFactory::new(engine.clone());

    // A module compiled elsewhere reaches this worker with its source
    let module = c2pa_reader::CompiledModule::detached(Bytes::from_static(WASM));
    let pool = WorkerPool::new(1, &factory).unwrap();
    pool.get_report(module, Bytes::from_static(b"photo"), "image/png")
        .await
        .unwrap();
    assert_eq!(engine.compiles(), 1);
}

#[tokio::test]
async fn test_rejected_module_keeps_its_compile_error() {
    let engine = FakeEngine::new();
    let pool = WorkerPool::new(1, &DuplexFactory::new(engine.clone())).unwrap();
    let module = c2pa_reader::CompiledModule::detached(Bytes::from_static(b"not wasm"));

    // Each attempt ships the source again and sees the engine's own error
    for attempt in 1..=2 {
        let err = pool
            .get_report(module.clone(), Bytes::from_static(b"photo"), "image/jpeg")
            .await
            .unwrap_err();
        assert_eq!(err, Error::ModuleCompile("invalid magic number".to_string()));
        assert_eq!(engine.compiles(), attempt);
    }
}

#[tokio::test]
async fn test_closed_stream_is_crash() {
    init_tracing();
    let (client, worker) = tokio::io::duplex(1024);
    let (client_read, client_write) = tokio::io::split(client);
    let channel = WorkerChannel::new(0, Box::new(StreamContext::new(client_read, client_write)));
    drop(worker);

    let err = channel
        .execute(WorkerRequest::new(Method::ScanInput, vec![]))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::WorkerCrashed(_)));
    assert!(channel.is_terminated());
}

#[tokio::test]
async fn test_serve_answers_malformed_lines() {
    let engine = FakeEngine::new();
    let (client, worker) = tokio::io::duplex(1024);
    let (worker_read, worker_write) = tokio::io::split(worker);
    let host = WorkerHost::new(engine);
    let server = tokio::spawn(serve(host, BufReader::new(worker_read), worker_write));

    let (client_read, mut client_write) = tokio::io::split(client);
    client_write.write_all(b"not json\n\n").await.unwrap();
    client_write
        .write_all(br#"{"method":"scanInput","args":[{"text":"wrong"}]}"#)
        .await
        .unwrap();
    client_write.write_all(b"\n").await.unwrap();

    let mut lines = BufReader::new(client_read).lines();
    for _ in 0..2 {
        let line = lines.next_line().await.unwrap().unwrap();
        let response: WireResponse = serde_json::from_str(&line).unwrap();
        let WireResponse::Error { error } = response else {
            panic!("expected an error response, got {line}");
        };
        let TransportError { kind, .. } = error;
        assert_eq!(kind, "InvalidRequest");
    }

    drop(lines);
    drop(client_write);
    server.await.unwrap().unwrap();
}
