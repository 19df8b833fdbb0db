#[path = "../common/mod.rs"]
mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use c2pa_reader::error::Error;
use c2pa_reader::module::CompiledModule;
use c2pa_reader::pool::WorkerPool;
use c2pa_reader::worker::ThreadFactory;
use common::{init_tracing, FakeEngine};
use futures::future::join_all;

fn module() -> CompiledModule {
    CompiledModule::new(Bytes::from_static(b"\0asm"), "fake artifact".to_string())
}

fn thread_pool(channels: usize, engine: &Arc<FakeEngine>) -> WorkerPool {
    WorkerPool::new(channels, &ThreadFactory::new(engine.clone())).unwrap()
}

async fn wait_until(mut done: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !done() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_concurrency_bound_and_fifo_admission() {
    init_tracing();

    for channels in 1..=3 {
        let engine = FakeEngine::new();
        let pool = thread_pool(channels, &engine);
        let jobs = channels * 3;

        // join_all polls in order, so jobs enter the queue in index order
        let results = join_all((0..jobs).map(|i| {
            let asset = Bytes::from(format!("slow-{i}"));
            let pool = pool.clone();
            async move { pool.get_report(module(), asset, "image/jpeg").await }
        }))
        .await;

        for (i, result) in results.into_iter().enumerate() {
            let report = result.unwrap();
            assert_eq!(
                report["manifests"]["urn:uuid:fake"]["title"],
                format!("slow-{i}")
            );
        }

        assert!(engine.max_running() <= channels, "{channels} channels");
        assert_eq!(engine.reports(), jobs);
        assert_eq!(pool.in_flight(), 0);
        assert_eq!(pool.queued(), 0);

        // The first wave holds exactly the first `channels` jobs
        let arrivals = engine.arrivals();
        let mut first_wave = arrivals[..channels].to_vec();
        first_wave.sort();
        let expected: Vec<String> = (0..channels).map(|i| format!("slow-{i}")).collect();
        assert_eq!(first_wave, expected);

        if channels == 1 {
            let expected: Vec<String> = (0..jobs).map(|i| format!("slow-{i}")).collect();
            assert_eq!(arrivals, expected);
        }

        pool.dispose();
    }
}

#[tokio::test]
async fn test_freed_channel_takes_oldest_queued_job() {
    init_tracing();

    for channels in 1..=3 {
        let engine = FakeEngine::new();
        let pool = thread_pool(channels, &engine);
        let jobs = channels * 3;

        // Submit one at a time so queue order is index order
        let mut handles = Vec::new();
        for i in 0..jobs {
            let asset = Bytes::from(format!("gated-{i}"));
            handles.push(tokio::spawn({
                let pool = pool.clone();
                async move { pool.get_report(module(), asset, "image/jpeg").await }
            }));
            wait_until(|| pool.in_flight() + pool.queued() == i + 1).await;
        }
        wait_until(|| engine.arrivals().len() == channels).await;

        let mut first_wave = engine.arrivals();
        first_wave.sort();
        let expected: Vec<String> = (0..channels).map(|i| format!("gated-{i}")).collect();
        assert_eq!(first_wave, expected);

        // Free one channel at a time; it must pick up the next job in line
        for done in 0..jobs {
            engine.release(&format!("gated-{done}"));
            let next = channels + done;
            if next < jobs {
                wait_until(|| engine.arrivals().len() == next + 1).await;
                assert_eq!(engine.arrivals()[next], format!("gated-{next}"));
            }
        }

        for (i, handle) in handles.into_iter().enumerate() {
            let report = handle.await.unwrap().unwrap();
            assert_eq!(
                report["manifests"]["urn:uuid:fake"]["title"],
                format!("gated-{i}")
            );
        }
        assert!(engine.max_running() <= channels, "{channels} channels");
        pool.dispose();
    }
}

#[tokio::test]
async fn test_dispose_rejects_in_flight_and_queued() {
    init_tracing();
    let engine = FakeEngine::new();
    let pool = thread_pool(1, &engine);

    let running = tokio::spawn({
        let pool = pool.clone();
        async move { pool.get_report(module(), Bytes::from_static(b"slow"), "image/png").await }
    });
    wait_until(|| engine.arrivals().len() == 1).await;

    let queued = tokio::spawn({
        let pool = pool.clone();
        async move { pool.get_report(module(), Bytes::from_static(b"queued"), "image/png").await }
    });
    wait_until(|| pool.queued() == 1).await;

    pool.dispose();
    pool.dispose();

    assert!(matches!(running.await.unwrap(), Err(Error::WorkerTerminated(_))));
    assert!(matches!(queued.await.unwrap(), Err(Error::PoolDisposed(_))));

    let err = pool
        .get_report(module(), Bytes::from_static(b"late"), "image/png")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PoolDisposed(_)));
    assert_eq!(engine.arrivals(), vec!["slow".to_string()]);
}

#[tokio::test]
async fn test_engine_errors_do_not_kill_channel() {
    let engine = FakeEngine::new();
    let pool = thread_pool(1, &engine);

    let err = pool
        .get_report(module(), Bytes::from_static(b"plain"), "image/jpeg")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ProvenanceMissing(_)));

    let report = pool
        .get_report(module(), Bytes::from_static(b"ok"), "image/jpeg")
        .await
        .unwrap();
    assert_eq!(report["manifests"]["urn:uuid:fake"]["format"], "image/jpeg");
}

#[tokio::test]
async fn test_crash_kills_only_its_channel() {
    let engine = FakeEngine::new();
    let pool = thread_pool(2, &engine);

    let err = pool
        .get_report(module(), Bytes::from_static(b"panic"), "image/jpeg")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::WorkerCrashed(_)));

    // The surviving channel keeps serving
    for _ in 0..3 {
        pool.get_report(module(), Bytes::from_static(b"ok"), "image/jpeg")
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_all_channels_dead_rejects_queue() {
    init_tracing();
    let engine = FakeEngine::new();
    let pool = thread_pool(1, &engine);

    let crashing = tokio::spawn({
        let pool = pool.clone();
        async move {
            pool.get_report(module(), Bytes::from_static(b"slow-panic"), "image/png")
                .await
        }
    });
    wait_until(|| engine.arrivals().len() == 1).await;

    let queued = tokio::spawn({
        let pool = pool.clone();
        async move { pool.get_report(module(), Bytes::from_static(b"ok"), "image/png").await }
    });
    wait_until(|| pool.queued() == 1).await;

    assert!(matches!(crashing.await.unwrap(), Err(Error::WorkerCrashed(_))));
    assert!(matches!(queued.await.unwrap(), Err(Error::WorkerTerminated(_))));

    let err = pool
        .get_report(module(), Bytes::from_static(b"ok"), "image/png")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::WorkerTerminated(_)));
    assert!(!pool.is_disposed());
}

#[tokio::test]
async fn test_compile_and_scan_through_pool() {
    let engine = FakeEngine::new();
    let pool = thread_pool(2, &engine);

    let module = pool
        .compile_module(Bytes::from_static(b"\0asm\x01\0\0\0"))
        .await
        .unwrap();
    assert_eq!(module.artifact::<String>().map(String::as_str), Some("fake artifact"));
    assert_eq!(engine.compiles(), 1);

    let err = pool
        .compile_module(Bytes::from_static(b"not wasm"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ModuleCompile(_)));

    let scan = pool
        .scan_input(module.clone(), Bytes::from_static(b"jumbf..."))
        .await
        .unwrap();
    assert_eq!(scan["found"], true);

    let report = pool
        .get_report_from_asset_and_manifest_buffer(
            module,
            Bytes::from_static(b"sidecar"),
            Bytes::from_static(b"asset"),
            "image/heic",
        )
        .await
        .unwrap();
    assert_eq!(report["manifests"]["urn:uuid:fake"]["title"], "sidecar");
}
