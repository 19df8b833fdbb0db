#[path = "../common/mod.rs"]
mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use c2pa_reader::error::Error;
use c2pa_reader::module::{CompiledModule, ModuleLoader, ModuleSource};
use c2pa_reader::pool::WorkerPool;
use c2pa_reader::worker::ThreadFactory;
use common::{init_tracing, FakeEngine, FakeFetcher, MODULE_URL};
use futures::future::join_all;

fn setup(fetcher: FakeFetcher) -> (Arc<FakeEngine>, Arc<FakeFetcher>, ModuleLoader, WorkerPool) {
    let engine = FakeEngine::new();
    let fetcher = Arc::new(fetcher);
    let loader = ModuleLoader::new(fetcher.clone());
    let pool = WorkerPool::new(2, &ThreadFactory::new(engine.clone())).unwrap();
    (engine, fetcher, loader, pool)
}

#[tokio::test]
async fn test_concurrent_loads_share_one_fetch_and_compile() {
    init_tracing();
    let (engine, fetcher, loader, pool) =
        setup(FakeFetcher::with_module().delayed(Duration::from_millis(50)));
    let source = ModuleSource::from(MODULE_URL);

    let modules = join_all((0..8).map(|_| loader.load(&source, &pool))).await;
    let modules: Vec<CompiledModule> = modules.into_iter().map(Result::unwrap).collect();

    assert_eq!(fetcher.calls(MODULE_URL), 1);
    assert_eq!(engine.compiles(), 1);
    assert!(modules.windows(2).all(|pair| pair[0].ptr_eq(&pair[1])));

    // Later loads hit the memo
    let again = loader.load(&source, &pool).await.unwrap();
    assert!(again.ptr_eq(&modules[0]));
    assert_eq!(fetcher.calls(MODULE_URL), 1);
}

#[tokio::test]
async fn test_precompiled_module_bypasses_loading() {
    let (engine, fetcher, loader, pool) = setup(FakeFetcher::new());
    let module = CompiledModule::detached(Bytes::from_static(b"\0asm"));

    let loaded = loader
        .load(&ModuleSource::Compiled(module.clone()), &pool)
        .await
        .unwrap();
    assert!(loaded.ptr_eq(&module));
    assert_eq!(engine.compiles(), 0);
    assert_eq!(fetcher.calls(MODULE_URL), 0);
}

#[tokio::test]
async fn test_fetch_failure_is_memoized() {
    let (engine, fetcher, loader, pool) = setup(FakeFetcher::new().fail(MODULE_URL, 404));
    let source = ModuleSource::from(MODULE_URL);

    for _ in 0..3 {
        let err = loader.load(&source, &pool).await.unwrap_err();
        match err {
            Error::ModuleFetch { url, message } => {
                assert_eq!(url, MODULE_URL);
                assert!(message.contains("404"), "{message}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
    assert_eq!(fetcher.calls(MODULE_URL), 1);
    assert_eq!(engine.compiles(), 0);
}

#[tokio::test]
async fn test_empty_body_is_fetch_error() {
    let (_, _, loader, pool) = setup(FakeFetcher::new().route(MODULE_URL, b"", None));
    let err = loader.load(&MODULE_URL.into(), &pool).await.unwrap_err();
    assert!(matches!(err, Error::ModuleFetch { .. }));
}

#[tokio::test]
async fn test_compile_failure_is_memoized() {
    let (engine, fetcher, loader, pool) =
        setup(FakeFetcher::new().route(MODULE_URL, b"not wasm", Some("application/wasm")));
    let source = ModuleSource::from(MODULE_URL);

    let first = loader.load(&source, &pool).await.unwrap_err();
    let second = loader.load(&source, &pool).await.unwrap_err();
    assert_eq!(first, Error::ModuleCompile("invalid magic number".to_string()));
    assert_eq!(first, second);
    assert_eq!(fetcher.calls(MODULE_URL), 1);
    assert_eq!(engine.compiles(), 1);
}

#[tokio::test]
async fn test_disposed_pool_error_passes_through() {
    let (_, _, loader, pool) = setup(FakeFetcher::with_module());
    pool.dispose();
    let err = loader.load(&MODULE_URL.into(), &pool).await.unwrap_err();
    assert!(matches!(err, Error::PoolDisposed(_)));
}

#[tokio::test]
async fn test_worker_crash_during_compile_is_not_memoized() {
    init_tracing();
    let (engine, fetcher, loader, pool) = setup(FakeFetcher::with_module());
    let source = ModuleSource::from(MODULE_URL);
    engine.crash_next_compile();

    let err = loader.load(&source, &pool).await.unwrap_err();
    assert!(matches!(err, Error::WorkerCrashed(_)), "{err:?}");

    // The surviving channel compiles on the next load
    let module = loader.load(&source, &pool).await.unwrap();
    assert_eq!(engine.compiles(), 2);
    assert_eq!(fetcher.calls(MODULE_URL), 2);

    let again = loader.load(&source, &pool).await.unwrap();
    assert!(again.ptr_eq(&module));
    assert_eq!(engine.compiles(), 2);
}
