//! Shared fakes for the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use c2pa_reader::error::{Error, Result};
use c2pa_reader::fetch::{FetchedBody, HttpFetch};
use c2pa_reader::module::CompiledModule;
use c2pa_reader::worker::VerificationEngine;
use serde_json::{json, Map, Value};

pub const MODULE_URL: &str = "https://cdn.example.com/toolkit_bg.wasm";
pub const REMOTE_MANIFEST_URL: &str = "https://manifests.example.com/remote.c2pa";

/// Engine whose behaviour is selected by the asset bytes.
///
/// - `slow...` sleeps for [`FakeEngine::SLOW`] first
/// - `gated...` blocks until [`FakeEngine::release`] is called for it
/// - `...panic` panics
/// - `plain` reports missing provenance
/// - `nojumbf` reports an unrecognised container
/// - `remote` points at [`REMOTE_MANIFEST_URL`]
/// - `remote-nourl` points at a remote manifest without a url
/// - `boom` fails with an engine-specific error
/// - anything else yields a one-manifest store titled with the asset text
#[derive(Default)]
pub struct FakeEngine {
    compiles: AtomicUsize,
    reports: AtomicUsize,
    running: AtomicUsize,
    max_running: AtomicUsize,
    arrivals: Mutex<Vec<String>>,
    mime_types: Mutex<Vec<String>>,
    crash_next_compile: AtomicBool,
    released: Mutex<HashSet<String>>,
    gate: Condvar,
}

impl FakeEngine {
    pub const SLOW: Duration = Duration::from_millis(100);

    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn compiles(&self) -> usize {
        self.compiles.load(Ordering::SeqCst)
    }

    pub fn reports(&self) -> usize {
        self.reports.load(Ordering::SeqCst)
    }

    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    /// Assets in the order `get_report` saw them.
    pub fn arrivals(&self) -> Vec<String> {
        self.arrivals.lock().unwrap().clone()
    }

    pub fn mime_types(&self) -> Vec<String> {
        self.mime_types.lock().unwrap().clone()
    }

    /// Make the next `compile_module` panic on its worker.
    pub fn crash_next_compile(&self) {
        self.crash_next_compile.store(true, Ordering::SeqCst);
    }

    /// Let the gated asset `asset` finish.
    pub fn release(&self, asset: &str) {
        self.released.lock().unwrap().insert(asset.to_string());
        self.gate.notify_all();
    }

    fn wait_for_release(&self, asset: &str) {
        let mut released = self.released.lock().unwrap();
        while !released.contains(asset) {
            released = self.gate.wait(released).unwrap();
        }
    }
}

pub fn store_for(title: &str, mime_type: &str) -> Value {
    json!({
        "active_manifest": "urn:uuid:fake",
        "manifests": {
            "urn:uuid:fake": {
                "claim_generator": "Fake_Engine/1.0.0 c2pa-rs/0.1.0",
                "title": title,
                "format": mime_type
            }
        }
    })
}

impl VerificationEngine for FakeEngine {
    fn compile_module(&self, source: Bytes) -> Result<CompiledModule> {
        self.compiles.fetch_add(1, Ordering::SeqCst);
        if self.crash_next_compile.swap(false, Ordering::SeqCst) {
            panic!("engine fault while compiling");
        }
        if source.as_ref() == b"not wasm" {
            return Err(Error::ModuleCompile("invalid magic number".to_string()));
        }
        Ok(CompiledModule::new(source, "fake artifact".to_string()))
    }

    fn get_report(&self, _module: &CompiledModule, asset: &[u8], mime_type: &str) -> Result<Value> {
        self.reports.fetch_add(1, Ordering::SeqCst);
        let asset = String::from_utf8_lossy(asset).into_owned();
        self.arrivals.lock().unwrap().push(asset.clone());
        self.mime_types.lock().unwrap().push(mime_type.to_string());

        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(running, Ordering::SeqCst);
        if asset.starts_with("slow") {
            std::thread::sleep(Self::SLOW);
        }
        if asset.starts_with("gated") {
            self.wait_for_release(&asset);
        }
        self.running.fetch_sub(1, Ordering::SeqCst);

        if asset.ends_with("panic") {
            panic!("engine fault on {asset}");
        }

        match asset.as_str() {
            "plain" => Err(Error::ProvenanceMissing("no JUMBF data found".to_string())),
            "nojumbf" => Err(Error::ContainerFormatNotRecognized(
                "unsupported container".to_string(),
            )),
            "remote" => Err(Error::RemoteManifestPointer {
                url: Some(REMOTE_MANIFEST_URL.to_string()),
                message: "manifest is stored remotely".to_string(),
            }),
            "remote-nourl" => Err(Error::RemoteManifestPointer {
                url: None,
                message: "manifest is stored remotely".to_string(),
            }),
            "boom" => Err(Error::Unknown {
                kind: "Toolkit(Other)".to_string(),
                message: "engine exploded".to_string(),
                fields: Map::new(),
            }),
            title => Ok(store_for(title, mime_type)),
        }
    }

    fn get_report_from_asset_and_manifest_buffer(
        &self,
        _module: &CompiledModule,
        manifest: &[u8],
        _asset: &[u8],
        mime_type: &str,
    ) -> Result<Value> {
        Ok(store_for(&String::from_utf8_lossy(manifest), mime_type))
    }

    fn scan_input(&self, _module: &CompiledModule, data: &[u8]) -> Result<Value> {
        Ok(json!({ "found": data.starts_with(b"jumb") }))
    }
}

/// In-memory [`HttpFetch`] answering from a fixed table.
#[derive(Default)]
pub struct FakeFetcher {
    routes: HashMap<String, Result<FetchedBody>>,
    delay: Option<Duration>,
    calls: Mutex<HashMap<String, usize>>,
}

impl FakeFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fetcher that serves a valid module at [`MODULE_URL`].
    pub fn with_module() -> Self {
        Self::new().route(MODULE_URL, b"\0asm\x01\0\0\0", Some("application/wasm"))
    }

    pub fn route(mut self, url: &str, body: &'static [u8], content_type: Option<&str>) -> Self {
        self.routes
            .insert(url.to_string(), Ok(FetchedBody::new(body, content_type)));
        self
    }

    pub fn fail(mut self, url: &str, status: u16) -> Self {
        self.routes.insert(
            url.to_string(),
            Err(Error::Fetch {
                url: url.to_string(),
                status: Some(status),
                message: format!("HTTP {status}"),
            }),
        );
        self
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self, url: &str) -> usize {
        self.calls.lock().unwrap().get(url).copied().unwrap_or(0)
    }
}

#[async_trait]
impl HttpFetch for FakeFetcher {
    async fn get(&self, url: &str) -> Result<FetchedBody> {
        *self.calls.lock().unwrap().entry(url.to_string()).or_default() += 1;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.routes.get(url).cloned().unwrap_or_else(|| {
            Err(Error::Fetch {
                url: url.to_string(),
                status: None,
                message: "connection refused".to_string(),
            })
        })
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
