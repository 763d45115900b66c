//! cinerender integration test harness.
//!
//! Every test runs a real worker on loopback and talks to it over TCP:
//!
//!   cargo test --test integration
//!
//! Each test owns the workers and proxies it spawns. Workers bind port 0,
//! so tests may run in parallel.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use bytes::Bytes;

use cinerender_core::config::CineRenderConfig;
use cinerender_core::image::J2kImageProxy;
use cinerender_core::{JobDescriptor, Size};
use cinerender_net::{FrameEncoder, ShutdownHandle, WorkerServer};

mod fault;
mod jobs;

// ── Harness ───────────────────────────────────────────────────────────────────

/// Loopback config with short deadlines.
pub fn test_config() -> CineRenderConfig {
    let mut config = CineRenderConfig::default();
    config.network.listen_address = "127.0.0.1".into();
    config.network.port = 0;
    config.network.connect_timeout_secs = 2;
    config.network.io_timeout_secs = 5;
    config.worker.max_connections = 4;
    config
}

/// A running worker. Dropping it stops the accept loop and waits for it.
pub struct WorkerGuard {
    pub addr: String,
    stop: ShutdownHandle,
    thread: Option<JoinHandle<Result<()>>>,
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.stop.shutdown();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

pub fn spawn_worker(encoder: Arc<dyn FrameEncoder>) -> Result<WorkerGuard> {
    let server = WorkerServer::bind(&test_config(), encoder).context("failed to bind worker")?;
    let addr = server.local_addr().to_string();
    let stop = server.shutdown_handle();
    let thread = std::thread::spawn(move || server.run());
    Ok(WorkerGuard {
        addr,
        stop,
        thread: Some(thread),
    })
}

/// Encoder that remembers every job it was given and returns a short,
/// job-dependent frame.
#[derive(Default)]
pub struct RecordingEncoder {
    pub jobs: Mutex<Vec<JobDescriptor>>,
    pub calls: AtomicUsize,
}

impl RecordingEncoder {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_job(&self) -> Option<JobDescriptor> {
        self.jobs.lock().ok()?.last().cloned()
    }
}

impl FrameEncoder for RecordingEncoder {
    fn encode(&self, job: &JobDescriptor) -> Result<Bytes> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut jobs) = self.jobs.lock() {
            jobs.push(job.clone());
        }
        Ok(Bytes::from(format!("frame@{}", job.time)))
    }
}

/// A DCP-sized job: 1998x1080 output, opaque J2K input of `payload_len`
/// bytes.
pub fn flat_job(payload_len: usize) -> JobDescriptor {
    let payload: Vec<u8> = (0..payload_len).map(|i| (i % 251) as u8).collect();
    let input = J2kImageProxy::new(Size::new(1998, 1080), Bytes::from(payload));
    JobDescriptor::new(Arc::new(input), Size::new(1998, 1080))
}
