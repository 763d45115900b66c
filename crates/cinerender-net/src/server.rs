//! Worker side of the render protocol.
//!
//! Each accepted connection carries exactly one job. A fixed pool of threads
//! serves connections; when every thread is busy the accept loop waits, so
//! at most `max_connections` jobs run at once.
//!
//! A request that fails its digest check is answered with a rejected result
//! header so the client can report a data fault instead of waiting for a
//! frame that will never come.

use std::any::Any;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use zerocopy::AsBytes;

use cinerender_core::config::CineRenderConfig;
use cinerender_core::wire::{ResultHeader, RESULT_REJECTED};
use cinerender_core::JobDescriptor;

use crate::encoder::FrameEncoder;
use crate::error::ProtocolError;
use crate::scope::{ReadDigestScope, WriteDigestScope};
use crate::socket::Connection;

const LISTEN_BACKLOG: i32 = 128;

// ── One connection ────────────────────────────────────────────────────────────

/// Serve the single job carried by `conn`: read and verify the request,
/// encode the frame, send it back under its own digest.
pub fn serve_connection(
    conn: &mut Connection,
    encoder: &dyn FrameEncoder,
    config: &CineRenderConfig,
) -> Result<()> {
    let io_timeout = config.network.io_timeout();
    let peer = conn.peer_addr();

    let (descriptor, verified) = {
        let mut scope = ReadDigestScope::new(conn);
        scope.reset_deadline(io_timeout);
        let header = scope.read_string(config.worker.max_header_bytes)?;
        scope.reset_deadline(io_timeout);
        let descriptor = JobDescriptor::from_metadata(&header, &mut *scope)?;
        scope.reset_deadline(io_timeout);
        let verified = scope.check()?;
        (descriptor, verified)
    };

    if !verified {
        tracing::warn!(?peer, "request failed digest check, rejecting");
        let mut scope = WriteDigestScope::new(conn);
        scope.reset_deadline(io_timeout);
        scope.write_bytes(ResultHeader::rejected().as_bytes())?;
        scope.finish()?;
        return Err(ProtocolError::DigestMismatch.into());
    }

    tracing::debug!(
        ?peer,
        time_s = descriptor.time_seconds(),
        out_width = descriptor.out_size.width,
        out_height = descriptor.out_size.height,
        eyes = ?descriptor.eyes,
        part = ?descriptor.part,
        subtitle = descriptor.subtitle.is_some(),
        "job received"
    );

    let started = Instant::now();
    let frame = encoder.encode(&descriptor).context("frame encoder failed")?;
    let length = u32::try_from(frame.len())
        .ok()
        .filter(|n| *n != RESULT_REJECTED)
        .ok_or_else(|| {
            ProtocolError::ProtocolFormat(format!("encoded frame of {} bytes", frame.len()))
        })?;

    let mut scope = WriteDigestScope::new(conn);
    scope.reset_deadline(io_timeout);
    scope.write_bytes(ResultHeader::new(length).as_bytes())?;
    scope.reset_deadline(io_timeout);
    scope.write_bytes(&frame)?;
    scope.reset_deadline(io_timeout);
    scope.finish()?;

    tracing::info!(
        ?peer,
        bytes = frame.len(),
        encode_ms = started.elapsed().as_millis() as u64,
        "job served"
    );
    Ok(())
}

// ── Server ────────────────────────────────────────────────────────────────────

pub struct WorkerServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    config: CineRenderConfig,
    encoder: Arc<dyn FrameEncoder>,
    stopping: Arc<AtomicBool>,
}

/// Stops a running `WorkerServer` from another thread.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    stopping: Arc<AtomicBool>,
    wake: SocketAddr,
}

impl ShutdownHandle {
    /// Ask the accept loop to stop. Jobs already in progress run to
    /// completion.
    pub fn shutdown(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        // Unblock accept().
        if let Err(e) = TcpStream::connect_timeout(&self.wake, Duration::from_secs(1)) {
            tracing::debug!(error = %e, "shutdown wake-up connect failed");
        }
    }
}

impl WorkerServer {
    pub fn bind(config: &CineRenderConfig, encoder: Arc<dyn FrameEncoder>) -> Result<Self> {
        let endpoint = config.network.listen_endpoint();
        let addr: SocketAddr = endpoint
            .parse()
            .with_context(|| format!("invalid listen address {endpoint}"))?;

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .context("failed to create listening socket")?;
        socket
            .set_reuse_address(true)
            .context("failed to set SO_REUSEADDR")?;
        socket
            .bind(&addr.into())
            .with_context(|| format!("failed to bind {addr}"))?;
        socket.listen(LISTEN_BACKLOG).context("failed to listen")?;

        let listener: TcpListener = socket.into();
        let local_addr = listener.local_addr().context("failed to read local address")?;
        tracing::info!(%local_addr, "render worker listening");

        Ok(Self {
            listener,
            local_addr,
            config: config.clone(),
            encoder,
            stopping: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        let ip = match self.local_addr.ip() {
            IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
            ip => ip,
        };
        ShutdownHandle {
            stopping: self.stopping.clone(),
            wake: SocketAddr::new(ip, self.local_addr.port()),
        }
    }

    /// Accept and serve connections until shut down.
    pub fn run(self) -> Result<()> {
        let threads = self.config.worker.connection_limit();
        let (tx, rx) = mpsc::sync_channel::<TcpStream>(0);
        let rx = Arc::new(Mutex::new(rx));

        let mut pool = Vec::with_capacity(threads);
        for n in 0..threads {
            let rx = rx.clone();
            let encoder = self.encoder.clone();
            let config = self.config.clone();
            let handle = thread::Builder::new()
                .name(format!("render-worker-{n}"))
                .spawn(move || worker_loop(&rx, encoder.as_ref(), &config))
                .context("failed to spawn worker thread")?;
            pool.push(handle);
        }
        tracing::info!(threads, "worker pool started");

        for incoming in self.listener.incoming() {
            if self.stopping.load(Ordering::SeqCst) {
                break;
            }
            match incoming {
                Ok(stream) => {
                    if tx.send(stream).is_err() {
                        tracing::error!("worker pool gone, stopping accept loop");
                        break;
                    }
                }
                Err(e) => tracing::warn!(error = %e, "accept failed"),
            }
        }

        drop(tx);
        for handle in pool {
            if handle.join().is_err() {
                tracing::error!("worker thread panicked");
            }
        }
        tracing::info!("render worker stopped");
        Ok(())
    }
}

fn worker_loop(rx: &Mutex<Receiver<TcpStream>>, encoder: &dyn FrameEncoder, config: &CineRenderConfig) {
    loop {
        let next = match rx.lock() {
            Ok(guard) => guard.recv(),
            Err(poisoned) => poisoned.into_inner().recv(),
        };
        let Ok(stream) = next else {
            return;
        };

        let mut conn = Connection::from_stream(stream, config.network.io_timeout());
        let peer = conn.peer_addr();
        tracing::debug!(?peer, "connection accepted");

        // A panicking encoder must not take a pool thread with it.
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| serve_connection(&mut conn, encoder, config)));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => match e.downcast_ref::<ProtocolError>() {
                Some(pe) if pe.is_data_fault() => {
                    tracing::warn!(?peer, error = %e, "job rejected")
                }
                _ => tracing::warn!(?peer, error = %format!("{e:#}"), "job failed"),
            },
            Err(payload) => {
                tracing::error!(?peer, panic = panic_message(payload.as_ref()), "job handler panicked")
            }
        }
        conn.close();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
