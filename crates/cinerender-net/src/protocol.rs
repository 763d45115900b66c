//! Worker protocol, client side: one render job over one connection.
//!
//! ```text
//! Idle -> Connecting -> SendHeader -> SendPayload      (write digest scope)
//!      -> AwaitResultHeader -> ReceiveResultPayload    (read digest scope)
//!      -> Verified -> Done
//! any state -> Failed
//! ```
//!
//! The request message is the metadata block followed by the binary
//! payloads, closed by one digest trailer. The reply is a 4-byte result
//! header and the encoded frame, closed by its own trailer. Nothing is
//! retried here; every failure discards the connection.

use std::time::Instant;

use bytes::Bytes;
use zerocopy::FromBytes;

use cinerender_core::config::{CineRenderConfig, NetworkConfig, WorkerConfig};
use cinerender_core::wire::{ResultHeader, WireError, DIGEST_LEN};
use cinerender_core::JobDescriptor;

use crate::error::{ProtocolError, Result};
use crate::scope::{ReadDigestScope, WriteDigestScope};
use crate::socket::Connection;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Idle,
    Connecting,
    SendHeader,
    SendPayload,
    AwaitResultHeader,
    ReceiveResultPayload,
    Verified,
    Done,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Done | JobState::Failed)
    }
}

/// An encoded frame as returned by a worker, with the digest it verified
/// against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedResult {
    pub data: Bytes,
    pub digest: [u8; DIGEST_LEN],
}

impl EncodedResult {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Drives a single render job against a single worker.
///
/// `run` may be called again for another job; each run opens its own
/// connection.
#[derive(Debug)]
pub struct WorkerJob {
    address: String,
    network: NetworkConfig,
    worker: WorkerConfig,
    state: JobState,
}

impl WorkerJob {
    pub fn new(address: impl Into<String>, config: &CineRenderConfig) -> Self {
        Self {
            address: address.into(),
            network: config.network.clone(),
            worker: config.worker.clone(),
            state: JobState::Idle,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// Send `descriptor` to the worker and wait for the encoded frame.
    pub fn run(&mut self, descriptor: &JobDescriptor) -> Result<EncodedResult> {
        self.state = JobState::Idle;
        let started = Instant::now();

        match self.exchange(descriptor) {
            Ok(result) => {
                self.transition(JobState::Done);
                tracing::info!(
                    worker = %self.address,
                    bytes = result.len(),
                    digest = hex::encode(&result.digest[..8]),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "render job done"
                );
                Ok(result)
            }
            Err(e) => {
                let failed_in = self.state;
                self.transition(JobState::Failed);
                tracing::warn!(
                    worker = %self.address,
                    state = ?failed_in,
                    error = %e,
                    data_fault = e.is_data_fault(),
                    "render job failed"
                );
                Err(e)
            }
        }
    }

    fn transition(&mut self, next: JobState) {
        tracing::debug!(worker = %self.address, from = ?self.state, to = ?next, "job state");
        self.state = next;
    }

    fn exchange(&mut self, descriptor: &JobDescriptor) -> Result<EncodedResult> {
        // Serialize before connecting so a bad descriptor never reaches the wire.
        let header = descriptor.to_metadata()?;
        if header.len() > self.worker.max_header_bytes {
            return Err(WireError::HeaderTooLarge(header.len(), self.worker.max_header_bytes).into());
        }

        self.transition(JobState::Connecting);
        let mut conn = Connection::connect(&self.address, self.network.connect_timeout())?;
        if self.network.send_buffer_size > 0 {
            if let Err(e) = conn.set_send_buffer_size(self.network.send_buffer_size) {
                tracing::debug!(error = %e, "SO_SNDBUF not set");
            }
        }

        let outcome = self.drive(&mut conn, &header, descriptor);
        conn.close();
        outcome
    }

    fn drive(
        &mut self,
        conn: &mut Connection,
        header: &str,
        descriptor: &JobDescriptor,
    ) -> Result<EncodedResult> {
        let io_timeout = self.network.io_timeout();

        // ── Request ──
        {
            let mut scope = WriteDigestScope::new(conn);

            self.transition(JobState::SendHeader);
            scope.reset_deadline(io_timeout);
            scope.write_string(header)?;

            self.transition(JobState::SendPayload);
            for payload in descriptor.binary_payloads() {
                scope.reset_deadline(io_timeout);
                scope.write_bytes(payload)?;
            }

            scope.reset_deadline(io_timeout);
            scope.finish()?;
        }
        tracing::debug!(
            worker = %self.address,
            header_bytes = header.len(),
            payload_bytes = descriptor.binary_len(),
            "request sent"
        );

        // ── Reply ──
        let mut scope = ReadDigestScope::new(conn);

        self.transition(JobState::AwaitResultHeader);
        scope.reset_deadline(io_timeout);
        let mut raw = [0u8; std::mem::size_of::<ResultHeader>()];
        scope.read_into(&mut raw)?;
        let result_header = ResultHeader::read_from(&raw[..])
            .ok_or_else(|| ProtocolError::ProtocolFormat("short result header".into()))?;

        if result_header.is_rejected() {
            tracing::warn!(worker = %self.address, "worker rejected request digest");
            return Err(ProtocolError::DigestMismatch);
        }
        let length = result_header.length.get() as usize;
        if length > self.worker.max_frame_bytes {
            return Err(ProtocolError::ProtocolFormat(format!(
                "result of {length} bytes exceeds limit {}",
                self.worker.max_frame_bytes
            )));
        }

        self.transition(JobState::ReceiveResultPayload);
        scope.reset_deadline(io_timeout);
        let data = scope.read_exact(length)?;

        scope.reset_deadline(io_timeout);
        let digest = scope.verify()?.ok_or(ProtocolError::DigestMismatch)?;
        self.transition(JobState::Verified);

        Ok(EncodedResult { data, digest })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
