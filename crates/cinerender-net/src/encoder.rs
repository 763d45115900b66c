//! Frame encoder seam on the worker side.
//!
//! Assembling, colour converting, compositing and compressing a frame all
//! live behind `FrameEncoder`; the worker protocol only moves the bytes.

use bytes::Bytes;

use cinerender_core::JobDescriptor;

pub trait FrameEncoder: Send + Sync {
    fn encode(&self, job: &JobDescriptor) -> anyhow::Result<Bytes>;
}

/// Returns the input image bytes unchanged. Useful for loopback checks of
/// the transport without a codec. A reusable JPEG2000 input is handed back
/// without copying.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughEncoder;

impl FrameEncoder for PassthroughEncoder {
    fn encode(&self, job: &JobDescriptor) -> anyhow::Result<Bytes> {
        match job.j2k() {
            Some(codestream) => Ok(codestream.clone()),
            None => Ok(Bytes::copy_from_slice(job.input.binary())),
        }
    }
}

impl<F> FrameEncoder for F
where
    F: Fn(&JobDescriptor) -> anyhow::Result<Bytes> + Send + Sync,
{
    fn encode(&self, job: &JobDescriptor) -> anyhow::Result<Bytes> {
        self(job)
    }
}
