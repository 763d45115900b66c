//! Error taxonomy for the transport and worker protocol.
//!
//! Every variant is terminal for the current job and the current
//! connection. `DigestMismatch` is the only data fault; everything else is a
//! transport or format fault.

use cinerender_core::descriptor::DescriptorError;
use cinerender_core::wire::WireError;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("timed out connecting to {0}")]
    ConnectTimeout(String),

    #[error("connection refused by {0}")]
    ConnectionRefused(String),

    #[error("failed to connect to {addr}: {source}")]
    ConnectionFailed {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out writing to socket")]
    WriteTimeout,

    #[error("timed out reading from socket")]
    ReadTimeout,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("malformed message: {0}")]
    ProtocolFormat(String),

    #[error("digest mismatch: payload received but failed integrity check")]
    DigestMismatch,
}

impl ProtocolError {
    /// The bytes arrived but were not the bytes that were sent.
    pub fn is_data_fault(&self) -> bool {
        matches!(self, ProtocolError::DigestMismatch)
    }

    /// The link itself failed: connect, timeout or close.
    pub fn is_transport_fault(&self) -> bool {
        matches!(
            self,
            ProtocolError::ConnectTimeout(_)
                | ProtocolError::ConnectionRefused(_)
                | ProtocolError::ConnectionFailed { .. }
                | ProtocolError::WriteTimeout
                | ProtocolError::ReadTimeout
                | ProtocolError::ConnectionClosed
        )
    }
}

impl From<WireError> for ProtocolError {
    fn from(e: WireError) -> Self {
        ProtocolError::ProtocolFormat(e.to_string())
    }
}

impl From<DescriptorError> for ProtocolError {
    fn from(e: DescriptorError) -> Self {
        ProtocolError::ProtocolFormat(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
