//! cinerender-net: deadline-bounded transport, digest scopes and the
//! worker protocol, both the client that hands out render jobs and the
//! worker that serves them.

pub mod client;
pub mod encoder;
pub mod error;
pub mod protocol;
pub mod scope;
pub mod server;
pub mod socket;

pub use client::RenderClient;
pub use encoder::{FrameEncoder, PassthroughEncoder};
pub use error::ProtocolError;
pub use protocol::{EncodedResult, JobState, WorkerJob};
pub use scope::{ReadDigestScope, WriteDigestScope};
pub use server::{serve_connection, ShutdownHandle, WorkerServer};
pub use socket::{Connection, Deadline};
