//! `pylar-proto`: the framed request/response/notification/ping wire
//! protocol and the peer engine that drives one connection of it.
//!
//! This crate knows nothing about domains, registration or authentication —
//! that is `pylar-broker` and `pylar-client`'s job. It only knows how to
//! turn a `Vec<Bytes>` multipart message into an `Incoming` value, and how
//! to correlate requests with their eventual responses over one connection.

pub mod codec;
pub mod engine;
pub mod error;
pub mod transport;
pub mod wire;

pub use engine::{EngineOwner, FrameIo, PeerEngine, State};
pub use error::{CallError, Error, ErrorKind};
pub use wire::{Frames, Incoming, RequestId};
