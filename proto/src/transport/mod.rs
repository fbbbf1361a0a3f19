//! Transports: the wire protocol deliberately knows nothing about the
//! underlying carrier, but something concrete is needed to accept and dial
//! connections.
//!
//! Two providers are implemented:
//!
//! - [`memory`] — an in-process `MemoryRouter` that hands out connected
//!   pairs of channel-backed [`crate::engine::FrameIo`] halves, backed by
//!   an mpsc/oneshot request registry. This is what the broker/client
//!   tests and the bundled demo run over.
//! - [`tcp`] (behind the `tcp` feature) — a length-delimited multipart
//!   framing over `tokio::net::TcpStream`, using `tokio-util`'s codec.
//!
//! Neither provider is hidden behind a shared trait object: both produce a
//! concrete `FrameIo` implementation that `PeerEngine::spawn` is generic
//! over, which keeps the hot path monomorphic and avoids a speculative
//! `dyn Transport` abstraction this crate has exactly one real consumer of.

pub mod memory;
#[cfg(feature = "tcp")]
pub mod tcp;
