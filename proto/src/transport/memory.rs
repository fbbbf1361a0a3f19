//! An in-process transport: two channel-backed halves wired directly to
//! each other, no bytes serialized in between.
//!
//! This is the transport the broker's own test suite and the bundled demo
//! run over: connect two ends of a pair of `mpsc` channels rather than a
//! real socket, so the whole suite stays fast and deterministic.

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use crate::engine::FrameIo;
use crate::error::{Error, ErrorKind};
use crate::wire::Frames;

/// One half of an in-process connection.
pub struct MemoryIo {
    tx: mpsc::UnboundedSender<Frames>,
    rx: mpsc::UnboundedReceiver<Frames>,
}

#[async_trait]
impl FrameIo for MemoryIo {
    async fn read(&mut self) -> Option<Frames> {
        self.rx.recv().await
    }

    async fn write(&mut self, frames: Frames) -> Result<(), Error> {
        self.tx
            .send(frames)
            .map_err(|_| Error::from(ErrorKind::TransportClosed))
    }
}

/// A broker-side listener that vends `MemoryIo` pairs to in-process
/// clients. `connect` is synchronous and can be called from any number of
/// clients concurrently; `accept` is the broker's half of the rendezvous.
pub struct MemoryRouter {
    accept_tx: mpsc::UnboundedSender<MemoryIo>,
    accept_rx: Mutex<mpsc::UnboundedReceiver<MemoryIo>>,
}

impl MemoryRouter {
    pub fn new() -> Self {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        MemoryRouter {
            accept_tx,
            accept_rx: Mutex::new(accept_rx),
        }
    }

    /// Accept the next incoming in-process connection, or `None` once every
    /// `connect`-ing handle and the router itself have been dropped.
    pub async fn accept(&self) -> Option<MemoryIo> {
        self.accept_rx.lock().await.recv().await
    }

    /// Dial this router, returning the client's half of the pair. The
    /// server's half is queued for a concurrent or future `accept` call.
    pub fn connect(&self) -> Result<MemoryIo, Error> {
        let (client_tx, server_rx) = mpsc::unbounded_channel();
        let (server_tx, client_rx) = mpsc::unbounded_channel();

        self.accept_tx
            .send(MemoryIo {
                tx: server_tx,
                rx: server_rx,
            })
            .map_err(|_| Error::from(ErrorKind::TransportClosed))?;

        Ok(MemoryIo {
            tx: client_tx,
            rx: client_rx,
        })
    }
}

impl Default for MemoryRouter {
    fn default() -> Self {
        MemoryRouter::new()
    }
}
