//! A TCP transport using `tokio-util`'s length-delimited codec to frame a
//! multipart message as a count-prefixed sequence of count-prefixed frames.
//!
//! This exists so the broker and client can be run across a real network
//! instead of only in-process. Only host/port configuration is provided —
//! no TLS, no reconnection backoff at this layer (that lives in
//! `pylar-client`'s session, which redials through a fresh
//! `TcpRouter::connect`).

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use futures::{SinkExt, StreamExt};

use crate::engine::FrameIo;
use crate::error::{Error, ErrorKind};
use crate::wire::Frames;

/// A single multipart message, wire-encoded as a 4-byte big-endian frame
/// count followed by that many length-delimited frames.
fn encode_message(frames: &Frames) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u32(frames.len() as u32);
    for frame in frames {
        buf.put_u32(frame.len() as u32);
        buf.put_slice(frame);
    }
    buf.freeze()
}

fn decode_message(mut bytes: Bytes) -> Option<Frames> {
    if bytes.len() < 4 {
        return None;
    }
    let count = bytes.get_u32() as usize;
    let mut frames = Vec::with_capacity(count);
    for _ in 0..count {
        if bytes.len() < 4 {
            return None;
        }
        let len = bytes.get_u32() as usize;
        if bytes.len() < len {
            return None;
        }
        frames.push(bytes.split_to(len));
    }
    Some(frames)
}

/// One TCP connection, framed as whole multipart messages.
pub struct TcpIo {
    inner: Framed<TcpStream, LengthDelimitedCodec>,
}

impl TcpIo {
    fn new(stream: TcpStream) -> Self {
        TcpIo {
            inner: Framed::new(stream, LengthDelimitedCodec::new()),
        }
    }
}

#[async_trait]
impl FrameIo for TcpIo {
    async fn read(&mut self) -> Option<Frames> {
        loop {
            let bytes = self.inner.next().await?.ok()?;
            if let Some(frames) = decode_message(bytes.freeze()) {
                return Some(frames);
            }
            // a malformed on-wire length prefix: drop the message, same
            // policy as `wire::parse` dropping a short multipart message.
        }
    }

    async fn write(&mut self, frames: Frames) -> Result<(), Error> {
        self.inner
            .send(encode_message(&frames))
            .await
            .map_err(Error::from)
    }
}

/// A TCP listener/dialer pair, analogous in role to `MemoryRouter` but
/// backed by a real socket.
pub struct TcpRouter {
    listener: TcpListener,
}

impl TcpRouter {
    pub async fn bind(addr: &str) -> Result<Self, Error> {
        let listener = TcpListener::bind(addr).await?;
        Ok(TcpRouter { listener })
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr, Error> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn accept(&self) -> Option<TcpIo> {
        let (stream, _) = self.listener.accept().await.ok()?;
        let _ = stream.set_nodelay(true);
        Some(TcpIo::new(stream))
    }

    pub async fn connect(addr: &str) -> Result<TcpIo, Error> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|_| Error::from(ErrorKind::TransportClosed))?;
        let _ = stream.set_nodelay(true);
        Ok(TcpIo::new(stream))
    }
}
