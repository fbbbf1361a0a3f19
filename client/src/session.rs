//! Thin convenience wrapper around one `PeerEngine` connected to a broker.
//!
//! Each method just builds a command-tagged frame list and hands it to the
//! underlying engine's request/response machinery. `ClientSession` carries
//! no registration bookkeeping of its own: that lives in
//! `crate::proxy::ClientProxy`.

use bytes::Bytes;
use pylar_proto::{codec, CallError, Frames, PeerEngine};

pub struct ClientSession {
    engine: PeerEngine,
}

impl ClientSession {
    pub fn new(engine: PeerEngine) -> Self {
        ClientSession { engine }
    }

    pub fn engine(&self) -> &PeerEngine {
        &self.engine
    }

    /// `register`: returns the token issued for `domain`.
    pub async fn register(&self, domain: impl Into<Bytes>, credentials: impl Into<Bytes>) -> Result<Bytes, CallError> {
        let reply = self
            .engine
            .request(vec![Bytes::from_static(b"register"), domain.into(), credentials.into()])
            .await?;
        reply.into_iter().next().ok_or_else(CallError::invalid_reply)
    }

    pub async fn unregister(&self, domain: impl Into<Bytes>) -> Result<(), CallError> {
        self.engine
            .request(vec![Bytes::from_static(b"unregister"), domain.into()])
            .await?;
        Ok(())
    }

    /// `request`: forward `args` from `domain` to `target_domain`.
    pub async fn request(
        &self,
        domain: impl Into<Bytes>,
        target_domain: impl Into<Bytes>,
        args: Frames,
    ) -> Result<Frames, CallError> {
        let mut payload = vec![Bytes::from_static(b"request"), domain.into(), target_domain.into()];
        payload.extend(args);
        self.engine.request(payload).await
    }

    /// `notification`: fire-and-forget `type_`-tagged frames from `domain`
    /// to `target_domain`. No reply is expected or possible at this layer —
    /// ground truth: `generic_client.py`'s `_notification` plus
    /// `broker.py`'s `__process_notification` frame order
    /// (`[type_, domain, target_domain, *args]`).
    pub fn notify(
        &self,
        domain: impl Into<Bytes>,
        target_domain: impl Into<Bytes>,
        type_: impl Into<Bytes>,
        args: Frames,
    ) {
        let mut payload = vec![type_.into(), domain.into(), target_domain.into()];
        payload.extend(args);
        self.engine.notify(payload);
    }

    /// `ping`: returns the broker's uid, so callers can
    /// detect a broker restart by comparing it across two pings.
    pub async fn ping(&self) -> Result<Bytes, CallError> {
        let reply = self.engine.request(vec![Bytes::from_static(b"ping")]).await?;
        reply.into_iter().next().ok_or_else(CallError::invalid_reply)
    }

    /// Ask a remote service to describe its methods.
    pub async fn describe(
        &self,
        domain: impl Into<Bytes>,
        target_domain: impl Into<Bytes>,
    ) -> Result<serde_json::Value, CallError> {
        let result = self.request(domain, target_domain, vec![Bytes::from_static(b"describe")]).await?;
        let frame = result.first().ok_or_else(CallError::invalid_reply)?;
        codec::deserialize(frame).map_err(|_| CallError::invalid_reply())
    }

    /// Remote method call: sends
    /// `[b"method_call", method, serialize(args), serialize(kwargs)]`.
    pub async fn method_call(
        &self,
        domain: impl Into<Bytes>,
        target_domain: impl Into<Bytes>,
        method: &str,
        args: &serde_json::Value,
        kwargs: &serde_json::Value,
    ) -> Result<serde_json::Value, CallError> {
        let payload = vec![
            Bytes::from_static(b"method_call"),
            Bytes::copy_from_slice(method.as_bytes()),
            codec::serialize(args).map_err(|_| CallError::internal_error())?,
            codec::serialize(kwargs).map_err(|_| CallError::internal_error())?,
        ];
        let result = self.request(domain, target_domain, payload).await?;
        let frame = result.first().ok_or_else(CallError::invalid_reply)?;
        codec::deserialize(frame).map_err(|_| CallError::invalid_reply())
    }
}
