//! The peer protocol engine (PPE).
//!
//! One `PeerEngine` owns exactly one connection's read/write loop, its
//! pending-request correlation table and its heartbeat. A receiving loop
//! and a heartbeat loop run as background tasks, correlating replies
//! through a pending-request map keyed by request id, and dispatching
//! `on_request`/`on_notification` callbacks to an `EngineOwner`
//! implementation handed in at construction time. Per-message handling
//! runs as an independently spawned task rather than inline, so a slow
//! handler for one request can't stall the read loop.
//!
//! The transport's read and write halves are both driven from one task
//! (`run`), selecting between "a frame arrived" and "something wants to
//! send a frame", which mirrors the single-threaded event loop the Python
//! original relies on for implicit write serialization, and keeps the
//! transport itself out of reach of every other task; everyone else talks
//! to the engine only through its channel-backed handle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use slog::{debug, o, warn, Logger};
use tokio::sync::{mpsc, oneshot};
use tokio::time::interval;

use crate::error::{CallError, Error, ErrorKind};
use crate::wire::{self, Frames, Incoming, RequestId};

/// Transport-agnostic read/write pair used by a `PeerEngine`.
///
/// A `Transport` implementation (see `crate::transport`) hands one of these
/// to the engine per accepted or dialed connection; the engine never knows
/// whether the bytes underneath came from an in-process channel or a TCP
/// socket.
#[async_trait]
pub trait FrameIo: Send {
    /// Read the next multipart message, or `None` on transport closure.
    async fn read(&mut self) -> Option<Frames>;
    async fn write(&mut self, frames: Frames) -> Result<(), Error>;
}

/// Callbacks invoked by a `PeerEngine` as frames arrive.
///
/// Implementors are handed to the engine rather than subclassing it.
#[async_trait]
pub trait EngineOwner: Send + Sync + 'static {
    async fn on_request(&self, payload: Frames) -> Result<Frames, CallError>;
    async fn on_notification(&self, payload: Frames);

    /// Called synchronously for every successfully-parsed incoming frame,
    /// including pings — the broker's per-connection dying timer resets
    /// from here.
    fn on_activity(&self) {}
}

/// The connection's lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Open,
    Closing,
    Closed,
}

struct Pending {
    reply_tx: oneshot::Sender<Result<Frames, CallError>>,
}

enum Outbound {
    Frames(Frames),
    Shutdown,
}

struct Shared {
    state: Mutex<State>,
    pending: Mutex<HashMap<u64, Pending>>,
    next_id: AtomicU64,
    out_tx: mpsc::UnboundedSender<Outbound>,
    closing: tokio::sync::watch::Sender<bool>,
    log: Logger,
}

/// A handle to a running peer engine.
///
/// Cloning shares the same underlying connection. The connection itself is
/// driven by a single spawned task (see `PeerEngine::spawn`); every method
/// on this handle only ever touches the shared correlation table or sends
/// on a channel, never the transport directly.
#[derive(Clone)]
pub struct PeerEngine {
    shared: Arc<Shared>,
}

const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(3);

impl PeerEngine {
    /// Spawn the engine's read/write/heartbeat loops for `io`, returning a
    /// handle that can issue requests and notifications.
    ///
    /// `owner` receives inbound requests/notifications; its callbacks run
    /// as independently spawned tasks so one slow handler cannot stall the
    /// read loop.
    pub fn spawn<IO>(io: IO, owner: Arc<dyn EngineOwner>, log: Logger) -> PeerEngine
    where
        IO: FrameIo + 'static,
    {
        let (out_tx, out_rx) = mpsc::unbounded_channel::<Outbound>();
        let (closing, _) = tokio::sync::watch::channel(false);

        let shared = Arc::new(Shared {
            state: Mutex::new(State::Open),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            out_tx,
            closing,
            log,
        });

        let engine = PeerEngine { shared: shared.clone() };

        let run_engine = engine.clone();
        tokio::spawn(async move {
            run(io, out_rx, owner, run_engine).await;
        });

        let heartbeat_engine = engine.clone();
        tokio::spawn(async move {
            heartbeat_loop(heartbeat_engine).await;
        });

        engine
    }

    pub fn state(&self) -> State {
        *self.shared.state.lock()
    }

    /// Mark the engine as closing: no new requests are accepted, the
    /// heartbeat loop stops, and every in-flight inbound-processing task is
    /// signalled to abandon its handler and answer 408 instead (see
    /// `handle_incoming`'s `tokio::select!` against `closing_rx`).
    pub fn close(&self) {
        let mut state = self.shared.state.lock();
        if *state == State::Open {
            *state = State::Closing;
        }
        let _ = self.shared.closing.send(true);
        let _ = self.shared.out_tx.send(Outbound::Shutdown);
    }

    /// Subscribe to the engine's closing signal. An inbound-processing task
    /// races its handler call against this so that closing the engine mid-
    /// handler converts into a 408 response rather than an abandoned task.
    fn closing_rx(&self) -> tokio::sync::watch::Receiver<bool> {
        self.shared.closing.subscribe()
    }

    fn mark_closed(&self) {
        *self.shared.state.lock() = State::Closed;
        self.cancel_pending(CallError::request_cancelled());
    }

    /// Fail every pending request with `reason`, the way
    /// `GenericClient.cancel_pending_requests` cancels every outstanding
    /// future on closure.
    pub fn cancel_pending(&self, reason: CallError) {
        let pending: Vec<_> = self.shared.pending.lock().drain().collect();
        for (_, p) in pending {
            let _ = p.reply_tx.send(Err(reason.clone()));
        }
    }

    fn next_id(&self) -> RequestId {
        RequestId(self.shared.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Send a request and await its response, or a `CallError` if the peer
    /// replied with a non-200 code, if the reply was malformed, or if the
    /// engine closed before a reply arrived.
    pub async fn request(&self, payload: Frames) -> Result<Frames, CallError> {
        if self.state() != State::Open {
            return Err(CallError::request_cancelled());
        }

        let id = self.next_id();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.shared.pending.lock().insert(id.0, Pending { reply_tx });

        if self
            .shared
            .out_tx
            .send(Outbound::Frames(wire::encode_request(id, payload)))
            .is_err()
        {
            self.shared.pending.lock().remove(&id.0);
            return Err(CallError::request_cancelled());
        }

        match reply_rx.await {
            Ok(result) => result,
            // the sender was dropped without a reply: treat it the way
            // `_request`'s future treats `asyncio.CancelledError`.
            Err(_) => Err(CallError::request_cancelled()),
        }
    }

    pub fn notify(&self, payload: Frames) {
        let id = self.next_id();
        let _ = self
            .shared
            .out_tx
            .send(Outbound::Frames(wire::encode_notification(id, payload)));
    }

    fn send_ping(&self) {
        let id = self.next_id();
        let _ = self.shared.out_tx.send(Outbound::Frames(wire::encode_ping(id)));
    }

    fn send_pong(&self, id: RequestId) {
        let _ = self.shared.out_tx.send(Outbound::Frames(wire::encode_pong(id)));
    }

    fn send_response_ok(&self, id: RequestId, payload: Frames) {
        let _ = self
            .shared
            .out_tx
            .send(Outbound::Frames(wire::encode_response_ok(id, payload)));
    }

    fn send_response_err(&self, id: RequestId, err: &CallError) {
        let _ = self.shared.out_tx.send(Outbound::Frames(wire::encode_response_err(
            id, err.code, &err.message,
        )));
    }

    fn complete(&self, id: RequestId, result: Result<Frames, CallError>) {
        if let Some(pending) = self.shared.pending.lock().remove(&id.0) {
            let _ = pending.reply_tx.send(result);
        }
    }
}

async fn run<IO: FrameIo>(
    mut io: IO,
    mut out_rx: mpsc::UnboundedReceiver<Outbound>,
    owner: Arc<dyn EngineOwner>,
    engine: PeerEngine,
) {
    let log = engine.shared.log.new(o!("loop" => "engine"));
    loop {
        tokio::select! {
            maybe_frames = io.read() => {
                match maybe_frames {
                    Some(frames) => handle_incoming(&engine, &owner, frames, &log),
                    None => {
                        debug!(log, "transport closed");
                        break;
                    }
                }
            }
            outbound = out_rx.recv() => {
                match outbound {
                    Some(Outbound::Frames(frames)) => {
                        if let Err(err) = io.write(frames).await {
                            warn!(log, "failed to write frames"; "error" => %err);
                            break;
                        }
                    }
                    Some(Outbound::Shutdown) | None => break,
                }
            }
        }
    }
    engine.mark_closed();
}

fn handle_incoming(engine: &PeerEngine, owner: &Arc<dyn EngineOwner>, frames: Frames, log: &Logger) {
    let parsed = match wire::parse(frames) {
        Some(p) => p,
        // malformed multipart message: silently dropped, the way
        // `__receiving_loop` swallows the `IndexError`.
        None => {
            debug!(log, "dropping malformed frame");
            return;
        }
    };

    owner.on_activity();

    match parsed {
        Incoming::Request { id, payload } => {
            let engine = engine.clone();
            let owner = owner.clone();
            let log = log.clone();
            let mut closing_rx = engine.closing_rx();
            tokio::spawn(async move {
                tokio::select! {
                    result = owner.on_request(payload) => {
                        match result {
                            Ok(reply) => engine.send_response_ok(id, reply),
                            Err(err) => engine.send_response_err(id, &err),
                        }
                    }
                    // the engine started closing while this handler was
                    // still running: abandon it and answer 408 instead of
                    // leaving the caller's request pending forever, the way
                    // spec.md's cancellation-on-`CLOSING` rule requires.
                    _ = closing_rx.changed() => {
                        debug!(log, "inbound request cancelled by engine closing");
                        engine.send_response_err(id, &CallError::request_timed_out());
                    }
                }
            });
        }
        Incoming::Notification { id: _, payload } => {
            let owner = owner.clone();
            tokio::spawn(async move {
                owner.on_notification(payload).await;
            });
        }
        Incoming::ResponseOk { id, payload } => engine.complete(id, Ok(payload)),
        Incoming::ResponseErr { id, code, message } => {
            engine.complete(id, Err(CallError::new(code, message)))
        }
        Incoming::Ping { id } => engine.send_pong(id),
        Incoming::Pong { .. } => {}
    }
}

async fn heartbeat_loop(engine: PeerEngine) {
    let mut ticker = interval(DEFAULT_PING_INTERVAL);
    loop {
        ticker.tick().await;
        if engine.state() != State::Open {
            break;
        }
        engine.send_ping();
    }
}

/// Map an infrastructure `Error` onto the `CallError` surfaced to a peer,
/// the way `GenericClient.__process_request`'s catch-all branch folds any
/// unexpected exception into a `500`.
pub fn error_to_call_error(err: &Error) -> CallError {
    match err.0 {
        ErrorKind::TransportClosed | ErrorKind::EngineClosing => {
            CallError::request_cancelled()
        }
        _ => CallError::internal_error(),
    }
}
