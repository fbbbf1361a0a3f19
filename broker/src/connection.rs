//! A single accepted connection: the broker's view of one peer.
//!
//! Tracks a "dying timer" that closes the connection if nothing is heard
//! from it for a while. `Connection` wraps a `PeerEngine` and forwards
//! every inbound request/notification to the broker's single actor task
//! over an `mpsc` channel — it never tracks domains or tokens itself;
//! that bookkeeping lives entirely in the actor's own `ConnectionEntry`
//! map (`broker.rs`), so only the broker actor is allowed to own that
//! state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use pylar_proto::{CallError, EngineOwner, Frames, PeerEngine};
use slog::{debug, Logger};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::registry::{ConnectionId, Token};

pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Work handed from a `Connection` to the broker actor.
pub enum BrokerEvent {
    Connected {
        id: ConnectionId,
        engine: PeerEngine,
    },
    Request {
        connection: ConnectionId,
        args: Frames,
        reply: oneshot::Sender<Result<Frames, CallError>>,
    },
    Notification {
        connection: ConnectionId,
        args: Frames,
    },
    Disconnected {
        connection: ConnectionId,
    },
    /// Fed back into the actor's own channel once a delegated-authentication
    /// request completes, so the registry mutation it triggers still only
    /// ever happens on the actor task.
    RegisterResult {
        connection: ConnectionId,
        domain: Vec<u8>,
        token_result: Result<Token, CallError>,
        reply: oneshot::Sender<Result<Frames, CallError>>,
    },
    ShuttingDown {
        ack: oneshot::Sender<()>,
    },
}

/// Epoch-millis clock shared between a connection's activity hook and its
/// dying-timer watchdog task. Avoids needing an async-aware mutex just to
/// record "something happened."
struct ActivityClock {
    started: Instant,
    last_activity_millis: AtomicU64,
}

impl ActivityClock {
    fn new() -> Self {
        ActivityClock {
            started: Instant::now(),
            last_activity_millis: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let elapsed = self.started.elapsed().as_millis() as u64;
        self.last_activity_millis.store(elapsed, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let elapsed = self.started.elapsed().as_millis() as u64;
        let last = self.last_activity_millis.load(Ordering::Relaxed);
        Duration::from_millis(elapsed.saturating_sub(last))
    }
}

/// Forwards one connection's frames to the broker actor and answers its
/// `EngineOwner` callbacks by waiting on the actor's reply.
pub struct Connection {
    pub id: ConnectionId,
    events: mpsc::UnboundedSender<BrokerEvent>,
    activity: Arc<ActivityClock>,
}

impl Connection {
    pub fn new(events: mpsc::UnboundedSender<BrokerEvent>) -> Arc<Self> {
        Arc::new(Connection {
            id: Uuid::new_v4(),
            events,
            activity: Arc::new(ActivityClock::new()),
        })
    }

    /// Spawn the dying-timer watchdog: if no frame is heard from this
    /// connection within `timeout`, close its engine.
    pub fn spawn_dying_timer(&self, engine: PeerEngine, timeout: Duration, log: Logger) {
        let activity = self.activity.clone();
        tokio::spawn(async move {
            loop {
                let idle = activity.idle_for();
                if idle >= timeout {
                    debug!(log, "connection dying timer expired"; "timeout_secs" => timeout.as_secs());
                    engine.close();
                    break;
                }
                tokio::time::sleep(timeout - idle).await;
                if engine.state() != pylar_proto::State::Open {
                    break;
                }
            }
        });
    }
}

#[async_trait]
impl EngineOwner for Connection {
    async fn on_request(&self, payload: Frames) -> Result<Frames, CallError> {
        let (reply, reply_rx) = oneshot::channel();
        if self
            .events
            .send(BrokerEvent::Request {
                connection: self.id,
                args: payload,
                reply,
            })
            .is_err()
        {
            return Err(CallError::internal_error());
        }

        reply_rx.await.unwrap_or_else(|_| Err(CallError::internal_error()))
    }

    async fn on_notification(&self, payload: Frames) {
        let _ = self.events.send(BrokerEvent::Notification {
            connection: self.id,
            args: payload,
        });
    }

    fn on_activity(&self) {
        self.activity.touch();
    }
}
