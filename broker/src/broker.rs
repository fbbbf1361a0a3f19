//! The broker actor.
//!
//! A single task owns the `DomainRegistry` and the connection map
//! exclusively, draining a channel of `BrokerEvent`s produced by every
//! connection's `EngineOwner` callbacks. Forwarding a request to another
//! connection, or delegating authentication, means handing that
//! connection's `PeerEngine` handle to a freshly spawned task and awaiting
//! its reply there — never inside the actor loop — so one slow recipient
//! can never stall the broker from servicing everyone else.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use pylar_proto::{CallError, Frames, PeerEngine};
use slog::{debug, info, o, warn, Logger};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::connection::{BrokerEvent, Connection};
use crate::domain::{self, SERVICE_AUTHENTICATION_DOMAIN, SERVICE_LINK_DOMAIN};
use crate::registry::{ConnectionId, DomainRegistry, Token};

/// How long broker shutdown waits for connections to close on their own
/// before dropping the stragglers and returning anyway.
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(2);

/// Per-connection bookkeeping the actor owns directly: the engine handle
/// used to forward work to it, and the domains it currently serves with
/// their tokens.
struct ConnectionEntry {
    engine: PeerEngine,
    domains: HashMap<Vec<u8>, Token>,
}

struct ActorState {
    registry: DomainRegistry,
    connections: HashMap<ConnectionId, ConnectionEntry>,
    uid: Bytes,
    shared_secret: Bytes,
    log: Logger,
}

/// A running broker. Holds the sender half of its own event channel so new
/// connections (accepted from any number of listeners) can all feed the
/// same actor.
#[derive(Clone)]
pub struct Broker {
    events: mpsc::UnboundedSender<BrokerEvent>,
    log: Logger,
    connection_timeout: Duration,
}

impl Broker {
    /// Spawn the actor task and return a handle plus the broker's uid (a
    /// fresh `Uuid` each run, constant for the process lifetime).
    /// `connection_timeout` governs the dying-timer watchdog
    /// (see [`Connection::spawn_dying_timer`](crate::connection::Connection::spawn_dying_timer));
    /// `main.rs` passes `DEFAULT_CONNECTION_TIMEOUT`, tests pass something
    /// short to exercise a silent-death scenario without a
    /// real ten-second wait.
    pub fn spawn(shared_secret: impl Into<Bytes>, connection_timeout: Duration, log: Logger) -> Broker {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let uid = Bytes::copy_from_slice(Uuid::new_v4().as_bytes());

        let state = ActorState {
            registry: DomainRegistry::new(),
            connections: HashMap::new(),
            uid,
            shared_secret: shared_secret.into(),
            log: log.clone(),
        };

        let actor_events = events_tx.clone();
        tokio::spawn(async move {
            run_actor(events_rx, state, actor_events).await;
        });

        Broker { events: events_tx, log, connection_timeout }
    }

    /// Wire up one freshly-accepted transport connection. Callers drive
    /// their own accept loop (over a `MemoryRouter` or `TcpRouter`) and
    /// hand each accepted `FrameIo` here; the broker doesn't care which
    /// listener it came from — a single domain registry is shared across
    /// all endpoints.
    pub fn handle_connection<IO>(&self, io: IO)
    where
        IO: pylar_proto::FrameIo + 'static,
    {
        let connection = Connection::new(self.events.clone());
        let id = connection.id;
        let conn_log = self.log.new(o!("connection" => id.to_string()));
        let engine = PeerEngine::spawn(io, connection.clone(), conn_log.clone());

        connection.spawn_dying_timer(engine.clone(), self.connection_timeout, conn_log.clone());

        let _ = self.events.send(BrokerEvent::Connected { id, engine: engine.clone() });

        let events = self.events.clone();
        tokio::spawn(async move {
            // There is no separate "connection closed" signal from the
            // engine today beyond its state; poll it coarsely.
            loop {
                tokio::time::sleep(Duration::from_millis(200)).await;
                if engine.state() == pylar_proto::State::Closed {
                    let _ = events.send(BrokerEvent::Disconnected { connection: id });
                    break;
                }
            }
        });
    }

    /// Close every connection and wait briefly for them to settle.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        let _ = self.events.send(BrokerEvent::ShuttingDown { ack: tx });
        let _ = rx.await;
    }
}

async fn run_actor(
    mut events_rx: mpsc::UnboundedReceiver<BrokerEvent>,
    mut state: ActorState,
    events_tx: mpsc::UnboundedSender<BrokerEvent>,
) {
    while let Some(event) = events_rx.recv().await {
        match event {
            BrokerEvent::Connected { id, engine } => {
                state.connections.insert(
                    id,
                    ConnectionEntry {
                        engine,
                        domains: HashMap::new(),
                    },
                );
                debug!(state.log, "connection established"; "connection" => id.to_string());
            }
            BrokerEvent::Disconnected { connection } => {
                let domains = state.registry.remove_connection(connection, &state.log);
                state.connections.remove(&connection);
                debug!(state.log, "connection removed"; "connection" => connection.to_string(), "domains" => domains.len());
            }
            BrokerEvent::Request { connection, args, reply } => {
                dispatch_request(&mut state, connection, args, reply, &events_tx);
            }
            BrokerEvent::Notification { connection, args } => {
                dispatch_notification(&mut state, connection, args);
            }
            BrokerEvent::RegisterResult {
                connection,
                domain,
                token_result,
                reply,
            } => match token_result {
                Ok(token) => finalize_registration(&mut state, connection, domain, token, reply),
                Err(err) => {
                    let _ = reply.send(Err(err));
                }
            },
            BrokerEvent::ShuttingDown { ack } => {
                let connections: Vec<_> = state.connections.values().map(|e| e.engine.clone()).collect();
                if !connections.is_empty() {
                    warn!(state.log, "force-disconnecting connections"; "count" => connections.len());
                }
                for engine in &connections {
                    engine.close();
                }
                // Give every connection a bounded grace period to actually
                // close before giving up on it, so shutdown is never
                // unbounded (ground truth: `async_object.py`/`broker.py`'s
                // `force_disconnections`).
                let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE_PERIOD;
                while tokio::time::Instant::now() < deadline {
                    if connections.iter().all(|e| e.state() == pylar_proto::State::Closed) {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                let stragglers = connections.iter().filter(|e| e.state() != pylar_proto::State::Closed).count();
                if stragglers > 0 {
                    warn!(state.log, "dropping connections that did not close within the grace period"; "count" => stragglers);
                }
                let _ = ack.send(());
                break;
            }
        }
    }
}

fn dispatch_request(
    state: &mut ActorState,
    connection_id: ConnectionId,
    mut args: Frames,
    reply: oneshot::Sender<Result<Frames, CallError>>,
    events_tx: &mpsc::UnboundedSender<BrokerEvent>,
) {
    if args.is_empty() {
        let _ = reply.send(Err(CallError::bad_request()));
        return;
    }

    let command = args.remove(0);

    match command.as_ref() {
        b"ping" => {
            let _ = reply.send(Ok(vec![state.uid.clone()]));
        }
        b"register" => handle_register(state, connection_id, args, reply, events_tx),
        b"unregister" => handle_unregister(state, connection_id, args, reply),
        b"request" => handle_request(state, connection_id, args, reply),
        b"query" => handle_query(state, connection_id, args, reply),
        b"transmit" => handle_transmit(state, connection_id, args, reply),
        _ => {
            let _ = reply.send(Err(CallError::bad_request()));
        }
    }
}

fn is_registered(state: &ActorState, connection_id: ConnectionId, domain: &[u8]) -> bool {
    state
        .connections
        .get(&connection_id)
        .map(|entry| entry.domains.contains_key(domain))
        .unwrap_or(false)
}

fn handle_register(
    state: &mut ActorState,
    connection_id: ConnectionId,
    mut args: Frames,
    reply: oneshot::Sender<Result<Frames, CallError>>,
    events_tx: &mpsc::UnboundedSender<BrokerEvent>,
) {
    if args.len() < 2 {
        let _ = reply.send(Err(CallError::bad_request()));
        return;
    }

    let domain = args.remove(0).to_vec();
    let credentials = args.remove(0);

    if domain::is_service_domain(&domain) {
        if crate::auth::verify_service_credentials(&state.shared_secret, &domain, &credentials) {
            finalize_registration(state, connection_id, domain, Token::new(), reply);
        } else {
            let _ = reply.send(Err(CallError::invalid_shared_secret()));
        }
        return;
    }

    let auth_connection = match state.registry.pick(SERVICE_AUTHENTICATION_DOMAIN) {
        Some(id) => id,
        None => {
            warn!(
                state.log,
                "authentication request received but no authentication service is available";
                "domain" => String::from_utf8_lossy(&domain).into_owned(),
            );
            let _ = reply.send(Err(CallError::authentication_unavailable()));
            return;
        }
    };

    let auth_engine = state.connections[&auth_connection].engine.clone();
    let events_tx = events_tx.clone();

    // A re-registration passes the caller's own not-yet-current token as
    // its attribution (ground truth: `broker.py`'s
    // `connection.domains.get(domain)`); a first-time registration has
    // none yet, so it falls back to empty bytes.
    let source_token = state
        .connections
        .get(&connection_id)
        .and_then(|entry| entry.domains.get(&domain))
        .cloned()
        .unwrap_or_else(Token::new);

    tokio::spawn(async move {
        let request_payload = vec![
            Bytes::from_static(SERVICE_AUTHENTICATION_DOMAIN),
            Bytes::from(domain.clone()),
            source_token,
            Bytes::from_static(b"authenticate"),
            credentials,
        ];

        let token_result = match auth_engine.request(request_payload).await {
            Ok(mut payload) if !payload.is_empty() => Ok(payload.remove(0)),
            Ok(_) => Err(CallError::invalid_reply()),
            Err(err) => Err(err),
        };

        let _ = events_tx.send(BrokerEvent::RegisterResult {
            connection: connection_id,
            domain,
            token_result,
            reply,
        });
    });
}

fn finalize_registration(
    state: &mut ActorState,
    connection_id: ConnectionId,
    domain: Vec<u8>,
    token: Token,
    reply: oneshot::Sender<Result<Frames, CallError>>,
) {
    let entry = match state.connections.get_mut(&connection_id) {
        Some(entry) => entry,
        // the connection vanished while authentication was in flight.
        None => {
            let _ = reply.send(Err(CallError::request_cancelled()));
            return;
        }
    };

    if entry.domains.contains_key(&domain) {
        state.registry.unregister(&domain, connection_id, &state.log);
    }

    entry.domains.insert(domain.clone(), token.clone());
    state.registry.register(&domain, connection_id, &state.log);
    info!(state.log, "registered domain"; "domain" => String::from_utf8_lossy(&domain).into_owned(), "connection" => connection_id.to_string());

    let _ = reply.send(Ok(vec![token]));
}

fn handle_unregister(
    state: &mut ActorState,
    connection_id: ConnectionId,
    mut args: Frames,
    reply: oneshot::Sender<Result<Frames, CallError>>,
) {
    if args.is_empty() {
        let _ = reply.send(Err(CallError::bad_request()));
        return;
    }

    let domain = args.remove(0).to_vec();

    if let Some(entry) = state.connections.get_mut(&connection_id) {
        entry.domains.remove(&domain);
    }
    state.registry.unregister(&domain, connection_id, &state.log);

    let _ = reply.send(Ok(vec![]));
}

fn handle_request(
    state: &mut ActorState,
    connection_id: ConnectionId,
    mut args: Frames,
    reply: oneshot::Sender<Result<Frames, CallError>>,
) {
    if args.len() < 2 {
        let _ = reply.send(Err(CallError::bad_request()));
        return;
    }

    let source_domain = args.remove(0);
    let target_domain = args.remove(0);

    if !is_registered(state, connection_id, &source_domain) {
        let _ = reply.send(Err(CallError::not_registered()));
        return;
    }

    let source_token = state.connections[&connection_id].domains[source_domain.as_ref()].clone();

    if let Some(target_id) = state.registry.pick(&target_domain) {
        let target_engine = state.connections[&target_id].engine.clone();
        let mut payload = vec![target_domain, source_domain, source_token];
        payload.extend(args);
        forward(target_engine, payload, reply);
        return;
    }

    match state.registry.pick(SERVICE_LINK_DOMAIN) {
        Some(link_id) => {
            let link_engine = state.connections[&link_id].engine.clone();
            let mut payload = vec![
                Bytes::from_static(SERVICE_LINK_DOMAIN),
                source_domain,
                source_token,
                Bytes::from_static(b"dispatch"),
                target_domain,
            ];
            payload.extend(args);
            forward(link_engine, payload, reply);
        }
        None => {
            let _ = reply.send(Err(CallError::no_such_domain(&target_domain)));
        }
    }
}

fn forward(engine: PeerEngine, payload: Frames, reply: oneshot::Sender<Result<Frames, CallError>>) {
    tokio::spawn(async move {
        let result = engine.request(payload).await;
        let _ = reply.send(result);
    });
}

fn handle_query(
    state: &mut ActorState,
    connection_id: ConnectionId,
    mut args: Frames,
    reply: oneshot::Sender<Result<Frames, CallError>>,
) {
    if args.len() < 2 {
        let _ = reply.send(Err(CallError::bad_request()));
        return;
    }

    let source_domain = args.remove(0);
    let target_domain = args.remove(0);

    if !is_registered(state, connection_id, &source_domain) {
        let _ = reply.send(Err(CallError::not_registered()));
        return;
    }

    if state.registry.is_available(&target_domain) {
        let _ = reply.send(Ok(vec![]));
    } else {
        let _ = reply.send(Err(CallError::no_such_domain(&target_domain)));
    }
}

fn handle_transmit(
    state: &mut ActorState,
    connection_id: ConnectionId,
    mut args: Frames,
    reply: oneshot::Sender<Result<Frames, CallError>>,
) {
    if args.len() < 4 {
        let _ = reply.send(Err(CallError::bad_request()));
        return;
    }

    let source_domain = args.remove(0);
    let target_domain = args.remove(0);
    let x_domain = args.remove(0);
    let x_token = args.remove(0);

    if !is_registered(state, connection_id, &source_domain) {
        let _ = reply.send(Err(CallError::not_registered()));
        return;
    }

    match state.registry.pick(&target_domain) {
        Some(target_id) => {
            let target_engine = state.connections[&target_id].engine.clone();
            let mut payload = vec![target_domain, x_domain, x_token];
            payload.extend(args);
            forward(target_engine, payload, reply);
        }
        None => {
            let _ = reply.send(Err(CallError::no_such_domain(&target_domain)));
        }
    }
}

fn dispatch_notification(state: &mut ActorState, connection_id: ConnectionId, mut args: Frames) {
    if args.len() < 3 {
        debug!(state.log, "dropping malformed notification");
        return;
    }

    let type_ = args.remove(0);
    let domain = args.remove(0);
    let target_domain = args.remove(0);

    if !is_registered(state, connection_id, &domain) {
        debug!(state.log, "dropping notification from an unregistered domain";
            "domain" => String::from_utf8_lossy(&domain).into_owned());
        return;
    }

    let (inner_type, source_domain, source_token) = if type_.as_ref() == b"transmit" {
        if args.len() < 3 {
            debug!(state.log, "dropping malformed transmit notification");
            return;
        }
        (args.remove(0), args.remove(0), args.remove(0))
    } else {
        let token = state.connections[&connection_id].domains[domain.as_ref()].clone();
        (type_, domain, token)
    };

    if let Some(target_id) = state.registry.pick(&target_domain) {
        let target_engine = state.connections[&target_id].engine.clone();
        let mut payload = vec![target_domain, source_domain, source_token, inner_type];
        payload.extend(args);
        target_engine.notify(payload);
        return;
    }

    // No direct recipient: fall back to the link, wrapping the notification
    // under `notification_dispatch` the same way `handle_request` wraps an
    // unrouteable request under `dispatch` (ground truth: `broker.py`'s
    // `__get_connection_for`'s default `allow_link=True` plus
    // `LinkConnection.notification`).
    match state.registry.pick(SERVICE_LINK_DOMAIN) {
        Some(link_id) => {
            let link_engine = state.connections[&link_id].engine.clone();
            let mut payload = vec![
                Bytes::from_static(SERVICE_LINK_DOMAIN),
                source_domain,
                source_token,
                Bytes::from_static(b"notification_dispatch"),
                inner_type,
                target_domain,
            ];
            payload.extend(args);
            link_engine.notify(payload);
        }
        None => {
            debug!(state.log, "dropping notification for an unknown domain";
                "domain" => String::from_utf8_lossy(&target_domain).into_owned());
        }
    }
}
