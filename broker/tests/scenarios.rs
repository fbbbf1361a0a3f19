//! End-to-end broker scenarios, run over an in-process
//! `MemoryRouter` so the whole suite stays fast and deterministic.
//!
//! Each test plays the role of one or more peers talking raw wire frames
//! through a `PeerEngine`, since the `pylar-client` crate's higher-level
//! proxy isn't exercised here — these tests are about the broker's own
//! behaviour, not a client's retry/backoff policy.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use pylar_broker::connection::DEFAULT_CONNECTION_TIMEOUT;
use pylar_broker::domain::{SERVICE_AUTHENTICATION_DOMAIN, USER_DOMAIN_PREFIX};
use pylar_broker::Broker;
use pylar_proto::transport::memory::MemoryRouter;
use pylar_proto::{CallError, EngineOwner, Frames, PeerEngine};
use slog::{o, Discard, Logger};
use tokio::sync::mpsc;

fn test_logger() -> Logger {
    Logger::root(Discard, o!())
}

/// A peer that never answers inbound requests or notifications. Stands in
/// for a plain caller: everything it cares about comes back as a `request`
/// reply correlated by the engine itself, not through `EngineOwner`.
struct NoopOwner;

#[async_trait]
impl EngineOwner for NoopOwner {
    async fn on_request(&self, _payload: Frames) -> Result<Frames, CallError> {
        Err(CallError::bad_request())
    }
    async fn on_notification(&self, _payload: Frames) {}
}

/// A toy arithmetic service: answers `[target, source, token, b"sum", a, b]`
/// with the serialized sum of `a` and `b`.
struct ArithmeticOwner;

#[async_trait]
impl EngineOwner for ArithmeticOwner {
    async fn on_request(&self, payload: Frames) -> Result<Frames, CallError> {
        if payload.len() != 6 || payload[3].as_ref() != b"sum" {
            return Err(CallError::bad_request());
        }
        let a: i64 = pylar_proto::codec::deserialize(&payload[4]).map_err(|_| CallError::bad_request())?;
        let b: i64 = pylar_proto::codec::deserialize(&payload[5]).map_err(|_| CallError::bad_request())?;
        let sum = pylar_proto::codec::serialize(&(a + b)).map_err(|_| CallError::internal_error())?;
        Ok(vec![sum])
    }
    async fn on_notification(&self, _payload: Frames) {}
}

/// A toy authentication service with one hardcoded bob/password account.
struct AuthOwner {
    username: &'static [u8],
    password: &'static [u8],
}

#[async_trait]
impl EngineOwner for AuthOwner {
    async fn on_request(&self, payload: Frames) -> Result<Frames, CallError> {
        if payload.len() != 5 || payload[3].as_ref() != b"authenticate" {
            return Err(CallError::bad_request());
        }
        let credentials = &payload[4];
        if credentials.as_ref() == [self.username, b":", self.password].concat().as_slice() {
            Ok(vec![Bytes::from_static(b"tok")])
        } else {
            Err(CallError::invalid_shared_secret())
        }
    }
    async fn on_notification(&self, _payload: Frames) {}
}

/// Spawn a broker over a `MemoryRouter` and a background task that keeps
/// accepting connections, the `MemoryRouter` counterpart of `main.rs`'s
/// accept loop.
fn spawn_broker(shared_secret: &'static str, timeout: Duration) -> (Broker, Arc<MemoryRouter>) {
    let router = Arc::new(MemoryRouter::new());
    let log = test_logger();
    let broker = Broker::spawn(shared_secret, timeout, log);

    let accept_router = router.clone();
    let accept_broker = broker.clone();
    tokio::spawn(async move {
        while let Some(io) = accept_router.accept().await {
            accept_broker.handle_connection(io);
        }
    });

    (broker, router)
}

fn connect(router: &MemoryRouter, owner: Arc<dyn EngineOwner>) -> PeerEngine {
    let io = router.connect().expect("connect");
    PeerEngine::spawn(io, owner, test_logger())
}

async fn register_service(engine: &PeerEngine, domain: &[u8], credentials: &[u8]) -> Result<Frames, CallError> {
    engine
        .request(vec![
            Bytes::from_static(b"register"),
            Bytes::copy_from_slice(domain),
            Bytes::copy_from_slice(credentials),
        ])
        .await
}

#[tokio::test]
async fn registers_a_service_and_gets_a_token_back() {
    let (_broker, router) = spawn_broker("s3cret", DEFAULT_CONNECTION_TIMEOUT);

    let arithmetic = connect(&router, Arc::new(ArithmeticOwner));
    let credentials = pylar_broker::auth::build_credentials(b"s3cret", b"arithmetic");
    let reply = register_service(&arithmetic, b"service/arithmetic", &credentials)
        .await
        .expect("arithmetic registers");
    assert_eq!(reply.len(), 1);
}

#[tokio::test]
async fn service_call_returns_the_expected_result() {
    let (_broker, router) = spawn_broker("s3cret", DEFAULT_CONNECTION_TIMEOUT);

    let arithmetic = connect(&router, Arc::new(ArithmeticOwner));
    let arithmetic_creds = pylar_broker::auth::build_credentials(b"s3cret", b"arithmetic");
    register_service(&arithmetic, b"service/arithmetic", &arithmetic_creds)
        .await
        .expect("arithmetic registers");

    let auth = connect(&router, Arc::new(AuthOwner { username: b"bob", password: b"password" }));
    let auth_creds = pylar_broker::auth::build_credentials(b"s3cret", b"authentication");
    register_service(&auth, SERVICE_AUTHENTICATION_DOMAIN, &auth_creds)
        .await
        .expect("auth service registers");

    let caller = connect(&router, Arc::new(NoopOwner));
    let mut user_domain = USER_DOMAIN_PREFIX.to_vec();
    user_domain.extend_from_slice(b"/alice");
    let reply = register_service(&caller, &user_domain, b"bob:password")
        .await
        .expect("user registers via delegated auth");
    let token = reply.into_iter().next().expect("token frame");

    let sum_args = vec![
        Bytes::copy_from_slice(&user_domain),
        Bytes::from_static(b"service/arithmetic"),
        Bytes::from_static(b"sum"),
        pylar_proto::codec::serialize(&2i64).unwrap(),
        pylar_proto::codec::serialize(&40i64).unwrap(),
    ];
    let mut request_payload = vec![Bytes::from_static(b"request")];
    request_payload.extend(sum_args);
    let result = caller.request(request_payload).await.expect("arithmetic call succeeds");
    let sum: i64 = pylar_proto::codec::deserialize(&result[0]).unwrap();
    assert_eq!(sum, 42);
    assert_eq!(token, Bytes::from_static(b"tok"));
}

#[tokio::test]
async fn requesting_an_unregistered_domain_is_a_404() {
    let (_broker, router) = spawn_broker("s3cret", DEFAULT_CONNECTION_TIMEOUT);

    let auth = connect(&router, Arc::new(AuthOwner { username: b"bob", password: b"password" }));
    let auth_creds = pylar_broker::auth::build_credentials(b"s3cret", b"authentication");
    register_service(&auth, SERVICE_AUTHENTICATION_DOMAIN, &auth_creds)
        .await
        .expect("auth service registers");

    let caller = connect(&router, Arc::new(NoopOwner));
    let mut user_domain = USER_DOMAIN_PREFIX.to_vec();
    user_domain.extend_from_slice(b"/alice");
    register_service(&caller, &user_domain, b"bob:password").await.expect("user registers");

    let request_payload = vec![
        Bytes::from_static(b"request"),
        Bytes::copy_from_slice(&user_domain),
        Bytes::from_static(b"service/does-not-exist"),
    ];
    let err = caller.request(request_payload).await.expect_err("no such domain");
    assert_eq!(err.code, 404);
}

#[tokio::test]
async fn registering_a_user_with_no_authentication_service_is_a_503() {
    let (_broker, router) = spawn_broker("s3cret", DEFAULT_CONNECTION_TIMEOUT);

    let caller = connect(&router, Arc::new(NoopOwner));
    let mut user_domain = USER_DOMAIN_PREFIX.to_vec();
    user_domain.extend_from_slice(b"/alice");
    let err = register_service(&caller, &user_domain, b"bob:password")
        .await
        .expect_err("no authentication service is registered");
    assert_eq!(err.code, 503);
}

#[tokio::test]
async fn registering_a_service_with_the_wrong_secret_is_a_401() {
    let (_broker, router) = spawn_broker("s3cret", DEFAULT_CONNECTION_TIMEOUT);

    let arithmetic = connect(&router, Arc::new(ArithmeticOwner));
    let wrong_creds = pylar_broker::auth::build_credentials(b"wrong-secret", b"arithmetic");
    let err = register_service(&arithmetic, b"service/arithmetic", &wrong_creds)
        .await
        .expect_err("wrong shared secret");
    assert_eq!(err.code, 401);
}

#[tokio::test]
async fn round_robins_requests_across_two_registrants() {
    let (_broker, router) = spawn_broker("s3cret", DEFAULT_CONNECTION_TIMEOUT);

    let creds = pylar_broker::auth::build_credentials(b"s3cret", b"echo");

    struct EchoOwner(&'static [u8]);
    #[async_trait]
    impl EngineOwner for EchoOwner {
        async fn on_request(&self, _payload: Frames) -> Result<Frames, CallError> {
            Ok(vec![Bytes::from_static(self.0)])
        }
        async fn on_notification(&self, _payload: Frames) {}
    }

    let first = connect(&router, Arc::new(EchoOwner(b"first")));
    register_service(&first, b"service/echo", &creds).await.expect("first registers");
    let second = connect(&router, Arc::new(EchoOwner(b"second")));
    register_service(&second, b"service/echo", &creds).await.expect("second registers");

    let auth = connect(&router, Arc::new(AuthOwner { username: b"bob", password: b"password" }));
    let auth_creds = pylar_broker::auth::build_credentials(b"s3cret", b"authentication");
    register_service(&auth, SERVICE_AUTHENTICATION_DOMAIN, &auth_creds).await.expect("auth registers");

    let caller = connect(&router, Arc::new(NoopOwner));
    let mut user_domain = USER_DOMAIN_PREFIX.to_vec();
    user_domain.extend_from_slice(b"/alice");
    register_service(&caller, &user_domain, b"bob:password").await.expect("user registers");

    let mut seen = Vec::new();
    for _ in 0..4 {
        let request_payload = vec![
            Bytes::from_static(b"request"),
            Bytes::copy_from_slice(&user_domain),
            Bytes::from_static(b"service/echo"),
        ];
        let reply = caller.request(request_payload).await.expect("echo call succeeds");
        seen.push(reply[0].clone());
    }

    assert_eq!(
        seen,
        vec![
            Bytes::from_static(b"first"),
            Bytes::from_static(b"second"),
            Bytes::from_static(b"first"),
            Bytes::from_static(b"second"),
        ]
    );
}

#[tokio::test]
async fn a_connection_that_stops_reading_is_dropped_after_the_timeout() {
    let timeout = Duration::from_millis(150);
    let (_broker, router) = spawn_broker("s3cret", timeout);

    let creds = pylar_broker::auth::build_credentials(b"s3cret", b"arithmetic");
    let arithmetic = connect(&router, Arc::new(ArithmeticOwner));
    register_service(&arithmetic, b"service/arithmetic", &creds).await.expect("registers");

    // nothing is sent on `arithmetic` from here on; the dying timer should
    // close its engine once it has been idle for longer than `timeout`, and
    // the broker's connection-state poll should then notice and prune it.
    tokio::time::sleep(timeout * 6).await;

    assert_eq!(arithmetic.state(), pylar_proto::State::Closed);

    // a second instance registering for the same domain should be the only
    // registrant left once the first is pruned.
    let auth = connect(&router, Arc::new(AuthOwner { username: b"bob", password: b"password" }));
    let auth_creds = pylar_broker::auth::build_credentials(b"s3cret", b"authentication");
    register_service(&auth, SERVICE_AUTHENTICATION_DOMAIN, &auth_creds).await.expect("auth registers");

    let caller = connect(&router, Arc::new(NoopOwner));
    let mut user_domain = USER_DOMAIN_PREFIX.to_vec();
    user_domain.extend_from_slice(b"/alice");
    register_service(&caller, &user_domain, b"bob:password").await.expect("user registers");

    let second = connect(&router, Arc::new(ArithmeticOwner));
    register_service(&second, b"service/arithmetic", &creds).await.expect("second instance registers");

    let sum_args = vec![
        Bytes::copy_from_slice(&user_domain),
        Bytes::from_static(b"service/arithmetic"),
        Bytes::from_static(b"sum"),
        pylar_proto::codec::serialize(&1i64).unwrap(),
        pylar_proto::codec::serialize(&1i64).unwrap(),
    ];
    let mut request_payload = vec![Bytes::from_static(b"request")];
    request_payload.extend(sum_args);
    let result = caller.request(request_payload).await.expect("second instance answers");
    let sum: i64 = pylar_proto::codec::deserialize(&result[0]).unwrap();
    assert_eq!(sum, 2);
}

#[tokio::test]
async fn query_reports_availability_without_consuming_round_robin_order() {
    let (_broker, router) = spawn_broker("s3cret", DEFAULT_CONNECTION_TIMEOUT);

    let creds = pylar_broker::auth::build_credentials(b"s3cret", b"arithmetic");
    let arithmetic = connect(&router, Arc::new(ArithmeticOwner));
    register_service(&arithmetic, b"service/arithmetic", &creds).await.expect("registers");

    let auth = connect(&router, Arc::new(AuthOwner { username: b"bob", password: b"password" }));
    let auth_creds = pylar_broker::auth::build_credentials(b"s3cret", b"authentication");
    register_service(&auth, SERVICE_AUTHENTICATION_DOMAIN, &auth_creds).await.expect("auth registers");

    let caller = connect(&router, Arc::new(NoopOwner));
    let mut user_domain = USER_DOMAIN_PREFIX.to_vec();
    user_domain.extend_from_slice(b"/alice");
    register_service(&caller, &user_domain, b"bob:password").await.expect("user registers");

    let query_payload = vec![
        Bytes::from_static(b"query"),
        Bytes::copy_from_slice(&user_domain),
        Bytes::from_static(b"service/arithmetic"),
    ];
    caller.request(query_payload.clone()).await.expect("arithmetic is available");

    let missing_payload = vec![
        Bytes::from_static(b"query"),
        Bytes::copy_from_slice(&user_domain),
        Bytes::from_static(b"service/does-not-exist"),
    ];
    let err = caller.request(missing_payload).await.expect_err("no such domain");
    assert_eq!(err.code, 404);

    // querying must not rotate the round-robin order: a real call right
    // after still lands on the only (and therefore same) registrant.
    let sum_args = vec![
        Bytes::copy_from_slice(&user_domain),
        Bytes::from_static(b"service/arithmetic"),
        Bytes::from_static(b"sum"),
        pylar_proto::codec::serialize(&1i64).unwrap(),
        pylar_proto::codec::serialize(&1i64).unwrap(),
    ];
    let mut request_payload = vec![Bytes::from_static(b"request")];
    request_payload.extend(sum_args);
    let result = caller.request(request_payload).await.expect("arithmetic call succeeds");
    let sum: i64 = pylar_proto::codec::deserialize(&result[0]).unwrap();
    assert_eq!(sum, 2);
}

#[tokio::test]
async fn transmit_forwards_with_an_impersonated_source_and_does_not_require_registration_of_the_link() {
    let (_broker, router) = spawn_broker("s3cret", DEFAULT_CONNECTION_TIMEOUT);

    let arithmetic = connect(&router, Arc::new(ArithmeticOwner));
    let arithmetic_creds = pylar_broker::auth::build_credentials(b"s3cret", b"arithmetic");
    register_service(&arithmetic, b"service/arithmetic", &arithmetic_creds)
        .await
        .expect("arithmetic registers");

    // the link itself registers under the privileged service/link domain
    // like any other service connection, shared-secret verified.
    let link_creds = pylar_broker::auth::build_credentials(b"s3cret", b"link");
    let link = connect(&router, Arc::new(NoopOwner));
    register_service(&link, pylar_broker::domain::SERVICE_LINK_DOMAIN, &link_creds)
        .await
        .expect("link registers");

    // the link impersonates a remote user domain/token pair that never
    // registered locally at all.
    let transmit_payload = vec![
        Bytes::from_static(b"transmit"),
        Bytes::copy_from_slice(pylar_broker::domain::SERVICE_LINK_DOMAIN),
        Bytes::from_static(b"service/arithmetic"),
        Bytes::from_static(b"user/remote-bob"),
        Bytes::from_static(b"remote-token"),
        Bytes::from_static(b"sum"),
        pylar_proto::codec::serialize(&10i64).unwrap(),
        pylar_proto::codec::serialize(&5i64).unwrap(),
    ];
    let result = link.request(transmit_payload).await.expect("transmit forwards to arithmetic");
    let sum: i64 = pylar_proto::codec::deserialize(&result[0]).unwrap();
    assert_eq!(sum, 15);
}

#[tokio::test]
async fn two_broker_instances_have_distinct_uids() {
    let (_broker_a, router_a) = spawn_broker("s3cret", DEFAULT_CONNECTION_TIMEOUT);
    let (_broker_b, router_b) = spawn_broker("s3cret", DEFAULT_CONNECTION_TIMEOUT);

    let client_a = connect(&router_a, Arc::new(NoopOwner));
    let uid_a = client_a.request(vec![Bytes::from_static(b"ping")]).await.expect("ping a");

    let client_b = connect(&router_b, Arc::new(NoopOwner));
    let uid_b = client_b.request(vec![Bytes::from_static(b"ping")]).await.expect("ping b");

    assert_ne!(uid_a, uid_b, "a client reconnecting after a broker restart must see a new uid");
}

/// Captures every notification it receives verbatim, so a test can assert
/// on the exact frames the broker forwarded.
struct RecordingOwner {
    tx: mpsc::UnboundedSender<Frames>,
}

#[async_trait]
impl EngineOwner for RecordingOwner {
    async fn on_request(&self, _payload: Frames) -> Result<Frames, CallError> {
        Err(CallError::bad_request())
    }
    async fn on_notification(&self, payload: Frames) {
        let _ = self.tx.send(payload);
    }
}

#[tokio::test]
async fn notification_is_forwarded_with_the_senders_domain_and_token() {
    let (_broker, router) = spawn_broker("s3cret", DEFAULT_CONNECTION_TIMEOUT);

    let auth = connect(&router, Arc::new(AuthOwner { username: b"bob", password: b"password" }));
    let auth_creds = pylar_broker::auth::build_credentials(b"s3cret", b"authentication");
    register_service(&auth, SERVICE_AUTHENTICATION_DOMAIN, &auth_creds)
        .await
        .expect("auth service registers");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let arithmetic = connect(&router, Arc::new(RecordingOwner { tx }));
    let arithmetic_creds = pylar_broker::auth::build_credentials(b"s3cret", b"arithmetic");
    register_service(&arithmetic, b"service/arithmetic", &arithmetic_creds)
        .await
        .expect("arithmetic registers");

    let caller = connect(&router, Arc::new(NoopOwner));
    let mut user_domain = USER_DOMAIN_PREFIX.to_vec();
    user_domain.extend_from_slice(b"/alice");
    let token_reply = register_service(&caller, &user_domain, b"bob:password")
        .await
        .expect("user registers");
    let token = token_reply.into_iter().next().expect("token frame");

    // `[type_, source_domain, target_domain, *args]` — for a normal
    // (non-`transmit`) notification the leading frame doubles as both the
    // broker's dispatch tag and the forwarded business type, ground truth:
    // `broker.py`'s `__process_notification` else-branch keeps `type_` as
    // received rather than popping a separate one.
    let notify_payload = vec![
        Bytes::from_static(b"alert"),
        Bytes::copy_from_slice(&user_domain),
        Bytes::from_static(b"service/arithmetic"),
        Bytes::from_static(b"overload"),
    ];
    caller.notify(notify_payload);

    let forwarded = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("notification arrives within budget")
        .expect("channel stays open");

    assert_eq!(
        forwarded,
        vec![
            Bytes::from_static(b"service/arithmetic"),
            Bytes::copy_from_slice(&user_domain),
            token,
            Bytes::from_static(b"alert"),
            Bytes::from_static(b"overload"),
        ]
    );
}

#[tokio::test]
async fn notification_for_an_unregistered_source_domain_is_silently_dropped() {
    let (_broker, router) = spawn_broker("s3cret", DEFAULT_CONNECTION_TIMEOUT);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let arithmetic_creds = pylar_broker::auth::build_credentials(b"s3cret", b"arithmetic");
    let arithmetic = connect(&router, Arc::new(RecordingOwner { tx }));
    register_service(&arithmetic, b"service/arithmetic", &arithmetic_creds)
        .await
        .expect("arithmetic registers");

    // the caller never registered `user/alice`, so the broker must drop
    // this notification rather than forward it on alice's behalf.
    let caller = connect(&router, Arc::new(NoopOwner));
    let notify_payload = vec![
        Bytes::from_static(b"alert"),
        Bytes::from_static(b"user/alice"),
        Bytes::from_static(b"service/arithmetic"),
    ];
    caller.notify(notify_payload);

    let outcome = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
    assert!(outcome.is_err(), "no notification should have been forwarded");
}

/// An authentication stub that records every inbound `authenticate`
/// request's frames, always granting a fresh `tok-N` token.
struct RecordingAuthOwner {
    tx: mpsc::UnboundedSender<Frames>,
    counter: std::sync::atomic::AtomicU64,
}

#[async_trait]
impl EngineOwner for RecordingAuthOwner {
    async fn on_request(&self, payload: Frames) -> Result<Frames, CallError> {
        let _ = self.tx.send(payload);
        let n = self.counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Ok(vec![Bytes::from(format!("tok-{}", n))])
    }
    async fn on_notification(&self, _payload: Frames) {}
}

#[tokio::test]
async fn re_registering_forwards_the_previous_token_as_source_token() {
    let (_broker, router) = spawn_broker("s3cret", DEFAULT_CONNECTION_TIMEOUT);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let auth = connect(
        &router,
        Arc::new(RecordingAuthOwner { tx, counter: std::sync::atomic::AtomicU64::new(0) }),
    );
    let auth_creds = pylar_broker::auth::build_credentials(b"s3cret", b"authentication");
    register_service(&auth, SERVICE_AUTHENTICATION_DOMAIN, &auth_creds)
        .await
        .expect("auth service registers");

    let caller = connect(&router, Arc::new(NoopOwner));
    let mut user_domain = USER_DOMAIN_PREFIX.to_vec();
    user_domain.extend_from_slice(b"/alice");

    let first_reply = register_service(&caller, &user_domain, b"anything")
        .await
        .expect("first registration succeeds");
    let first_token = first_reply.into_iter().next().expect("token frame");

    let first_seen = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("authenticate request arrives")
        .expect("channel stays open");
    // `[target, source_domain, source_token, "authenticate", credentials]`:
    // a first-time registration has no prior token to forward.
    assert_eq!(first_seen[2], Bytes::new());

    register_service(&caller, &user_domain, b"anything")
        .await
        .expect("re-registration succeeds");

    let second_seen = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("second authenticate request arrives")
        .expect("channel stays open");
    assert_eq!(second_seen[2], first_token, "re-registration must forward the previous token");
}

#[tokio::test]
async fn a_notification_for_an_unrouted_domain_falls_back_to_the_link() {
    let (_broker, router) = spawn_broker("s3cret", DEFAULT_CONNECTION_TIMEOUT);

    let auth = connect(&router, Arc::new(AuthOwner { username: b"bob", password: b"password" }));
    let auth_creds = pylar_broker::auth::build_credentials(b"s3cret", b"authentication");
    register_service(&auth, SERVICE_AUTHENTICATION_DOMAIN, &auth_creds)
        .await
        .expect("auth service registers");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let link_creds = pylar_broker::auth::build_credentials(b"s3cret", b"link");
    let link = connect(&router, Arc::new(RecordingOwner { tx }));
    register_service(&link, pylar_broker::domain::SERVICE_LINK_DOMAIN, &link_creds)
        .await
        .expect("link registers");

    let caller = connect(&router, Arc::new(NoopOwner));
    let mut user_domain = USER_DOMAIN_PREFIX.to_vec();
    user_domain.extend_from_slice(b"/alice");
    let token_reply = register_service(&caller, &user_domain, b"bob:password")
        .await
        .expect("user registers");
    let token = token_reply.into_iter().next().expect("token frame");

    // no local registrant exists for `service/remote-thing`, so this should
    // fall back to the link the same way an unrouteable `request` does.
    let notify_payload = vec![
        Bytes::from_static(b"alert"),
        Bytes::copy_from_slice(&user_domain),
        Bytes::from_static(b"service/remote-thing"),
        Bytes::from_static(b"overload"),
    ];
    caller.notify(notify_payload);

    let forwarded = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("notification arrives within budget")
        .expect("channel stays open");

    assert_eq!(
        forwarded,
        vec![
            Bytes::copy_from_slice(pylar_broker::domain::SERVICE_LINK_DOMAIN),
            Bytes::copy_from_slice(&user_domain),
            token,
            Bytes::from_static(b"notification_dispatch"),
            Bytes::from_static(b"alert"),
            Bytes::from_static(b"service/remote-thing"),
            Bytes::from_static(b"overload"),
        ]
    );
}

#[tokio::test]
async fn a_malformed_transmit_notification_is_dropped_without_taking_down_the_broker() {
    let (_broker, router) = spawn_broker("s3cret", DEFAULT_CONNECTION_TIMEOUT);

    let creds = pylar_broker::auth::build_credentials(b"s3cret", b"arithmetic");
    let arithmetic = connect(&router, Arc::new(ArithmeticOwner));
    register_service(&arithmetic, b"service/arithmetic", &creds).await.expect("registers");

    let link_creds = pylar_broker::auth::build_credentials(b"s3cret", b"link");
    let link = connect(&router, Arc::new(NoopOwner));
    register_service(&link, pylar_broker::domain::SERVICE_LINK_DOMAIN, &link_creds)
        .await
        .expect("link registers");

    // `dispatch_notification`'s `transmit` branch needs 3 more frames
    // (inner type, impersonated source domain, impersonated source
    // token) after stripping `[transmit, domain, target]`; this sends
    // only 2, which used to panic the broker actor on a bare
    // `Vec::remove` out of bounds instead of being dropped.
    let malformed_payload = vec![
        Bytes::from_static(b"transmit"),
        Bytes::copy_from_slice(pylar_broker::domain::SERVICE_LINK_DOMAIN),
        Bytes::from_static(b"service/arithmetic"),
        Bytes::from_static(b"only-one-extra-frame"),
        Bytes::from_static(b"still-only-two"),
    ];
    link.notify(malformed_payload);

    // give the (malformed) notification time to reach and be handled by
    // the actor before proving the actor is still alive.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let sum_args = vec![
        Bytes::copy_from_slice(pylar_broker::domain::SERVICE_LINK_DOMAIN),
        Bytes::from_static(b"service/arithmetic"),
        Bytes::from_static(b"sum"),
        pylar_proto::codec::serialize(&1i64).unwrap(),
        pylar_proto::codec::serialize(&1i64).unwrap(),
    ];
    let mut request_payload = vec![Bytes::from_static(b"request")];
    request_payload.extend(sum_args);
    let result = link
        .request(request_payload)
        .await
        .expect("the broker actor is still alive and routes this call");
    let sum: i64 = pylar_proto::codec::deserialize(&result[0]).unwrap();
    assert_eq!(sum, 2);
}
