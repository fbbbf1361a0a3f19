//! End-to-end demo wiring together `pylar-broker` and `pylar-client`: an
//! arithmetic service registers, a user authenticates and registers, and
//! the user calls `sum` on the service.
//!
//! The authentication service itself is an external collaborator out of
//! scope for this crate — it is stubbed here as a single hardcoded account,
//! the same stand-in `broker/tests/scenarios.rs` uses.
//!
//! `clap` CLI parsing, a `slog-term`/`slog-async` logger built once and
//! handed down as child loggers, and running everything on one
//! multi-threaded Tokio runtime until it completes.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use clap::{App, Arg};
use futures::future::BoxFuture;
use pylar_broker::connection::DEFAULT_CONNECTION_TIMEOUT;
use pylar_broker::domain::SERVICE_AUTHENTICATION_DOMAIN;
use pylar_broker::Broker;
use pylar_client::Client;
use pylar_proto::transport::memory::MemoryRouter;
use pylar_proto::{CallError, EngineOwner, Frames, PeerEngine};
use serde_json::json;
use slog::{info, o, Drain, Level, Logger};

/// A one-account authentication stub: `bob` / `password`.
struct StubAuthService {
    username: &'static str,
    password: &'static str,
}

#[async_trait]
impl EngineOwner for StubAuthService {
    async fn on_request(&self, payload: Frames) -> Result<Frames, CallError> {
        if payload.len() != 5 || payload[3].as_ref() != b"authenticate" {
            return Err(CallError::bad_request());
        }
        let expected = format!("{}:{}", self.username, self.password);
        if payload[4].as_ref() == expected.as_bytes() {
            Ok(vec![Bytes::from_static(b"demo-token")])
        } else {
            Err(CallError::invalid_shared_secret())
        }
    }

    async fn on_notification(&self, _payload: Frames) {}
}

fn build_logger(debug_level: &str) -> Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::CompactFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build();
    let level = match debug_level {
        "trace" => Level::Trace,
        "debug" => Level::Debug,
        "warn" => Level::Warning,
        "error" => Level::Error,
        "crit" => Level::Critical,
        _ => Level::Info,
    };
    let drain = drain.filter_level(level);
    Logger::root(drain.fuse(), o!())
}

#[tokio::main]
async fn main() {
    let matches = App::new("pylar-demo")
        .version(clap::crate_version!())
        .about("Arithmetic service + user, talking through an in-process Pylar broker")
        .arg(
            Arg::with_name("shared-secret")
                .long("shared-secret")
                .value_name("SECRET")
                .help("Shared secret the arithmetic service authenticates with")
                .default_value("mysupersecret!!!")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("debug-level")
                .long("debug-level")
                .value_name("LEVEL")
                .default_value("info")
                .takes_value(true),
        )
        .get_matches();

    let shared_secret = matches.value_of("shared-secret").unwrap().to_string();
    let log = build_logger(matches.value_of("debug-level").unwrap());

    let router = Arc::new(MemoryRouter::new());
    let broker = Broker::spawn(shared_secret.clone(), DEFAULT_CONNECTION_TIMEOUT, log.new(o!("component" => "broker")));

    let accept_router = router.clone();
    let accept_broker = broker.clone();
    tokio::spawn(async move {
        while let Some(io) = accept_router.accept().await {
            accept_broker.handle_connection(io);
        }
    });

    // The authentication service: a raw `PeerEngine`, since it is an
    // external collaborator this crate does not otherwise need a client
    // proxy for (it never calls anyone else).
    let auth_io = router.connect().expect("connect auth service");
    let auth_owner = Arc::new(StubAuthService { username: "bob", password: "password" });
    let auth_engine = PeerEngine::spawn(auth_io, auth_owner, log.new(o!("component" => "authentication")));
    let auth_creds = pylar_broker::auth::build_credentials(shared_secret.as_bytes(), b"authentication");
    auth_engine
        .request(vec![
            Bytes::from_static(b"register"),
            Bytes::copy_from_slice(SERVICE_AUTHENTICATION_DOMAIN),
            Bytes::from(auth_creds),
        ])
        .await
        .expect("authentication service registers");

    // The arithmetic service, as a real `pylar-client` consumer.
    let arithmetic_io = router.connect().expect("connect arithmetic service");
    let arithmetic_client = Client::spawn(arithmetic_io, log.new(o!("component" => "arithmetic")));
    let arithmetic_creds = pylar_broker::auth::build_credentials(shared_secret.as_bytes(), b"arithmetic");
    let arithmetic = arithmetic_client.add_registration(Bytes::from_static(b"service/arithmetic"), arithmetic_creds);
    arithmetic.on_command(
        "method_call",
        std::sync::Arc::new(|_source: Bytes, _token: Bytes, args: Frames| {
            Box::pin(async move {
                if args.len() != 3 {
                    return Err(CallError::bad_request());
                }
                if args[0].as_ref() != b"sum" {
                    return Err(CallError::unknown_command());
                }
                let call_args: Vec<i64> =
                    pylar_proto::codec::deserialize(&args[1]).map_err(|_| CallError::bad_request())?;
                let sum: i64 = call_args.iter().sum();
                let reply = pylar_proto::codec::serialize(&sum).map_err(|_| CallError::internal_error())?;
                Ok(vec![reply])
            }) as BoxFuture<'static, Result<Frames, CallError>>
        }),
    );

    // The user, also a real `pylar-client` consumer.
    let user_io = router.connect().expect("connect user");
    let user_client = Client::spawn(user_io, log.new(o!("component" => "user/bob")));
    let bob = user_client.add_registration(Bytes::from_static(b"user/bob"), Bytes::from_static(b"bob:password"));

    wait_registered(&arithmetic).await;
    wait_registered(&bob).await;

    let result = bob
        .method_call(b"service/arithmetic", "sum", &json!([2, 17]), &json!({}))
        .await
        .expect("arithmetic call succeeds");

    info!(log, "arithmetic call succeeded"; "result" => result.to_string());
    println!("sum(2, 17) = {}", result);
}

async fn wait_registered(proxy: &pylar_client::ClientProxy) {
    let mut rx = proxy.subscribe();
    while !matches!(*rx.borrow(), pylar_client::ProxyState::Registered { .. }) {
        rx.changed().await.expect("registration channel stays open");
    }
}
