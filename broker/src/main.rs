//! The broker binary: parses CLI configuration, wires up logging, binds a
//! TCP listener and runs the broker actor until `SIGINT`.
//!
//! A slog-term/slog-async drain setup with a per-level filter, and
//! shutting down on `tokio::signal::ctrl_c()` rather than a bespoke signal
//! handler.

use slog::{info, o, warn, Drain, Level, Logger};
use tokio::signal;

use pylar_broker::config::Config;
use pylar_broker::connection::DEFAULT_CONNECTION_TIMEOUT;
use pylar_broker::Broker;
use pylar_proto::transport::tcp::TcpRouter;

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
    let config = Config::from_args();
    let log = build_logger(&config.debug_level);

    let router = match TcpRouter::bind(&config.listen_addr).await {
        Ok(router) => router,
        Err(err) => {
            warn!(log, "failed to bind listener"; "addr" => &config.listen_addr, "error" => %err);
            std::process::exit(1);
        }
    };

    let local_addr = router.local_addr().map(|a| a.to_string()).unwrap_or_default();
    info!(log, "broker listening"; "addr" => local_addr);

    let broker = Broker::spawn(
        config.shared_secret.clone(),
        DEFAULT_CONNECTION_TIMEOUT,
        log.new(o!("component" => "broker")),
    );

    let accept_log = log.clone();
    let accept_broker = broker.clone();
    let accept_task = tokio::spawn(async move {
        loop {
            match router.accept().await {
                Some(io) => accept_broker.handle_connection(io),
                None => {
                    warn!(accept_log, "listener stopped accepting connections");
                    break;
                }
            }
        }
    });

    signal::ctrl_c().await.expect("failed to listen for ctrl-c");
    warn!(log, "shutting down");
    accept_task.abort();
    broker.shutdown().await;
}
