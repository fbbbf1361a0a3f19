//! CLI configuration for the broker binary.
//!
//! A top-level `App` with `Arg`s, parsed with `get_matches()`, then pulled
//! into a plain config struct passed down to the rest of the binary.

use clap::{App, Arg};

pub struct Config {
    pub listen_addr: String,
    pub shared_secret: String,
    pub debug_level: String,
}

impl Config {
    pub fn from_args() -> Config {
        let matches = App::new("pylar-broker")
            .version(clap::crate_version!())
            .about("The Pylar message broker")
            .arg(
                Arg::with_name("listen")
                    .long("listen")
                    .value_name("ADDR")
                    .help("Address to listen for TCP connections on")
                    .default_value("127.0.0.1:9099")
                    .takes_value(true),
            )
            .arg(
                Arg::with_name("shared-secret")
                    .long("shared-secret")
                    .value_name("SECRET")
                    .help("Shared secret used to verify service registrations")
                    .takes_value(true)
                    .required(true),
            )
            .arg(
                Arg::with_name("debug-level")
                    .long("debug-level")
                    .value_name("LEVEL")
                    .help("slog filter level: trace, debug, info, warn, error, crit")
                    .default_value("info")
                    .takes_value(true),
            )
            .get_matches();

        Config {
            listen_addr: matches.value_of("listen").unwrap().to_string(),
            shared_secret: matches.value_of("shared-secret").unwrap().to_string(),
            debug_level: matches.value_of("debug-level").unwrap().to_string(),
        }
    }
}
