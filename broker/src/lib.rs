//! `pylar-broker`: domain registration, round-robin routing, authentication
//! delegation and link bridging on top of `pylar-proto`'s peer engine.

pub mod auth;
pub mod broker;
pub mod config;
pub mod connection;
pub mod domain;
pub mod registry;

pub use broker::Broker;
