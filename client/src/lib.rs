//! `pylar-client`: domain registration with automatic retry, remote calls
//! and notification handling on top of `pylar-proto`'s peer engine.

pub mod proxy;
pub mod session;

pub use proxy::{Client, ClientProxy, CommandHandler, NotificationHandler, ProxyState};
pub use session::ClientSession;
