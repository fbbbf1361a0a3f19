//! Round-robin domain-to-connection registry.
//!
//! Each domain maps to a rotating queue of connections; a pick takes the
//! head and rotates it to the back. `ConnectionId` is an opaque handle —
//! the registry never touches connection internals, only ids, so the
//! broker actor is the sole place that resolves an id back to a
//! `Connection`.

use std::collections::{HashMap, VecDeque};

use slog::{info, Logger};

pub type ConnectionId = uuid::Uuid;

/// Per-domain token issued to a registering connection, carried on every
/// subsequent request made on that domain's behalf.
pub type Token = bytes::Bytes;

#[derive(Default)]
pub struct DomainRegistry {
    by_domain: HashMap<Vec<u8>, VecDeque<ConnectionId>>,
}

impl DomainRegistry {
    pub fn new() -> Self {
        DomainRegistry::default()
    }

    /// Register `connection` for `domain`. Logs a `domain now available`
    /// event the first time a domain gains a registrant.
    pub fn register(&mut self, domain: &[u8], connection: ConnectionId, log: &Logger) {
        let queue = self.by_domain.entry(domain.to_vec()).or_insert_with(|| {
            info!(log, "domain is now available"; "domain" => String::from_utf8_lossy(domain).into_owned());
            VecDeque::new()
        });
        queue.push_back(connection);
    }

    /// Unregister `connection` from `domain`. A connection that never
    /// registered for `domain` is a no-op (REDESIGN FLAG: the original
    /// would `KeyError`/`ValueError`; here it is simply ignored and
    /// logged, since a stale `unregister` from a racing client should
    /// never be allowed to crash the broker).
    pub fn unregister(&mut self, domain: &[u8], connection: ConnectionId, log: &Logger) {
        let now_empty = match self.by_domain.get_mut(domain) {
            Some(queue) => {
                if let Some(pos) = queue.iter().position(|c| *c == connection) {
                    queue.remove(pos);
                } else {
                    info!(log, "ignoring unregister for a connection that was never registered";
                        "domain" => String::from_utf8_lossy(domain).into_owned());
                    return;
                }
                queue.is_empty()
            }
            None => {
                info!(log, "ignoring unregister for an unknown domain";
                    "domain" => String::from_utf8_lossy(domain).into_owned());
                return;
            }
        };

        if now_empty {
            self.by_domain.remove(domain);
            info!(log, "domain is now unavailable"; "domain" => String::from_utf8_lossy(domain).into_owned());
        }
    }

    /// Remove every registration belonging to `connection`, across all
    /// domains. Returns the domains it was registered for, so the caller
    /// can drop its own per-domain token bookkeeping.
    pub fn remove_connection(&mut self, connection: ConnectionId, log: &Logger) -> Vec<Vec<u8>> {
        let domains: Vec<Vec<u8>> = self
            .by_domain
            .iter()
            .filter(|(_, queue)| queue.contains(&connection))
            .map(|(domain, _)| domain.clone())
            .collect();

        for domain in &domains {
            self.unregister(domain, connection, log);
        }

        domains
    }

    /// Pick the next connection registered for `domain`, rotating it to
    /// the back so the next pick round-robins across all registrants.
    pub fn pick(&mut self, domain: &[u8]) -> Option<ConnectionId> {
        let queue = self.by_domain.get_mut(domain)?;
        let picked = *queue.front()?;
        queue.rotate_left(1);
        Some(picked)
    }

    /// Presence check used by `query`: `true` iff `domain` has at least one
    /// registrant, without rotating the round-robin order.
    pub fn is_available(&self, domain: &[u8]) -> bool {
        self.by_domain
            .get(domain)
            .map(|queue| !queue.is_empty())
            .unwrap_or(false)
    }

    pub fn is_registered(&self, domain: &[u8], connection: ConnectionId) -> bool {
        self.by_domain
            .get(domain)
            .map(|queue| queue.contains(&connection))
            .unwrap_or(false)
    }
}
