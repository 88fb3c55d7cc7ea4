//! Session registry
//!
//! Maps each assigned VIP to its live session. The TUN-reader loop is the
//! only lookup consumer; it routes egress packets by destination address
//! with a lock-free get and a non-blocking enqueue.

use std::net::Ipv4Addr;
use std::sync::Arc;

use dashmap::DashMap;

use super::Session;

/// VIP to session mapping
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<Ipv4Addr, Arc<Session>>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Insert a session under its VIP on successful auth.
    pub fn insert(&self, session: Arc<Session>) {
        self.sessions.insert(session.vip(), session);
    }

    /// Remove the entry for `vip` on teardown.
    pub fn remove(&self, vip: Ipv4Addr) -> Option<Arc<Session>> {
        self.sessions.remove(&vip).map(|(_, s)| s)
    }

    /// Look up the session owning `vip`.
    #[must_use]
    pub fn get(&self, vip: Ipv4Addr) -> Option<Arc<Session>> {
        self.sessions.get(&vip).map(|entry| entry.clone())
    }

    /// Number of live sessions
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether any session is connected
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
