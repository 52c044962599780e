//! Server-wide shared state: live connections and the RTSP-over-HTTP
//! tunnel cache.
//!
//! Both registries are owned by the server instance and handed to the
//! connection handlers; they are the only state shared across sockets.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::session::StreamConnection;

/// Every connection currently handled by a worker, keyed by connection id.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<RwLock<HashMap<u64, Arc<StreamConnection>>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, conn: Arc<StreamConnection>) {
        let id = conn.connection().id();
        self.connections.write().insert(id, conn);
    }

    pub fn remove(&self, id: u64) -> Option<Arc<StreamConnection>> {
        self.connections.write().remove(&id)
    }

    pub fn get(&self, id: u64) -> Option<Arc<StreamConnection>> {
        self.connections.read().get(&id).cloned()
    }

    /// Snapshot of all live connections, ordered by id.
    pub fn all(&self) -> Vec<Arc<StreamConnection>> {
        let mut all: Vec<_> = self.connections.read().values().cloned().collect();
        all.sort_by_key(|c| c.connection().id());
        all
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    /// Remove every connection, returning them so the caller can close them
    /// outside the lock.
    pub fn clear(&self) -> Vec<Arc<StreamConnection>> {
        self.connections.write().drain().map(|(_, c)| c).collect()
    }
}

struct TunnelEntry {
    conn: Arc<StreamConnection>,
    expires: Instant,
}

/// `x-sessioncookie` → the GET half of an RTSP-over-HTTP tunnel.
///
/// Entries expire after `ttl` unless refreshed. Expiry is checked lazily on
/// lookup and in bulk by [`sweep_expired`](Self::sweep_expired).
#[derive(Clone)]
pub struct TunnelCache {
    entries: Arc<RwLock<HashMap<String, TunnelEntry>>>,
    ttl: Duration,
}

impl TunnelCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn insert(&self, cookie: &str, conn: Arc<StreamConnection>) {
        let entry = TunnelEntry {
            conn,
            expires: Instant::now() + self.ttl,
        };
        self.entries.write().insert(cookie.to_string(), entry);
        tracing::debug!(cookie, "tunnel registered");
    }

    /// Push the expiry of a live entry forward. Returns `false` if the
    /// cookie is unknown or already expired.
    pub fn refresh(&self, cookie: &str) -> bool {
        let mut entries = self.entries.write();
        match entries.get_mut(cookie) {
            Some(entry) if entry.expires > Instant::now() => {
                entry.expires = Instant::now() + self.ttl;
                true
            }
            Some(_) => {
                entries.remove(cookie);
                false
            }
            None => false,
        }
    }

    pub fn get(&self, cookie: &str) -> Option<Arc<StreamConnection>> {
        {
            let entries = self.entries.read();
            match entries.get(cookie) {
                Some(entry) if entry.expires > Instant::now() => return Some(entry.conn.clone()),
                Some(_) => {}
                None => return None,
            }
        }
        self.entries.write().remove(cookie);
        tracing::debug!(cookie, "tunnel expired");
        None
    }

    pub fn contains(&self, cookie: &str) -> bool {
        self.get(cookie).is_some()
    }

    pub fn remove(&self, cookie: &str) -> Option<Arc<StreamConnection>> {
        let removed = self.entries.write().remove(cookie).map(|e| e.conn);
        if removed.is_some() {
            tracing::debug!(cookie, "tunnel removed");
        }
        removed
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, e| e.expires > now);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventHub;
    use crate::session::QueueConfig;
    use crate::transport::Connection;
    use std::net::{TcpListener, TcpStream};
    use std::thread;

    fn stream_connection() -> (Arc<StreamConnection>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        let conn = Arc::new(Connection::new(server).unwrap());
        let sc = StreamConnection::new(conn, QueueConfig::default(), Arc::new(EventHub::new()));
        (Arc::new(sc), client)
    }

    #[test]
    fn registry_insert_get_remove() {
        let registry = ConnectionRegistry::new();
        let (a, _ca) = stream_connection();
        let (b, _cb) = stream_connection();
        let (ida, idb) = (a.connection().id(), b.connection().id());
        registry.insert(a);
        registry.insert(b);
        assert_eq!(registry.len(), 2);
        assert!(registry.get(ida).is_some());

        let ids: Vec<u64> = registry.all().iter().map(|c| c.connection().id()).collect();
        assert_eq!(ids, vec![ida.min(idb), ida.max(idb)]);

        assert!(registry.remove(ida).is_some());
        assert!(registry.remove(ida).is_none());
        assert_eq!(registry.clear().len(), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn tunnel_entries_expire() {
        let cache = TunnelCache::new(Duration::from_millis(40));
        let (conn, _client) = stream_connection();
        cache.insert("cookie", conn);
        assert!(cache.contains("cookie"));
        assert!(cache.refresh("cookie"));

        thread::sleep(Duration::from_millis(80));
        assert!(!cache.refresh("cookie"));
        assert!(cache.get("cookie").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn sweep_removes_only_expired() {
        let cache = TunnelCache::new(Duration::from_millis(40));
        let (a, _ca) = stream_connection();
        let (b, _cb) = stream_connection();
        cache.insert("old", a);
        thread::sleep(Duration::from_millis(80));
        cache.insert("new", b);
        assert_eq!(cache.sweep_expired(), 1);
        assert!(cache.contains("new"));
        assert!(cache.remove("new").is_some());
        assert!(cache.remove("new").is_none());
    }
}
