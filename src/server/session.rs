//! Registry of live TCP handlers.
//!
//! Every accepted connection the TCP relay claims is registered here for the
//! lifetime of its task. The registry tracks last activity per handler and
//! force-closes handlers that stay idle too long. Sweeps are driven by new
//! accepts and run at most once per second.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;

/// Unique handler identifier.
pub type HandlerId = u64;

/// Minimum spacing between two idle sweeps.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Shared view of one live handler.
pub struct HandlerEntry {
    id: HandlerId,
    peer_addr: SocketAddr,
    created_at: Instant,
    last_activity: Mutex<Instant>,
    closed: AtomicBool,
    notify: Notify,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl HandlerEntry {
    fn new(id: HandlerId, peer_addr: SocketAddr) -> Self {
        let now = Instant::now();
        Self {
            id,
            peer_addr,
            created_at: now,
            last_activity: Mutex::new(now),
            closed: AtomicBool::new(false),
            notify: Notify::new(),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
        }
    }

    /// Handler ID.
    pub fn id(&self) -> HandlerId {
        self.id
    }

    /// Client endpoint.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Record activity now.
    pub fn touch(&self) {
        self.touch_at(Instant::now());
    }

    /// Record activity at `at`.
    pub fn touch_at(&self, at: Instant) {
        let mut last = self.last_activity.lock();
        if at > *last {
            *last = at;
        }
    }

    /// Count bytes sent to the server.
    pub fn add_sent(&self, n: usize) {
        self.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Count bytes delivered to the client.
    pub fn add_received(&self, n: usize) {
        self.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Whether the handler has been idle longer than `timeout` at `now`.
    pub fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(*self.last_activity.lock()) > timeout
    }

    /// Request close. Returns true only for the first call.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.notify.notify_waiters();
        true
    }

    /// Whether close has been requested.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolve once close has been requested.
    pub async fn closed(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_closed() {
            return;
        }
        notified.await;
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> HandlerStats {
        HandlerStats {
            id: self.id,
            peer_addr: self.peer_addr,
            created_at: self.created_at,
            last_activity: *self.last_activity.lock(),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

/// Per-handler statistics.
#[derive(Debug, Clone)]
pub struct HandlerStats {
    /// Handler ID
    pub id: HandlerId,
    /// Client endpoint
    pub peer_addr: SocketAddr,
    /// Accept time
    pub created_at: Instant,
    /// Last successful read in either direction
    pub last_activity: Instant,
    /// Plaintext bytes sent toward the server
    pub bytes_sent: u64,
    /// Plaintext bytes delivered to the client
    pub bytes_received: u64,
}

/// Keeps a handler registered until dropped.
pub struct HandlerGuard {
    registry: Arc<HandlerRegistry>,
    entry: Arc<HandlerEntry>,
}

impl Deref for HandlerGuard {
    type Target = HandlerEntry;

    fn deref(&self) -> &HandlerEntry {
        &self.entry
    }
}

impl Drop for HandlerGuard {
    fn drop(&mut self) {
        self.entry.close();
        self.registry.handlers.write().remove(&self.entry.id);
    }
}

/// All live handlers of one TCP relay.
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<HandlerId, Arc<HandlerEntry>>>,
    next_id: AtomicU64,
    idle_timeout: Duration,
    last_sweep: Mutex<Option<Instant>>,
}

impl HandlerRegistry {
    /// Create a registry closing handlers idle longer than `idle_timeout`.
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            idle_timeout,
            last_sweep: Mutex::new(None),
        }
    }

    /// Register a handler for `peer_addr`.
    pub fn register(self: &Arc<Self>, peer_addr: SocketAddr) -> HandlerGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::new(HandlerEntry::new(id, peer_addr));
        self.handlers.write().insert(id, Arc::clone(&entry));
        HandlerGuard {
            registry: Arc::clone(self),
            entry,
        }
    }

    /// Look up a live handler.
    #[cfg(test)]
    fn get(&self, id: HandlerId) -> Option<Arc<HandlerEntry>> {
        self.handlers.read().get(&id).cloned()
    }

    /// Number of live handlers.
    pub fn count(&self) -> usize {
        self.handlers.read().len()
    }

    /// Close and forget every handler idle at `now`. Returns how many were closed.
    pub fn sweep(&self, now: Instant) -> usize {
        let idle: Vec<Arc<HandlerEntry>> = self
            .handlers
            .read()
            .values()
            .filter(|h| h.is_idle(now, self.idle_timeout))
            .cloned()
            .collect();

        if idle.is_empty() {
            return 0;
        }

        let mut handlers = self.handlers.write();
        for handler in &idle {
            handler.close();
            handlers.remove(&handler.id);
        }
        tracing::debug!("closed {} idle handlers", idle.len());
        idle.len()
    }

    /// Sweep unless the previous sweep ran less than a second before `now`.
    pub fn maybe_sweep(&self, now: Instant) -> usize {
        {
            let mut last = self.last_sweep.lock();
            if let Some(at) = *last {
                if now.saturating_duration_since(at) < SWEEP_INTERVAL {
                    return 0;
                }
            }
            *last = Some(now);
        }
        self.sweep(now)
    }

    /// Close every handler.
    pub fn close_all(&self) {
        let drained: Vec<_> = self.handlers.write().drain().map(|(_, h)| h).collect();
        for handler in drained {
            handler.close();
        }
    }

    /// Statistics for all live handlers.
    #[cfg(test)]
    fn all_stats(&self) -> Vec<HandlerStats> {
        self.handlers.read().values().map(|h| h.stats()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_register_and_drop() {
        let registry = Arc::new(HandlerRegistry::new(Duration::from_secs(900)));
        let a = registry.register(peer(1));
        let b = registry.register(peer(2));
        assert_ne!(a.id(), b.id());
        assert_eq!(registry.count(), 2);

        let id = a.id();
        drop(a);
        assert_eq!(registry.count(), 1);
        assert!(registry.get(id).is_none());
        assert_eq!(registry.get(b.id()).unwrap().peer_addr(), peer(2));
    }

    #[test]
    fn test_sweep_closes_only_idle() {
        let registry = Arc::new(HandlerRegistry::new(Duration::from_secs(900)));
        let idle = registry.register(peer(1));
        let active = registry.register(peer(2));

        let start = Instant::now();
        active.touch_at(start + Duration::from_secs(800));

        let closed = registry.sweep(start + Duration::from_secs(901));
        assert_eq!(closed, 1);
        assert!(idle.is_closed());
        assert!(!active.is_closed());
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_sweep_rate_limited() {
        let registry = Arc::new(HandlerRegistry::new(Duration::from_secs(0)));
        let start = Instant::now();
        let _h = registry.register(peer(1));

        assert_eq!(registry.maybe_sweep(start + Duration::from_millis(10)), 1);
        let _h2 = registry.register(peer(2));
        assert_eq!(registry.maybe_sweep(start + Duration::from_millis(500)), 0);
        assert_eq!(registry.maybe_sweep(start + Duration::from_millis(1100)), 1);
    }

    #[test]
    fn test_close_once() {
        let registry = Arc::new(HandlerRegistry::new(Duration::from_secs(900)));
        let h = registry.register(peer(1));
        assert!(h.close());
        assert!(!h.close());
    }

    #[tokio::test]
    async fn test_closed_wakes_waiter() {
        let registry = Arc::new(HandlerRegistry::new(Duration::from_secs(900)));
        let h = registry.register(peer(1));
        let entry = registry.get(h.id()).unwrap();

        let waiter = tokio::spawn(async move { entry.closed().await });
        tokio::task::yield_now().await;
        registry.close_all();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_stats() {
        let registry = Arc::new(HandlerRegistry::new(Duration::from_secs(900)));
        let h = registry.register(peer(9));
        h.add_sent(10);
        h.add_received(32);

        let stats = registry.all_stats();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].bytes_sent, 10);
        assert_eq!(stats[0].bytes_received, 32);
        assert_eq!(stats[0].peer_addr, peer(9));
    }
}
