//! High availability: stick with a healthy server, move away from failing ones.
//!
//! Every server carries a score built from how long ago it last failed, its
//! most recent connect latency (discounted as the measurement ages) and how
//! long it has gone without answering writes. The current server is replaced
//! only when another one scores clearly better.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::{CallerType, Strategy};
use crate::proxy::Address;
use crate::server::ServerDescriptor;

/// A server that never failed counts as failed this long ago.
const FAILURE_HORIZON_SECS: f64 = 300.0;

/// Latencies above this are clamped.
const LATENCY_CAP_MS: f64 = 2000.0;

/// Read-after-write lead above this is clamped.
const READ_LAG_CAP_SECS: f64 = 5.0;

/// Score margin another server needs before we switch.
const SWITCH_MARGIN: f64 = 200.0;

/// Latency assumed before the first measurement.
const INITIAL_LATENCY: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
struct ServerStatus {
    server: Arc<ServerDescriptor>,
    latency: Duration,
    latency_at: Instant,
    last_read: Instant,
    last_write: Instant,
    last_failure: Option<Instant>,
    score: f64,
}

impl ServerStatus {
    fn new(server: Arc<ServerDescriptor>, now: Instant) -> Self {
        Self {
            server,
            latency: INITIAL_LATENCY,
            latency_at: now,
            last_read: now,
            last_write: now,
            last_failure: None,
            score: 0.0,
        }
    }

    fn rescore(&mut self, now: Instant) {
        let since_failure = match self.last_failure {
            Some(at) => now.saturating_duration_since(at).as_secs_f64().min(FAILURE_HORIZON_SECS),
            None => FAILURE_HORIZON_SECS,
        };
        let latency_ms = (self.latency.as_secs_f64() * 1000.0).min(LATENCY_CAP_MS);
        let latency_age = now.saturating_duration_since(self.latency_at).as_secs_f64();
        // Negative while writes are going unanswered.
        let read_lag = if self.last_read >= self.last_write {
            self.last_read.duration_since(self.last_write).as_secs_f64()
        } else {
            -self.last_write.duration_since(self.last_read).as_secs_f64()
        }
        .min(READ_LAG_CAP_SECS);

        self.score = 100.0 * 1000.0 * since_failure
            - 2.0 * 5.0 * (latency_ms / (1.0 + latency_age / 30.0 / 10.0) + -0.5 * 200.0 * read_lag);
    }
}

struct State {
    statuses: HashMap<String, ServerStatus>,
    /// Insertion order, so later servers win ties.
    order: Vec<String>,
    current: Option<String>,
}

/// Picks the best-scoring server, with hysteresis.
pub struct HighAvailabilityStrategy {
    state: Mutex<State>,
}

impl HighAvailabilityStrategy {
    /// Start with every server in `servers` at full health.
    pub fn new(servers: &[ServerDescriptor]) -> Self {
        let strategy = Self {
            state: Mutex::new(State {
                statuses: HashMap::new(),
                order: Vec::new(),
                current: None,
            }),
        };
        strategy.reload_servers(servers);
        strategy
    }

    fn choose_at(&self, now: Instant) -> Option<Arc<ServerDescriptor>> {
        let mut state = self.state.lock();
        let State { statuses, order, current } = &mut *state;

        let mut best: Option<(&str, f64)> = None;
        for id in order.iter() {
            if let Some(status) = statuses.get_mut(id) {
                status.rescore(now);
                if best.map_or(true, |(_, score)| status.score >= score) {
                    best = Some((id.as_str(), status.score));
                }
            }
        }
        let (best_id, best_score) = best?;

        let switch = match current.as_ref().and_then(|id| statuses.get(id)) {
            Some(status) => best_score - status.score > SWITCH_MARGIN,
            None => true,
        };
        if switch {
            if current.as_deref() != Some(best_id) {
                tracing::info!("HA switching to server {}", best_id);
            }
            *current = Some(best_id.to_string());
        }

        current
            .as_ref()
            .and_then(|id| statuses.get(id))
            .map(|status| Arc::clone(&status.server))
    }

    fn update<F>(&self, server: &ServerDescriptor, f: F)
    where
        F: FnOnce(&mut ServerStatus),
    {
        if let Some(status) = self.state.lock().statuses.get_mut(&server.identifier()) {
            f(status);
        }
    }
}

impl Strategy for HighAvailabilityStrategy {
    fn name(&self) -> &str {
        "High Availability"
    }

    fn id(&self) -> &str {
        "ss-local.strategy.ha"
    }

    fn reload_servers(&self, servers: &[ServerDescriptor]) {
        let now = Instant::now();
        let mut state = self.state.lock();
        let mut statuses = HashMap::with_capacity(servers.len());
        let mut order = Vec::with_capacity(servers.len());

        for server in servers {
            let id = server.identifier();
            let status = match state.statuses.remove(&id) {
                Some(mut kept) => {
                    kept.server = Arc::new(server.clone());
                    kept
                }
                None => ServerStatus::new(Arc::new(server.clone()), now),
            };
            if statuses.insert(id.clone(), status).is_none() {
                order.push(id);
            }
        }

        if state.current.as_ref().map_or(false, |id| !statuses.contains_key(id)) {
            state.current = None;
        }
        state.statuses = statuses;
        state.order = order;
    }

    fn choose_server(&self, caller: CallerType, _: SocketAddr, _: Option<&Address>) -> Option<Arc<ServerDescriptor>> {
        match caller {
            CallerType::Tcp => self.choose_at(Instant::now()),
            CallerType::Udp => {
                let current = {
                    let state = self.state.lock();
                    state
                        .current
                        .as_ref()
                        .and_then(|id| state.statuses.get(id))
                        .map(|status| Arc::clone(&status.server))
                };
                current.or_else(|| self.choose_at(Instant::now()))
            }
        }
    }

    fn report_latency(&self, server: &ServerDescriptor, latency: Duration) {
        tracing::debug!("latency {}: {:?}", server.friendly_name(), latency);
        self.update(server, |status| {
            status.latency = latency;
            status.latency_at = Instant::now();
        });
    }

    fn report_last_read(&self, server: &ServerDescriptor) {
        self.update(server, |status| status.last_read = Instant::now());
    }

    fn report_last_write(&self, server: &ServerDescriptor) {
        self.update(server, |status| status.last_write = Instant::now());
    }

    fn report_failure(&self, server: &ServerDescriptor) {
        tracing::debug!("failure {}", server.friendly_name());
        self.update(server, |status| status.last_failure = Some(Instant::now()));
    }
}
