//! Per-client request limiting for the `/v1` routes
//!
//! Each client key (the peer address) keeps the instants of its recent
//! requests; a request is admitted while fewer than `max_requests` fall inside
//! the sliding window. A periodic cleanup drops keys with no recent requests.

use crate::observability::metrics::metrics;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};
use warp::{Filter, Rejection};

/// Key used when the peer address is unknown
pub const UNKNOWN_CLIENT: &str = "unknown";

#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub max_requests: u32,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_requests: 100,
            window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitResult {
    Allowed { remaining: u32 },
    Limited { retry_after: Duration },
}

/// Client over its request budget
#[derive(Debug)]
pub struct RateLimited {
    pub retry_after: Duration,
}

impl warp::reject::Reject for RateLimited {}

pub struct RateLimiter {
    config: RateLimitConfig,
    clients: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Admit or refuse one request from `key`; admitted requests are recorded
    pub fn check(&self, key: &str, now: Instant) -> RateLimitResult {
        if !self.config.enabled {
            return RateLimitResult::Allowed {
                remaining: self.config.max_requests,
            };
        }

        let mut clients = self.clients.lock();
        let requests = clients.entry(key.to_string()).or_default();
        prune(requests, now, self.config.window);

        let used = u32::try_from(requests.len()).unwrap_or(u32::MAX);
        if used >= self.config.max_requests {
            // The oldest request leaving the window frees the next slot
            let retry_after = requests
                .front()
                .map(|oldest| (*oldest + self.config.window).saturating_duration_since(now))
                .unwrap_or(self.config.window);
            return RateLimitResult::Limited { retry_after };
        }

        requests.push_back(now);
        RateLimitResult::Allowed {
            remaining: self.config.max_requests - used - 1,
        }
    }

    /// Forget clients with no request inside the window; returns how many
    pub fn cleanup(&self, now: Instant) -> usize {
        let mut clients = self.clients.lock();
        let before = clients.len();
        clients.retain(|_, requests| {
            prune(requests, now, self.config.window);
            !requests.is_empty()
        });
        before - clients.len()
    }

    pub fn tracked_clients(&self) -> usize {
        self.clients.lock().len()
    }

    /// Spawn the periodic cleanup, one pass per window
    pub fn start_cleanup(self: &Arc<Self>) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        let period = self.config.window;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let removed = limiter.cleanup(Instant::now());
                if removed > 0 {
                    debug!(removed, "Rate limiter cleanup finished");
                }
            }
        })
    }
}

fn prune(requests: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(&oldest) = requests.front() {
        if now.saturating_duration_since(oldest) >= window {
            requests.pop_front();
        } else {
            break;
        }
    }
}

/// Reject with [`RateLimited`] when the peer is over its budget
pub fn rate_limit(
    limiter: Arc<RateLimiter>,
) -> impl Filter<Extract = (), Error = Rejection> + Clone {
    warp::addr::remote()
        .and_then(move |peer: Option<SocketAddr>| {
            let limiter = limiter.clone();
            async move {
                let key = peer.map_or_else(
                    || UNKNOWN_CLIENT.to_string(),
                    |addr| addr.ip().to_string(),
                );
                match limiter.check(&key, Instant::now()) {
                    RateLimitResult::Allowed { .. } => Ok(()),
                    RateLimitResult::Limited { retry_after } => {
                        metrics().request_rate_limited();
                        warn!(
                            client = %key,
                            retry_after_secs = retry_after_secs(retry_after),
                            "Rate limit exceeded"
                        );
                        Err(warp::reject::custom(RateLimited { retry_after }))
                    }
                }
            }
        })
        .untuple_one()
}

/// Whole seconds for a `Retry-After` header, never zero
pub fn retry_after_secs(retry_after: Duration) -> u64 {
    let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
    secs.max(1)
}
