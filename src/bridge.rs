//! Process-scoped bridge state
//!
//! Bundles the session pool, circuit breaker, lifecycle coordinator and
//! shutdown coordinator behind explicit `start` and `shutdown` entry points.
//! The HTTP layer receives an `Arc<Bridge>`.

use crate::api::rate_limit::RateLimiter;
use crate::circuit_breaker::CircuitBreaker;
use crate::config::BridgeConfig;
use crate::lifecycle::MessageLifecycleCoordinator;
use crate::session::CredentialSessionPool;
use crate::shutdown::{ShutdownCoordinator, ShutdownReport};
use crate::transport::amqp::LapinTransport;
use crate::transport::BrokerTransport;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub struct Bridge {
    config: BridgeConfig,
    coordinator: Arc<MessageLifecycleCoordinator>,
    shutdown: ShutdownCoordinator,
    rate_limiter: Arc<RateLimiter>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    limiter_cleanup: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl Bridge {
    /// Build the bridge on `transport` and start its background work
    pub async fn start(config: BridgeConfig, transport: Arc<dyn BrokerTransport>) -> Arc<Self> {
        let pool = Arc::new(CredentialSessionPool::new(transport, config.pool_settings()));
        let breaker = Arc::new(CircuitBreaker::new(config.circuit_breaker_config()));
        let coordinator = Arc::new(MessageLifecycleCoordinator::new(
            pool.clone(),
            breaker,
            config.lifecycle_settings(),
            config.system_credential(),
        ));
        let shutdown = ShutdownCoordinator::new(coordinator.clone(), config.shutdown_settings());

        let sweeper = pool.start_idle_sweeper(config.sweep_interval(), config.idle_timeout());
        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit_config()));
        let limiter_cleanup = config
            .rate_limit
            .enabled
            .then(|| rate_limiter.start_cleanup());
        coordinator.open_system_session().await;

        info!(
            broker = %config.masked_broker_url(),
            system_session = coordinator.system_credential().is_some(),
            idle_timeout_secs = config.pool.idle_timeout_secs,
            rate_limit = config.rate_limit.enabled,
            "Bridge started"
        );

        Arc::new(Self {
            config,
            coordinator,
            shutdown,
            rate_limiter,
            sweeper: Mutex::new(Some(sweeper)),
            limiter_cleanup: Mutex::new(limiter_cleanup),
            stopped: AtomicBool::new(false),
        })
    }

    /// Start against the broker named in the configuration
    pub async fn connect(config: BridgeConfig) -> Arc<Self> {
        let transport = Arc::new(LapinTransport::new(
            config.broker.url.clone(),
            config.poll_interval(),
        ));
        Self::start(config, transport).await
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &Arc<MessageLifecycleCoordinator> {
        &self.coordinator
    }

    pub fn pool(&self) -> &Arc<CredentialSessionPool> {
        self.coordinator.pool()
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        self.coordinator.breaker()
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Drain and close everything. Only the first call does work.
    pub async fn shutdown(&self) -> ShutdownReport {
        if self.stopped.swap(true, Ordering::AcqRel) {
            warn!("Bridge shutdown already performed");
            return ShutdownReport::default();
        }

        if let Some(cleanup) = self.limiter_cleanup.lock().take() {
            cleanup.abort();
        }
        let sweeper = self.sweeper.lock().take();
        self.shutdown.shutdown(sweeper).await
    }
}
