//! Per-(node, service) endpoint pools.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use reef_core::error::Result;
use reef_core::service::ServiceType;

use crate::config::{CoreConfig, PoolConfig, ReconnectConfig, SelectionStrategy};
use crate::credentials::SharedCredentials;
use crate::endpoint::{Endpoint, EndpointState};
use crate::events::EventBus;

/// How often the reaper inspects the pool for idle surplus endpoints.
const REAPER_INTERVAL: Duration = Duration::from_secs(1);

struct PoolMember {
    endpoint: Arc<Endpoint>,
    retired: Arc<AtomicBool>,
    supervisor: JoinHandle<()>,
}

impl PoolMember {
    async fn retire(self) {
        self.retired.store(true, Ordering::Release);
        self.supervisor.abort();
        self.endpoint.close().await;
    }
}

/// A set of endpoints for one (node, service-type) pair.
///
/// The pool grows on demand up to its maximum when every endpoint is
/// saturated, shrinks idle surplus back towards its minimum, and supervises
/// reconnects for bounced endpoints with jittered exponential backoff.
pub struct ServicePool {
    host: String,
    port: u16,
    service: ServiceType,
    pool_config: PoolConfig,
    core_config: Arc<CoreConfig>,
    credentials: SharedCredentials,
    bucket: Option<String>,
    bus: Arc<dyn EventBus>,
    core_id: Uuid,
    members: Mutex<Vec<PoolMember>>,
    rr: AtomicUsize,
    shutdown_tx: watch::Sender<bool>,
}

impl std::fmt::Debug for ServicePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServicePool")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("service", &self.service)
            .finish()
    }
}

impl ServicePool {
    /// Creates a pool and starts its idle reaper.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        host: impl Into<String>,
        port: u16,
        service: ServiceType,
        pool_config: PoolConfig,
        core_config: Arc<CoreConfig>,
        credentials: SharedCredentials,
        bucket: Option<String>,
        bus: Arc<dyn EventBus>,
        core_id: Uuid,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        let pool = Arc::new(Self {
            host: host.into(),
            port,
            service,
            pool_config,
            core_config,
            credentials,
            bucket,
            bus,
            core_id,
            members: Mutex::new(Vec::new()),
            rr: AtomicUsize::new(0),
            shutdown_tx,
        });
        Self::spawn_reaper(&pool);
        pool
    }

    /// Returns the node this pool targets, as `host:port`.
    pub fn node(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Returns the service this pool serves.
    pub fn service(&self) -> ServiceType {
        self.service
    }

    /// Returns the number of endpoints currently owned by the pool.
    pub async fn endpoint_count(&self) -> usize {
        self.members.lock().await.len()
    }

    /// Returns the number of endpoints accepting dispatch.
    pub async fn connected_count(&self) -> usize {
        self.members
            .lock()
            .await
            .iter()
            .filter(|m| m.endpoint.can_dispatch())
            .count()
    }

    /// Returns the total number of requests in flight across the pool.
    pub async fn in_flight_total(&self) -> usize {
        self.members
            .lock()
            .await
            .iter()
            .map(|m| m.endpoint.in_flight())
            .sum()
    }

    /// Selects an endpoint for dispatch.
    ///
    /// Returns `None` when every endpoint is saturated and the pool is at
    /// its maximum; the dispatcher then applies the request's retry
    /// strategy.
    pub async fn select(&self) -> Option<Arc<Endpoint>> {
        if *self.shutdown_tx.borrow() {
            return None;
        }
        let mut members = self.members.lock().await;

        let dispatchable: Vec<&PoolMember> = members
            .iter()
            .filter(|m| m.endpoint.can_dispatch() && m.endpoint.has_capacity())
            .collect();

        if !dispatchable.is_empty() {
            let chosen = match self.pool_config.strategy() {
                SelectionStrategy::FirstAvailable => dispatchable[0],
                SelectionStrategy::RoundRobin => {
                    let index = self.rr.fetch_add(1, Ordering::Relaxed) % dispatchable.len();
                    dispatchable[index]
                }
            };
            return Some(chosen.endpoint.clone());
        }

        // All saturated (or none connected yet): grow when allowed.
        if members.len() < self.pool_config.max_endpoints() {
            match self.create_member().await {
                Ok(member) => {
                    let endpoint = member.endpoint.clone();
                    members.push(member);
                    return Some(endpoint);
                }
                Err(e) => {
                    tracing::warn!(
                        node = %self.node(),
                        service = %self.service,
                        error = %e,
                        "failed to grow pool"
                    );
                    return None;
                }
            }
        }
        None
    }

    /// Opens endpoints until the configured minimum is reached.
    pub async fn ensure_min(&self) -> Result<()> {
        let mut members = self.members.lock().await;
        while members.len() < self.pool_config.min_endpoints() {
            let member = self.create_member().await?;
            members.push(member);
        }
        Ok(())
    }

    async fn create_member(&self) -> Result<PoolMember> {
        let endpoint = Arc::new(Endpoint::new(
            self.host.clone(),
            self.port,
            self.pool_config.max_in_flight(),
            self.core_config.clone(),
            self.credentials.clone(),
            self.bucket.clone(),
            self.bus.clone(),
            self.core_id,
        ));
        endpoint.connect().await?;

        let retired = Arc::new(AtomicBool::new(false));
        let supervisor = spawn_reconnect_supervisor(
            endpoint.clone(),
            retired.clone(),
            self.core_config.reconnect().clone(),
            self.shutdown_tx.subscribe(),
        );
        Ok(PoolMember {
            endpoint,
            retired,
            supervisor,
        })
    }

    fn spawn_reaper(pool: &Arc<Self>) {
        let weak = Arc::downgrade(pool);
        let mut shutdown_rx = pool.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REAPER_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(pool) = weak.upgrade() else { return };
                        pool.reap_idle().await;
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            return;
                        }
                    }
                }
            }
        });
    }

    /// Closes surplus endpoints that sat idle past the configured window.
    async fn reap_idle(&self) {
        let idle_time = self.pool_config.idle_time();
        let min = self.pool_config.min_endpoints();
        let mut retired = Vec::new();

        {
            let mut members = self.members.lock().await;
            let mut index = 0;
            while index < members.len() {
                if members.len() <= min {
                    break;
                }
                let expired = members[index]
                    .endpoint
                    .idle_since()
                    .map(|since| since.elapsed() >= idle_time)
                    .unwrap_or(false);
                if expired {
                    retired.push(members.remove(index));
                } else {
                    index += 1;
                }
            }
        }

        for member in retired {
            tracing::debug!(
                node = %self.node(),
                endpoint = %member.endpoint.id(),
                "closing idle endpoint"
            );
            member.retire().await;
        }
    }

    /// Closes the pool and every endpoint in it.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        let members = std::mem::take(&mut *self.members.lock().await);
        for member in members {
            member.retire().await;
        }
    }
}

/// Re-enters `connecting` with backoff whenever the endpoint bounces.
fn spawn_reconnect_supervisor(
    endpoint: Arc<Endpoint>,
    retired: Arc<AtomicBool>,
    reconnect: ReconnectConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut state_rx = endpoint.subscribe_state();
        loop {
            while *state_rx.borrow() != EndpointState::Disconnected {
                tokio::select! {
                    changed = state_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                    _ = shutdown_rx.changed() => return,
                }
            }
            if retired.load(Ordering::Acquire) {
                return;
            }

            let mut attempt = 0u32;
            loop {
                let delay = reconnect.backoff_for_attempt(attempt);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown_rx.changed() => return,
                }
                if retired.load(Ordering::Acquire) {
                    return;
                }
                match endpoint.connect().await {
                    Ok(()) => break,
                    Err(e) => {
                        attempt += 1;
                        tracing::debug!(
                            endpoint = %endpoint.id(),
                            attempt,
                            error = %e,
                            "reconnect attempt failed"
                        );
                    }
                }
            }
        }
    })
}
