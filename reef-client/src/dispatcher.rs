//! The core dispatcher: typed requests in, routed and retried dispatch out.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{watch, Mutex};
use uuid::Uuid;

use reef_core::error::{status_to_error, CoreError, ErrorContext, Result};
use reef_core::protocol::{KvRequest, KvResponse, Status};
use reef_core::service::ServiceType;

use crate::config::CoreConfig;
use crate::connstr::{ConnectionString, SeedHost};
use crate::credentials::SharedCredentials;
use crate::events::{CoreEvent, EventBus, EventContext};
use crate::locator::{KeyValueLocator, RoundRobinLocator};
use crate::pool::ServicePool;
use crate::retry::{BestEffortRetryStrategy, RetryStrategy};
use crate::topology::{BucketConfig, ConfigProvider};

/// A typed request together with its dispatch policy.
#[derive(Debug)]
pub struct KvOperation {
    request: KvRequest,
    deadline: Option<tokio::time::Instant>,
    retry: Option<Arc<dyn RetryStrategy>>,
}

impl KvOperation {
    /// Wraps a request with the default deadline and retry strategy.
    pub fn new(request: KvRequest) -> Self {
        Self {
            request,
            deadline: None,
            retry: None,
        }
    }

    /// Sets an absolute deadline.
    pub fn with_deadline(mut self, deadline: tokio::time::Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Sets a deadline relative to now.
    pub fn with_timeout(self, timeout: std::time::Duration) -> Self {
        self.with_deadline(tokio::time::Instant::now() + timeout)
    }

    /// Sets the retry strategy.
    pub fn with_retry_strategy(mut self, retry: Arc<dyn RetryStrategy>) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Returns the wrapped request.
    pub fn request(&self) -> &KvRequest {
        &self.request
    }
}

impl From<KvRequest> for KvOperation {
    fn from(request: KvRequest) -> Self {
        Self::new(request)
    }
}

/// The entry point for typed requests.
///
/// The core owns the topology provider and the service pools; pools own
/// endpoints. Back-references run through ids and snapshots, never through
/// ownership.
pub struct Core {
    id: Uuid,
    config: Arc<CoreConfig>,
    credentials: SharedCredentials,
    bucket: Option<String>,
    seeds: Vec<SeedHost>,
    tls: bool,
    bus: Arc<dyn EventBus>,
    provider: ConfigProvider,
    kv_locator: KeyValueLocator,
    rr_locator: RoundRobinLocator,
    pools: Mutex<HashMap<(String, ServiceType), Arc<ServicePool>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl std::fmt::Debug for Core {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Core")
            .field("id", &self.id)
            .field("bucket", &self.bucket)
            .finish()
    }
}

impl Core {
    /// Connects a core against a connection string and loads the initial
    /// topology from the first reachable seed.
    pub async fn connect(
        connection_string: &str,
        credentials: SharedCredentials,
        config: CoreConfig,
        bus: Arc<dyn EventBus>,
    ) -> Result<Arc<Self>> {
        let connstr = ConnectionString::parse(connection_string)?;
        let tls = connstr.is_tls() || config.security().tls_enabled();
        let config = Arc::new(config.with_tls(tls));
        let id = Uuid::new_v4();

        let core = Arc::new(Self {
            id,
            config,
            credentials,
            bucket: connstr.bucket().map(str::to_string),
            seeds: connstr.hosts().to_vec(),
            tls,
            bus: bus.clone(),
            provider: ConfigProvider::new(id, bus),
            kv_locator: KeyValueLocator::new(),
            rr_locator: RoundRobinLocator::new(),
            pools: Mutex::new(HashMap::new()),
            shutdown_tx: watch::channel(false).0,
        });

        core.fetch_initial_config().await?;
        Ok(core)
    }

    /// Returns the core's id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Returns the bucket this core is bound to, if any.
    pub fn bucket(&self) -> Option<&str> {
        self.bucket.as_deref()
    }

    /// Returns true if channels are secured with TLS.
    pub fn tls(&self) -> bool {
        self.tls
    }

    /// Returns the current topology snapshot.
    pub fn topology(&self) -> Option<Arc<BucketConfig>> {
        self.provider.current()
    }

    /// Returns the topology provider, for feeding out-of-band config streams.
    pub fn config_provider(&self) -> &ConfigProvider {
        &self.provider
    }

    /// Resolves the node for an HTTP service via round-robin placement.
    pub fn http_node(&self, service: ServiceType) -> Result<(String, u16)> {
        let config = self.provider.current().ok_or_else(|| {
            CoreError::ServiceNotAvailable {
                service,
                ctx: ErrorContext::default(),
            }
        })?;
        let node = self
            .rr_locator
            .locate(service, &config)
            .ok_or_else(|| CoreError::ServiceNotAvailable {
                service,
                ctx: ErrorContext::default(),
            })?;
        let port = node
            .port_for(service, self.tls)
            .ok_or_else(|| CoreError::ServiceNotAvailable {
                service,
                ctx: ErrorContext::default(),
            })?;
        Ok((node.hostname().to_string(), port))
    }

    async fn fetch_initial_config(&self) -> Result<()> {
        let deadline =
            tokio::time::Instant::now() + self.config.timeouts().request_timeout();
        let mut last_error = None;

        for seed in self.seeds.clone() {
            let port = seed.kv_port(self.tls);
            let pool = self.pool_for(&seed.host, port, ServiceType::Kv).await;
            let Some(endpoint) = pool.select().await else {
                last_error = Some(CoreError::ServiceNotAvailable {
                    service: ServiceType::Kv,
                    ctx: ErrorContext::default().with_node(format!("{}:{}", seed.host, port)),
                });
                continue;
            };
            match endpoint.dispatch(&KvRequest::GetConfig, 0, deadline).await {
                Ok(response) if response.status.is_success() => {
                    self.provider.ingest(&response.value, &seed.host)?;
                    return Ok(());
                }
                Ok(response) => {
                    last_error = Some(CoreError::UnexpectedStatus {
                        status: response.status,
                        ctx: ErrorContext::default().with_node(endpoint.node()),
                    });
                }
                Err(e) => last_error = Some(e),
            }
        }

        Err(last_error.unwrap_or_else(|| CoreError::ServiceNotAvailable {
            service: ServiceType::Kv,
            ctx: ErrorContext::default(),
        }))
    }

    async fn pool_for(
        &self,
        host: &str,
        port: u16,
        service: ServiceType,
    ) -> Arc<ServicePool> {
        let key = (format!("{}:{}", host, port), service);
        let mut pools = self.pools.lock().await;
        if let Some(pool) = pools.get(&key) {
            return pool.clone();
        }
        let pool_config = if service == ServiceType::Kv {
            self.config.kv_pool().clone()
        } else {
            self.config.http_pool().clone()
        };
        let pool = ServicePool::new(
            host,
            port,
            service,
            pool_config,
            self.config.clone(),
            self.credentials.clone(),
            self.bucket.clone(),
            self.bus.clone(),
            self.id,
        );
        pools.insert(key, pool.clone());
        pool
    }

    /// Resolves the target node and partition for a request against the
    /// given topology snapshot.
    fn locate(
        &self,
        request: &KvRequest,
        config: &BucketConfig,
    ) -> Option<(String, u16, u16)> {
        match request.doc_key() {
            Some(key) => {
                let (partition, node) = self.kv_locator.locate(key.user_key(), config)?;
                let port = node.port_for(ServiceType::Kv, self.tls)?;
                Some((node.hostname().to_string(), port, partition))
            }
            None => {
                let node = self.rr_locator.locate(ServiceType::Kv, config)?;
                let port = node.port_for(ServiceType::Kv, self.tls)?;
                Some((node.hostname().to_string(), port, 0))
            }
        }
    }

    /// Dispatches a typed operation and awaits its completion.
    ///
    /// Retriable conditions (saturated pools, bounced connections,
    /// transient server statuses, topology misses) are retried under the
    /// operation's strategy until the deadline; everything else surfaces
    /// immediately with full context.
    pub async fn dispatch(&self, operation: impl Into<KvOperation>) -> Result<KvResponse> {
        let operation = operation.into();
        let correlation_id = Uuid::new_v4();
        let started = Instant::now();
        let deadline = operation.deadline.unwrap_or_else(|| {
            tokio::time::Instant::now() + self.config.timeouts().request_timeout()
        });
        let retry: Arc<dyn RetryStrategy> = operation
            .retry
            .clone()
            .unwrap_or_else(|| Arc::new(BestEffortRetryStrategy::default()));
        let request = operation.request;

        let is_insert = matches!(request, KvRequest::Insert { .. });
        let has_cas = request.cas() != 0;

        let mut attempt: u32 = 0;
        let mut written = false;
        let mut collection_refreshed = false;

        loop {
            if *self.shutdown_tx.borrow() {
                return Err(CoreError::RequestCanceled {
                    reason: "core shutdown in progress".to_string(),
                    ctx: self.error_ctx(correlation_id, None, started),
                });
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(self.timeout_error(correlation_id, None, started, written));
            }

            let target = self
                .provider
                .current()
                .and_then(|config| self.locate(&request, &config));
            let Some((host, port, partition)) = target else {
                // No topology yet or no eligible node; retry within deadline.
                attempt += 1;
                self.backoff(
                    &retry,
                    attempt,
                    deadline,
                    correlation_id,
                    "no reachable node for request",
                    started,
                    written,
                )
                .await?;
                continue;
            };
            let node = format!("{}:{}", host, port);

            let pool = self.pool_for(&host, port, ServiceType::Kv).await;
            let Some(endpoint) = pool.select().await else {
                attempt += 1;
                self.backoff(
                    &retry,
                    attempt,
                    deadline,
                    correlation_id,
                    "all endpoints saturated",
                    started,
                    written,
                )
                .await?;
                continue;
            };

            match endpoint.dispatch(&request, partition, deadline).await {
                Ok(response) => {
                    written = true;
                    match response.status {
                        Status::Success => return Ok(response),
                        Status::NotMyVbucket => {
                            // The response may piggyback a fresher config.
                            if !response.value.is_empty() {
                                let _ = self.provider.ingest(&response.value, &host);
                            } else {
                                self.refresh_config(deadline).await;
                            }
                            attempt += 1;
                            self.backoff(
                                &retry,
                                attempt,
                                deadline,
                                correlation_id,
                                "partition moved, retargeting",
                                started,
                                written,
                            )
                            .await?;
                        }
                        Status::UnknownCollection if !collection_refreshed => {
                            collection_refreshed = true;
                            self.refresh_config(deadline).await;
                            attempt += 1;
                            self.backoff(
                                &retry,
                                attempt,
                                deadline,
                                correlation_id,
                                "collection unknown, refreshing manifest",
                                started,
                                written,
                            )
                            .await?;
                        }
                        status if self.is_retriable(&endpoint, status) => {
                            attempt += 1;
                            self.backoff(
                                &retry,
                                attempt,
                                deadline,
                                correlation_id,
                                "transient server status",
                                started,
                                written,
                            )
                            .await?;
                        }
                        status => {
                            return Err(status_to_error(
                                status,
                                is_insert,
                                has_cas,
                                self.error_ctx(correlation_id, Some(node), started),
                            ));
                        }
                    }
                }
                Err(CoreError::ConnectionClosed { .. }) => {
                    attempt += 1;
                    self.backoff(
                        &retry,
                        attempt,
                        deadline,
                        correlation_id,
                        "connection bounced",
                        started,
                        written,
                    )
                    .await?;
                }
                Err(CoreError::AmbiguousTimeout { .. }) => {
                    return Err(self.timeout_error(correlation_id, Some(node), started, true));
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Classifies a status via the endpoint's error map, falling back to
    /// the built-in defaults.
    fn is_retriable(&self, endpoint: &crate::endpoint::Endpoint, status: Status) -> bool {
        match endpoint.error_map() {
            Some(map) => map.is_retriable(status),
            None => status.is_retriable(),
        }
    }

    /// Sleeps for the strategy's next delay, bounded by the deadline.
    #[allow(clippy::too_many_arguments)]
    async fn backoff(
        &self,
        retry: &Arc<dyn RetryStrategy>,
        attempt: u32,
        deadline: tokio::time::Instant,
        correlation_id: Uuid,
        reason: &str,
        started: Instant,
        written: bool,
    ) -> Result<()> {
        let Some(delay) = retry.next_delay(attempt) else {
            return Err(CoreError::ServiceNotAvailable {
                service: ServiceType::Kv,
                ctx: self.error_ctx(correlation_id, None, started),
            });
        };

        self.bus.publish(CoreEvent::RequestRetried {
            ctx: EventContext {
                core_id: Some(self.id),
                elapsed: started.elapsed(),
                ..Default::default()
            },
            correlation_id,
            service: ServiceType::Kv,
            reason: reason.to_string(),
        });
        tracing::debug!(
            correlation_id = %correlation_id,
            attempt,
            reason,
            delay_ms = delay.as_millis() as u64,
            "retrying request"
        );

        let wake = std::cmp::min(tokio::time::Instant::now() + delay, deadline);
        tokio::time::sleep_until(wake).await;
        if tokio::time::Instant::now() >= deadline {
            return Err(self.timeout_error(correlation_id, None, started, written));
        }
        Ok(())
    }

    fn error_ctx(
        &self,
        correlation_id: Uuid,
        node: Option<String>,
        started: Instant,
    ) -> ErrorContext {
        let mut ctx = ErrorContext::for_request(correlation_id)
            .with_service(ServiceType::Kv)
            .with_elapsed(started.elapsed());
        if let Some(node) = node {
            ctx = ctx.with_node(node);
        }
        ctx
    }

    fn timeout_error(
        &self,
        correlation_id: Uuid,
        node: Option<String>,
        started: Instant,
        written: bool,
    ) -> CoreError {
        self.bus.publish(CoreEvent::RequestTimeout {
            ctx: EventContext {
                core_id: Some(self.id),
                elapsed: started.elapsed(),
                ..Default::default()
            },
            correlation_id,
            service: ServiceType::Kv,
        });
        let ctx = self.error_ctx(correlation_id, node, started);
        if written {
            CoreError::AmbiguousTimeout { ctx }
        } else {
            CoreError::UnambiguousTimeout { ctx }
        }
    }

    /// Triggers an out-of-band config refresh, best effort.
    async fn refresh_config(&self, deadline: tokio::time::Instant) {
        let Some(config) = self.provider.current() else {
            return;
        };
        let Some(node) = config
            .nodes()
            .iter()
            .find(|n| n.has_service(ServiceType::Kv))
        else {
            return;
        };
        let Some(port) = node.port_for(ServiceType::Kv, self.tls) else {
            return;
        };
        let host = node.hostname().to_string();

        let pool = self.pool_for(&host, port, ServiceType::Kv).await;
        let Some(endpoint) = pool.select().await else {
            return;
        };
        match endpoint.dispatch(&KvRequest::GetConfig, 0, deadline).await {
            Ok(response) if response.status.is_success() => {
                let _ = self.provider.ingest(&response.value, &host);
            }
            Ok(response) => {
                tracing::debug!(status = %response.status, "config refresh declined");
            }
            Err(e) => {
                tracing::debug!(error = %e, "config refresh failed");
            }
        }
    }

    /// Drains and shuts the core down.
    ///
    /// New submissions are refused immediately; in-flight requests get the
    /// configured grace period before endpoints are force-closed. Shutdown
    /// is non-reversible.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        tracing::info!(core_id = %self.id, "core shutting down");

        let grace_deadline =
            tokio::time::Instant::now() + self.config.timeouts().shutdown_grace();
        loop {
            let pools: Vec<Arc<ServicePool>> =
                self.pools.lock().await.values().cloned().collect();
            let mut busy = false;
            for pool in &pools {
                if pool.in_flight_total().await > 0 {
                    busy = true;
                    break;
                }
            }
            if !busy || tokio::time::Instant::now() >= grace_deadline {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }

        let pools = std::mem::take(&mut *self.pools.lock().await);
        for (_, pool) in pools {
            pool.shutdown().await;
        }
        tracing::info!(core_id = %self.id, "core shut down");
    }
}
