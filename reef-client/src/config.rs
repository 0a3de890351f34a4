//! Core configuration types and builders.

use std::time::Duration;

use reef_core::protocol::CompressionConfig;

/// Default client name announced during feature negotiation.
const DEFAULT_CLIENT_NAME: &str = "reef-rs";
/// Default overall bootstrap deadline per connection.
const DEFAULT_BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(10);
/// Default TCP connect timeout.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default per-request deadline.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(2500);
/// Default grace period granted to in-flight requests at shutdown.
const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
/// Default minimum endpoints per (node, service) pool.
const DEFAULT_MIN_ENDPOINTS: usize = 1;
/// Default maximum endpoints per (node, service) pool.
const DEFAULT_MAX_ENDPOINTS: usize = 4;
/// Default idle time before a surplus endpoint is closed.
const DEFAULT_IDLE_TIME: Duration = Duration::from_secs(60);
/// Default per-connection in-flight cap.
const DEFAULT_MAX_IN_FLIGHT: usize = 128;
/// Default reconnect backoff floor.
const DEFAULT_RECONNECT_MIN: Duration = Duration::from_millis(32);
/// Default reconnect backoff ceiling.
const DEFAULT_RECONNECT_CAP: Duration = Duration::from_secs(4);
/// Default reconnect jitter fraction.
const DEFAULT_RECONNECT_JITTER: f64 = 0.1;

/// Configuration error returned when validation fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    message: String,
}

impl ConfigError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "configuration error: {}", self.message)
    }
}

impl std::error::Error for ConfigError {}

/// Endpoint selection strategy applied by a service pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionStrategy {
    /// Rotate over dispatchable endpoints; default for non-KV services.
    RoundRobin,
    /// Pick the first dispatchable endpoint; default for KV.
    FirstAvailable,
}

/// Configuration for one service pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    min_endpoints: usize,
    max_endpoints: usize,
    idle_time: Duration,
    max_in_flight: usize,
    strategy: SelectionStrategy,
}

impl PoolConfig {
    /// Returns the minimum number of endpoints kept open.
    pub fn min_endpoints(&self) -> usize {
        self.min_endpoints
    }

    /// Returns the maximum number of endpoints the pool may open.
    pub fn max_endpoints(&self) -> usize {
        self.max_endpoints
    }

    /// Returns how long an endpoint may sit idle before being closed.
    pub fn idle_time(&self) -> Duration {
        self.idle_time
    }

    /// Returns the per-connection in-flight cap.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    /// Returns the endpoint selection strategy.
    pub fn strategy(&self) -> SelectionStrategy {
        self.strategy
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_endpoints: DEFAULT_MIN_ENDPOINTS,
            max_endpoints: DEFAULT_MAX_ENDPOINTS,
            idle_time: DEFAULT_IDLE_TIME,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            strategy: SelectionStrategy::RoundRobin,
        }
    }
}

/// Builder for `PoolConfig`.
#[derive(Debug, Clone, Default)]
pub struct PoolConfigBuilder {
    min_endpoints: Option<usize>,
    max_endpoints: Option<usize>,
    idle_time: Option<Duration>,
    max_in_flight: Option<usize>,
    strategy: Option<SelectionStrategy>,
}

impl PoolConfigBuilder {
    /// Creates a new pool configuration builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the minimum number of endpoints.
    pub fn min_endpoints(mut self, min: usize) -> Self {
        self.min_endpoints = Some(min);
        self
    }

    /// Sets the maximum number of endpoints.
    pub fn max_endpoints(mut self, max: usize) -> Self {
        self.max_endpoints = Some(max);
        self
    }

    /// Sets the idle time before surplus endpoints are closed.
    pub fn idle_time(mut self, idle: Duration) -> Self {
        self.idle_time = Some(idle);
        self
    }

    /// Sets the per-connection in-flight cap.
    pub fn max_in_flight(mut self, cap: usize) -> Self {
        self.max_in_flight = Some(cap);
        self
    }

    /// Sets the endpoint selection strategy.
    pub fn strategy(mut self, strategy: SelectionStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Builds the pool configuration.
    pub fn build(self) -> Result<PoolConfig, ConfigError> {
        let min = self.min_endpoints.unwrap_or(DEFAULT_MIN_ENDPOINTS);
        let max = self.max_endpoints.unwrap_or(DEFAULT_MAX_ENDPOINTS);
        if max == 0 {
            return Err(ConfigError::new("max_endpoints must be at least 1"));
        }
        if min > max {
            return Err(ConfigError::new(format!(
                "min_endpoints ({}) exceeds max_endpoints ({})",
                min, max
            )));
        }
        let max_in_flight = self.max_in_flight.unwrap_or(DEFAULT_MAX_IN_FLIGHT);
        if max_in_flight == 0 {
            return Err(ConfigError::new("max_in_flight must be at least 1"));
        }
        Ok(PoolConfig {
            min_endpoints: min,
            max_endpoints: max,
            idle_time: self.idle_time.unwrap_or(DEFAULT_IDLE_TIME),
            max_in_flight,
            strategy: self.strategy.unwrap_or(SelectionStrategy::RoundRobin),
        })
    }
}

/// Reconnect backoff policy for bounced connections.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    min_backoff: Duration,
    max_backoff: Duration,
    jitter: f64,
}

impl ReconnectConfig {
    /// Returns the backoff floor.
    pub fn min_backoff(&self) -> Duration {
        self.min_backoff
    }

    /// Returns the backoff ceiling.
    pub fn max_backoff(&self) -> Duration {
        self.max_backoff
    }

    /// Returns the jitter fraction applied to each delay.
    pub fn jitter(&self) -> f64 {
        self.jitter
    }

    /// Computes the backoff for the given attempt with jitter applied.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self
            .min_backoff
            .saturating_mul(2u32.saturating_pow(attempt.min(16)));
        let capped = std::cmp::min(exp, self.max_backoff);
        if self.jitter <= 0.0 {
            return capped;
        }
        use rand::Rng;
        let factor = 1.0 + rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        Duration::from_secs_f64((capped.as_secs_f64() * factor).max(0.0))
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            min_backoff: DEFAULT_RECONNECT_MIN,
            max_backoff: DEFAULT_RECONNECT_CAP,
            jitter: DEFAULT_RECONNECT_JITTER,
        }
    }
}

/// Timeout configuration for the request path.
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    connect_timeout: Duration,
    bootstrap_timeout: Duration,
    request_timeout: Duration,
    shutdown_grace: Duration,
}

impl TimeoutConfig {
    /// Returns the TCP/TLS connect timeout.
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Returns the overall bootstrap deadline per connection.
    pub fn bootstrap_timeout(&self) -> Duration {
        self.bootstrap_timeout
    }

    /// Returns the default per-request deadline.
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Returns the shutdown grace period for in-flight requests.
    pub fn shutdown_grace(&self) -> Duration {
        self.shutdown_grace
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            bootstrap_timeout: DEFAULT_BOOTSTRAP_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

/// Builder for `TimeoutConfig`.
#[derive(Debug, Clone, Default)]
pub struct TimeoutConfigBuilder {
    connect_timeout: Option<Duration>,
    bootstrap_timeout: Option<Duration>,
    request_timeout: Option<Duration>,
    shutdown_grace: Option<Duration>,
}

impl TimeoutConfigBuilder {
    /// Creates a new timeout configuration builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the TCP/TLS connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Sets the overall bootstrap deadline per connection.
    pub fn bootstrap_timeout(mut self, timeout: Duration) -> Self {
        self.bootstrap_timeout = Some(timeout);
        self
    }

    /// Sets the default per-request deadline.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Sets the shutdown grace period.
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = Some(grace);
        self
    }

    /// Builds the timeout configuration.
    pub fn build(self) -> TimeoutConfig {
        TimeoutConfig {
            connect_timeout: self.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT),
            bootstrap_timeout: self.bootstrap_timeout.unwrap_or(DEFAULT_BOOTSTRAP_TIMEOUT),
            request_timeout: self.request_timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT),
            shutdown_grace: self.shutdown_grace.unwrap_or(DEFAULT_SHUTDOWN_GRACE),
        }
    }
}

/// Security settings for the channel.
#[derive(Debug, Clone, Default)]
pub struct SecurityConfig {
    tls_enabled: bool,
}

impl SecurityConfig {
    /// Returns true if connections are secured with TLS.
    pub fn tls_enabled(&self) -> bool {
        self.tls_enabled
    }

    /// Enables or disables TLS.
    pub fn with_tls(mut self, enabled: bool) -> Self {
        self.tls_enabled = enabled;
        self
    }
}

/// I/O scheduling settings.
#[derive(Debug, Clone, Default)]
pub struct IoConfig {
    worker_threads: Option<usize>,
}

impl IoConfig {
    /// Returns the configured I/O worker count, defaulting to host CPUs.
    pub fn worker_threads(&self) -> Option<usize> {
        self.worker_threads
    }

    /// Sets the I/O worker count.
    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = Some(threads);
        self
    }
}

/// Top-level configuration for a [`Core`](crate::dispatcher::Core).
#[derive(Debug, Clone)]
pub struct CoreConfig {
    client_name: String,
    kv_pool: PoolConfig,
    http_pool: PoolConfig,
    timeouts: TimeoutConfig,
    compression: CompressionConfig,
    reconnect: ReconnectConfig,
    security: SecurityConfig,
    io: IoConfig,
}

impl CoreConfig {
    /// Creates a builder for the core configuration.
    pub fn builder() -> CoreConfigBuilder {
        CoreConfigBuilder::new()
    }

    /// Returns the client name announced during feature negotiation.
    pub fn client_name(&self) -> &str {
        &self.client_name
    }

    /// Returns the pool configuration for the KV service.
    pub fn kv_pool(&self) -> &PoolConfig {
        &self.kv_pool
    }

    /// Returns the pool configuration for HTTP services.
    pub fn http_pool(&self) -> &PoolConfig {
        &self.http_pool
    }

    /// Returns the timeout configuration.
    pub fn timeouts(&self) -> &TimeoutConfig {
        &self.timeouts
    }

    /// Returns the compression policy.
    pub fn compression(&self) -> &CompressionConfig {
        &self.compression
    }

    /// Returns the reconnect backoff policy.
    pub fn reconnect(&self) -> &ReconnectConfig {
        &self.reconnect
    }

    /// Returns the security settings.
    pub fn security(&self) -> &SecurityConfig {
        &self.security
    }

    /// Returns the I/O scheduling settings.
    pub fn io(&self) -> &IoConfig {
        &self.io
    }

    /// Returns a copy of this configuration with TLS forced on or off.
    ///
    /// Used when the connection string scheme decides channel security.
    pub fn with_tls(mut self, enabled: bool) -> Self {
        self.security = self.security.with_tls(enabled);
        self
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        CoreConfigBuilder::new().build().expect("default config is valid")
    }
}

/// Builder for `CoreConfig`.
#[derive(Debug, Clone, Default)]
pub struct CoreConfigBuilder {
    client_name: Option<String>,
    kv_pool: Option<PoolConfig>,
    http_pool: Option<PoolConfig>,
    timeouts: Option<TimeoutConfig>,
    compression: Option<CompressionConfig>,
    reconnect: Option<ReconnectConfig>,
    security: Option<SecurityConfig>,
    io: Option<IoConfig>,
}

impl CoreConfigBuilder {
    /// Creates a new core configuration builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the client name announced during feature negotiation.
    pub fn client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = Some(name.into());
        self
    }

    /// Configures the KV pool via a builder closure.
    pub fn kv_pool(
        mut self,
        f: impl FnOnce(PoolConfigBuilder) -> PoolConfigBuilder,
    ) -> Result<Self, ConfigError> {
        self.kv_pool = Some(f(PoolConfigBuilder::new().strategy(SelectionStrategy::FirstAvailable)).build()?);
        Ok(self)
    }

    /// Configures the HTTP pool via a builder closure.
    pub fn http_pool(
        mut self,
        f: impl FnOnce(PoolConfigBuilder) -> PoolConfigBuilder,
    ) -> Result<Self, ConfigError> {
        self.http_pool = Some(f(PoolConfigBuilder::new()).build()?);
        Ok(self)
    }

    /// Configures timeouts via a builder closure.
    pub fn timeouts(mut self, f: impl FnOnce(TimeoutConfigBuilder) -> TimeoutConfigBuilder) -> Self {
        self.timeouts = Some(f(TimeoutConfigBuilder::new()).build());
        self
    }

    /// Sets the compression policy.
    pub fn compression(mut self, compression: CompressionConfig) -> Self {
        self.compression = Some(compression);
        self
    }

    /// Sets the reconnect backoff policy.
    pub fn reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = Some(reconnect);
        self
    }

    /// Sets the security settings.
    pub fn security(mut self, security: SecurityConfig) -> Self {
        self.security = Some(security);
        self
    }

    /// Sets the I/O scheduling settings.
    pub fn io(mut self, io: IoConfig) -> Self {
        self.io = Some(io);
        self
    }

    /// Builds the core configuration.
    pub fn build(self) -> Result<CoreConfig, ConfigError> {
        let client_name = self
            .client_name
            .unwrap_or_else(|| DEFAULT_CLIENT_NAME.to_string());
        if client_name.is_empty() {
            return Err(ConfigError::new("client_name must not be empty"));
        }

        let kv_pool = match self.kv_pool {
            Some(pool) => pool,
            None => PoolConfigBuilder::new()
                .max_endpoints(1)
                .strategy(SelectionStrategy::FirstAvailable)
                .build()?,
        };

        Ok(CoreConfig {
            client_name,
            kv_pool,
            http_pool: self.http_pool.unwrap_or_default(),
            timeouts: self.timeouts.unwrap_or_default(),
            compression: self.compression.unwrap_or_default(),
            reconnect: self.reconnect.unwrap_or_default(),
            security: self.security.unwrap_or_default(),
            io: self.io.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CoreConfig::default();
        assert_eq!(config.client_name(), "reef-rs");
        assert_eq!(config.kv_pool().max_endpoints(), 1);
        assert_eq!(config.kv_pool().strategy(), SelectionStrategy::FirstAvailable);
        assert_eq!(config.http_pool().strategy(), SelectionStrategy::RoundRobin);
    }

    #[test]
    fn test_pool_validation() {
        let result = PoolConfigBuilder::new()
            .min_endpoints(4)
            .max_endpoints(2)
            .build();
        assert!(result.is_err());

        let result = PoolConfigBuilder::new().max_endpoints(0).build();
        assert!(result.is_err());

        let result = PoolConfigBuilder::new().max_in_flight(0).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_builder_sections() {
        let config = CoreConfig::builder()
            .client_name("test-client")
            .kv_pool(|p| p.max_endpoints(2).max_in_flight(1))
            .unwrap()
            .timeouts(|t| t.request_timeout(Duration::from_millis(200)))
            .build()
            .unwrap();

        assert_eq!(config.client_name(), "test-client");
        assert_eq!(config.kv_pool().max_endpoints(), 2);
        assert_eq!(config.kv_pool().max_in_flight(), 1);
        assert_eq!(
            config.timeouts().request_timeout(),
            Duration::from_millis(200)
        );
    }

    #[test]
    fn test_empty_client_name_rejected() {
        assert!(CoreConfig::builder().client_name("").build().is_err());
    }

    #[test]
    fn test_reconnect_backoff_growth() {
        let reconnect = ReconnectConfig {
            min_backoff: Duration::from_millis(32),
            max_backoff: Duration::from_secs(4),
            jitter: 0.0,
        };
        assert_eq!(reconnect.backoff_for_attempt(0), Duration::from_millis(32));
        assert_eq!(reconnect.backoff_for_attempt(1), Duration::from_millis(64));
        assert_eq!(reconnect.backoff_for_attempt(3), Duration::from_millis(256));
        assert_eq!(reconnect.backoff_for_attempt(20), Duration::from_secs(4));
    }

    #[test]
    fn test_reconnect_jitter_bounds() {
        let reconnect = ReconnectConfig::default();
        for attempt in 0..8 {
            let delay = reconnect.backoff_for_attempt(attempt);
            let base = std::cmp::min(
                Duration::from_millis(32) * 2u32.pow(attempt),
                Duration::from_secs(4),
            );
            let lower = base.as_secs_f64() * 0.89;
            let upper = base.as_secs_f64() * 1.11;
            let actual = delay.as_secs_f64();
            assert!(actual >= lower && actual <= upper, "attempt {}", attempt);
        }
    }
}
