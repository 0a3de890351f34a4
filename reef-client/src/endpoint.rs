//! A single dispatchable connection to a (node, service) pair.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::{Decoder, Encoder};
use uuid::Uuid;

use reef_core::errmap::ErrorMap;
use reef_core::error::{CoreError, ErrorContext, Result};
use reef_core::protocol::{
    decode_response, ChannelContext, KvCodec, KvFrame, KvRequest, KvResponse,
};

use crate::bootstrap::{self, BootstrapArgs};
use crate::config::CoreConfig;
use crate::connection::KvConnection;
use crate::credentials::SharedCredentials;
use crate::events::{CoreEvent, EventBus, EventContext};

/// Unique identifier for an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointId(u64);

impl EndpointId {
    /// Generates a new unique endpoint ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw ID value.
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl Default for EndpointId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EndpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ep-{}", self.0)
    }
}

/// Endpoint lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    /// No connection; the initial and terminal state.
    Disconnected,
    /// TCP/TLS connect and bootstrap in progress.
    Connecting,
    /// Bootstrapped; accepting dispatch.
    Connected,
    /// Draining towards disconnected.
    Disconnecting,
}

struct Shared {
    id: EndpointId,
    core_id: Uuid,
    node: String,
    state_tx: watch::Sender<EndpointState>,
    in_flight: Mutex<HashMap<u32, oneshot::Sender<KvFrame>>>,
    bus: Arc<dyn EventBus>,
    addrs: Mutex<(Option<SocketAddr>, Option<SocketAddr>)>,
}

impl Shared {
    fn event_ctx(&self) -> EventContext {
        let (local, remote) = *self.addrs.lock().expect("addr lock poisoned");
        EventContext::for_connection(self.core_id, local, remote)
    }

    /// Completes the in-flight entry matching the frame's opaque.
    fn complete(&self, frame: KvFrame) {
        let entry = self
            .in_flight
            .lock()
            .expect("in-flight lock poisoned")
            .remove(&frame.opaque);
        match entry {
            Some(tx) => {
                // The receiver may have been cancelled; late replies are
                // silently discarded.
                let _ = tx.send(frame);
            }
            None => {
                tracing::warn!(
                    endpoint = %self.id,
                    opaque = frame.opaque,
                    "dropping response with unknown opaque"
                );
                self.bus.publish(CoreEvent::UnknownResponseReceived {
                    ctx: self.event_ctx(),
                    opaque: frame.opaque,
                });
            }
        }
    }

    /// Drops every in-flight entry; receivers observe `ConnectionClosed`.
    fn fail_all_in_flight(&self) {
        let drained: Vec<_> = self
            .in_flight
            .lock()
            .expect("in-flight lock poisoned")
            .drain()
            .collect();
        if !drained.is_empty() {
            tracing::debug!(
                endpoint = %self.id,
                count = drained.len(),
                "failing in-flight requests on connection loss"
            );
        }
    }

    fn mark_disconnected(&self) {
        let mut changed = false;
        self.state_tx.send_if_modified(|state| {
            if *state != EndpointState::Disconnected {
                *state = EndpointState::Disconnected;
                changed = true;
                true
            } else {
                false
            }
        });
        if changed {
            self.bus.publish(CoreEvent::EndpointDisconnected {
                ctx: self.event_ctx(),
            });
        }
    }
}

struct ActiveChannel {
    write_tx: mpsc::Sender<KvFrame>,
    ctx: Arc<ChannelContext>,
    error_map: Option<Arc<ErrorMap>>,
    read_task: JoinHandle<()>,
    write_task: JoinHandle<()>,
}

/// One connection with a strict lifecycle and an opaque-keyed in-flight map.
///
/// The endpoint owns its connection exclusively; requests from any task are
/// handed to the single write loop and responses are matched back by opaque.
pub struct Endpoint {
    host: String,
    port: u16,
    max_in_flight: usize,
    config: Arc<CoreConfig>,
    credentials: SharedCredentials,
    bucket: Option<String>,
    shared: Arc<Shared>,
    opaque: AtomicU32,
    channel: Mutex<Option<ActiveChannel>>,
    last_activity: Mutex<Instant>,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.shared.id)
            .field("node", &self.shared.node)
            .field("state", &self.state())
            .finish()
    }
}

impl Endpoint {
    /// Creates a disconnected endpoint for the given node.
    pub fn new(
        host: impl Into<String>,
        port: u16,
        max_in_flight: usize,
        config: Arc<CoreConfig>,
        credentials: SharedCredentials,
        bucket: Option<String>,
        bus: Arc<dyn EventBus>,
        core_id: Uuid,
    ) -> Self {
        let host = host.into();
        let (state_tx, _) = watch::channel(EndpointState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                id: EndpointId::new(),
                core_id,
                node: format!("{}:{}", host, port),
                state_tx,
                in_flight: Mutex::new(HashMap::new()),
                bus,
                addrs: Mutex::new((None, None)),
            }),
            host,
            port,
            max_in_flight,
            config,
            credentials,
            bucket,
            opaque: AtomicU32::new(1),
            channel: Mutex::new(None),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    /// Returns the endpoint's unique identifier.
    pub fn id(&self) -> EndpointId {
        self.shared.id
    }

    /// Returns the target node as `host:port`.
    pub fn node(&self) -> &str {
        &self.shared.node
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> EndpointState {
        *self.shared.state_tx.borrow()
    }

    /// Subscribes to state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<EndpointState> {
        self.shared.state_tx.subscribe()
    }

    /// Returns true if the endpoint accepts dispatch.
    pub fn can_dispatch(&self) -> bool {
        self.state() == EndpointState::Connected
    }

    /// Returns the number of requests currently in flight.
    pub fn in_flight(&self) -> usize {
        self.shared
            .in_flight
            .lock()
            .expect("in-flight lock poisoned")
            .len()
    }

    /// Returns true if the endpoint has room below its in-flight cap.
    pub fn has_capacity(&self) -> bool {
        self.in_flight() < self.max_in_flight
    }

    /// Returns how long the endpoint has been idle, or `None` while busy.
    pub fn idle_since(&self) -> Option<Instant> {
        if self.in_flight() > 0 {
            return None;
        }
        Some(*self.last_activity.lock().expect("activity lock poisoned"))
    }

    /// Returns the negotiated channel context once connected.
    pub fn channel_context(&self) -> Option<Arc<ChannelContext>> {
        self.channel
            .lock()
            .expect("channel lock poisoned")
            .as_ref()
            .map(|c| c.ctx.clone())
    }

    /// Returns the error map loaded during bootstrap, if any.
    pub fn error_map(&self) -> Option<Arc<ErrorMap>> {
        self.channel
            .lock()
            .expect("channel lock poisoned")
            .as_ref()
            .and_then(|c| c.error_map.clone())
    }

    /// Connects and bootstraps the endpoint.
    ///
    /// On success the endpoint transitions to `Connected` and publishes
    /// itself as dispatchable; on failure it returns to `Disconnected`.
    pub async fn connect(&self) -> Result<()> {
        match self.state() {
            EndpointState::Connected => return Ok(()),
            EndpointState::Connecting | EndpointState::Disconnecting => {
                return Err(CoreError::InvalidArgument(format!(
                    "endpoint {} is busy transitioning",
                    self.shared.id
                )))
            }
            EndpointState::Disconnected => {}
        }
        self.shared.state_tx.send_replace(EndpointState::Connecting);
        let started = Instant::now();

        match self.connect_inner().await {
            Ok(()) => {
                self.shared.state_tx.send_replace(EndpointState::Connected);
                self.shared.bus.publish(CoreEvent::EndpointConnected {
                    ctx: self.shared.event_ctx().with_elapsed(started.elapsed()),
                });
                tracing::info!(endpoint = %self.shared.id, node = %self.shared.node, "endpoint connected");
                Ok(())
            }
            Err(e) => {
                self.shared.mark_disconnected();
                tracing::warn!(
                    endpoint = %self.shared.id,
                    node = %self.shared.node,
                    error = %e,
                    "endpoint bootstrap failed"
                );
                Err(e)
            }
        }
    }

    async fn connect_inner(&self) -> Result<()> {
        let timeouts = self.config.timeouts();
        let tls = self.config.security().tls_enabled();

        let mut connection = self.open_transport(tls, timeouts.connect_timeout()).await?;
        *self.shared.addrs.lock().expect("addr lock poisoned") =
            (connection.local_addr(), connection.peer_addr());

        let args = BootstrapArgs {
            client_name: self.config.client_name().to_string(),
            features: reef_core::protocol::ServerFeature::default_set(),
            credentials: self
                .credentials
                .credentials_for(reef_core::service::ServiceType::Kv),
            bucket: self.bucket.clone(),
            tls,
            core_id: self.shared.core_id,
        };
        let deadline = tokio::time::Instant::now() + timeouts.bootstrap_timeout();

        let negotiated =
            bootstrap::run(&mut connection, &args, deadline, self.shared.bus.as_ref()).await?;

        let (transport, read_buffer) = connection.into_parts();
        let (read_half, write_half) = tokio::io::split(transport);

        let (write_tx, write_rx) = mpsc::channel::<KvFrame>(self.max_in_flight.max(16));
        let read_task = tokio::spawn(read_loop(read_half, read_buffer, self.shared.clone()));
        let write_task = tokio::spawn(write_loop(write_half, write_rx, self.shared.clone()));

        *self.channel.lock().expect("channel lock poisoned") = Some(ActiveChannel {
            write_tx,
            ctx: Arc::new(negotiated.context),
            error_map: negotiated.error_map.map(Arc::new),
            read_task,
            write_task,
        });
        *self.last_activity.lock().expect("activity lock poisoned") = Instant::now();
        Ok(())
    }

    async fn open_transport(
        &self,
        tls: bool,
        timeout: std::time::Duration,
    ) -> Result<KvConnection> {
        if tls {
            #[cfg(feature = "tls")]
            {
                return crate::connection::connect_tls(&self.host, self.port, timeout).await;
            }
            #[cfg(not(feature = "tls"))]
            {
                return Err(CoreError::Config(
                    "TLS requested but the 'tls' feature is not enabled".to_string(),
                ));
            }
        }
        KvConnection::connect(&self.host, self.port, timeout).await
    }

    fn connection_closed(&self) -> CoreError {
        CoreError::ConnectionClosed {
            ctx: ErrorContext::default().with_node(self.shared.node.clone()),
        }
    }

    /// Sends a request and awaits its response under the given deadline.
    ///
    /// A process-unique opaque is assigned, the entry is registered in the
    /// in-flight map, and the frame handed to the write loop. Deadline
    /// expiry after the write surfaces `AmbiguousTimeout` and drops the
    /// opaque so a late reply is discarded.
    pub async fn dispatch(
        &self,
        request: &KvRequest,
        partition: u16,
        deadline: tokio::time::Instant,
    ) -> Result<KvResponse> {
        let (write_tx, ctx) = {
            let channel = self.channel.lock().expect("channel lock poisoned");
            match channel.as_ref() {
                Some(active) if self.can_dispatch() => {
                    (active.write_tx.clone(), active.ctx.clone())
                }
                _ => return Err(self.connection_closed()),
            }
        };

        let opaque = self.opaque.fetch_add(1, Ordering::Relaxed);
        let frame = request.encode(opaque, partition, &ctx, self.config.compression())?;

        let (tx, rx) = oneshot::channel();
        self.shared
            .in_flight
            .lock()
            .expect("in-flight lock poisoned")
            .insert(opaque, tx);
        *self.last_activity.lock().expect("activity lock poisoned") = Instant::now();

        if write_tx.send(frame).await.is_err() {
            self.shared
                .in_flight
                .lock()
                .expect("in-flight lock poisoned")
                .remove(&opaque);
            return Err(self.connection_closed());
        }

        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(response)) => {
                *self.last_activity.lock().expect("activity lock poisoned") = Instant::now();
                decode_response(&response, &ctx, partition)
            }
            Ok(Err(_closed)) => Err(self.connection_closed()),
            Err(_elapsed) => {
                self.shared
                    .in_flight
                    .lock()
                    .expect("in-flight lock poisoned")
                    .remove(&opaque);
                Err(CoreError::AmbiguousTimeout {
                    ctx: ErrorContext::default().with_node(self.shared.node.clone()),
                })
            }
        }
    }

    /// Closes the endpoint, failing anything still in flight.
    pub async fn close(&self) {
        if self.state() == EndpointState::Disconnected {
            return;
        }
        self.shared
            .state_tx
            .send_replace(EndpointState::Disconnecting);
        let channel = self.channel.lock().expect("channel lock poisoned").take();
        if let Some(active) = channel {
            active.read_task.abort();
            active.write_task.abort();
        }
        self.shared.fail_all_in_flight();
        self.shared.mark_disconnected();
        tracing::debug!(endpoint = %self.shared.id, "endpoint closed");
    }
}

async fn read_loop(
    mut read_half: tokio::io::ReadHalf<crate::connection::BoxedTransport>,
    mut buffer: BytesMut,
    shared: Arc<Shared>,
) {
    let mut codec = KvCodec::new();
    loop {
        loop {
            match codec.decode(&mut buffer) {
                Ok(Some(frame)) => shared.complete(frame),
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(endpoint = %shared.id, error = %e, "frame decode failed");
                    shared.fail_all_in_flight();
                    shared.mark_disconnected();
                    return;
                }
            }
        }

        match read_half.read_buf(&mut buffer).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(endpoint = %shared.id, error = %e, "read failed");
                break;
            }
        }
    }
    shared.fail_all_in_flight();
    shared.mark_disconnected();
}

async fn write_loop(
    mut write_half: tokio::io::WriteHalf<crate::connection::BoxedTransport>,
    mut write_rx: mpsc::Receiver<KvFrame>,
    shared: Arc<Shared>,
) {
    let mut codec = KvCodec::new();
    let mut buf = BytesMut::new();
    while let Some(frame) = write_rx.recv().await {
        buf.clear();
        if let Err(e) = codec.encode(frame, &mut buf) {
            tracing::error!(endpoint = %shared.id, error = %e, "frame encode failed");
            break;
        }
        if let Err(e) = write_half.write_all(&buf).await {
            tracing::debug!(endpoint = %shared.id, error = %e, "write failed");
            break;
        }
    }
    shared.fail_all_in_flight();
    shared.mark_disconnected();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::StaticCredentialsProvider;
    use crate::events::CollectingEventBus;

    fn test_endpoint() -> Endpoint {
        Endpoint::new(
            "127.0.0.1",
            11210,
            8,
            Arc::new(CoreConfig::default()),
            Arc::new(StaticCredentialsProvider::new("user", "pass")),
            Some("default".to_string()),
            Arc::new(CollectingEventBus::new()),
            Uuid::new_v4(),
        )
    }

    #[test]
    fn test_endpoint_id_uniqueness() {
        let a = EndpointId::new();
        let b = EndpointId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn test_initial_state_disconnected() {
        let endpoint = test_endpoint();
        assert_eq!(endpoint.state(), EndpointState::Disconnected);
        assert!(!endpoint.can_dispatch());
        assert_eq!(endpoint.in_flight(), 0);
        assert!(endpoint.has_capacity());
    }

    #[test]
    fn test_opaque_uniqueness_under_burst() {
        let endpoint = test_endpoint();
        let mut seen = std::collections::HashSet::with_capacity(100_000);
        for _ in 0..100_000 {
            let opaque = endpoint.opaque.fetch_add(1, Ordering::Relaxed);
            assert!(seen.insert(opaque), "duplicate opaque {}", opaque);
        }
    }

    #[tokio::test]
    async fn test_dispatch_without_connection_fails() {
        let endpoint = test_endpoint();
        let request = KvRequest::Get {
            key: reef_core::protocol::DocKey::new(b"k".to_vec()),
        };
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_millis(50);

        let result = endpoint.dispatch(&request, 0, deadline).await;
        assert!(matches!(result, Err(CoreError::ConnectionClosed { .. })));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let endpoint = test_endpoint();
        endpoint.close().await;
        endpoint.close().await;
        assert_eq!(endpoint.state(), EndpointState::Disconnected);
    }

    #[test]
    fn test_endpoint_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Endpoint>();
    }
}
