//! Core events and the injected event bus.
//!
//! The core publishes structured events to an externally provided bus. The
//! bus must never block the publisher; the provided production
//! implementation is queue-backed, the test implementation collects into a
//! list.

use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::broadcast;
use uuid::Uuid;

use reef_core::protocol::{ServerFeature, Status};
use reef_core::service::ServiceType;

/// Context attached to every event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventContext {
    /// Local socket address of the connection, when applicable.
    pub local: Option<SocketAddr>,
    /// Remote socket address of the connection, when applicable.
    pub remote: Option<SocketAddr>,
    /// Id of the owning core instance.
    pub core_id: Option<Uuid>,
    /// Time spent in the phase that produced the event.
    pub elapsed: Duration,
}

impl EventContext {
    /// Creates a context for a connection pair.
    pub fn for_connection(
        core_id: Uuid,
        local: Option<SocketAddr>,
        remote: Option<SocketAddr>,
    ) -> Self {
        Self {
            local,
            remote,
            core_id: Some(core_id),
            elapsed: Duration::ZERO,
        }
    }

    /// Sets the elapsed time.
    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed = elapsed;
        self
    }
}

/// Events emitted by the core.
#[derive(Debug, Clone)]
pub enum CoreEvent {
    /// Feature negotiation finished; carries the accepted features.
    FeatureNegotiationCompleted {
        /// Event context.
        ctx: EventContext,
        /// Features the server accepted.
        negotiated: Vec<ServerFeature>,
    },
    /// The server error map was loaded.
    ErrorMapLoaded {
        /// Event context.
        ctx: EventContext,
        /// Version of the loaded map.
        version: u16,
        /// Number of entries in the map.
        entries: usize,
    },
    /// The error map request returned a non-success status.
    ErrorMapLoadingFailure {
        /// Event context.
        ctx: EventContext,
        /// Status the server returned.
        status: Status,
    },
    /// The error map body could not be decoded.
    ErrorMapUndecodable {
        /// Event context.
        ctx: EventContext,
        /// Decoder error message.
        message: String,
    },
    /// SASL authentication completed.
    SaslAuthCompleted {
        /// Event context.
        ctx: EventContext,
    },
    /// SASL authentication failed.
    SaslAuthFailed {
        /// Event context.
        ctx: EventContext,
        /// Failure detail.
        message: String,
    },
    /// The bucket was selected on the channel.
    BucketSelected {
        /// Event context.
        ctx: EventContext,
        /// Selected bucket name.
        bucket: String,
    },
    /// Bucket selection failed.
    BucketSelectionFailed {
        /// Event context.
        ctx: EventContext,
        /// Bucket that could not be selected.
        bucket: String,
        /// Status the server returned.
        status: Status,
    },
    /// An endpoint finished bootstrap and accepts dispatch.
    EndpointConnected {
        /// Event context.
        ctx: EventContext,
    },
    /// An endpoint transitioned to disconnected.
    EndpointDisconnected {
        /// Event context.
        ctx: EventContext,
    },
    /// A newer topology revision was installed.
    ConfigUpdated {
        /// Event context.
        ctx: EventContext,
        /// Revision epoch of the new config.
        rev_epoch: u64,
        /// Revision id of the new config.
        rev_id: u64,
    },
    /// An incoming config document could not be parsed.
    ConfigParsingFailure {
        /// Event context.
        ctx: EventContext,
        /// Parser error message.
        message: String,
    },
    /// A request was scheduled for another attempt.
    RequestRetried {
        /// Event context.
        ctx: EventContext,
        /// Correlation id of the retried request.
        correlation_id: Uuid,
        /// Service the request targets.
        service: ServiceType,
        /// Why the request is being retried.
        reason: String,
    },
    /// A request deadline expired.
    RequestTimeout {
        /// Event context.
        ctx: EventContext,
        /// Correlation id of the timed-out request.
        correlation_id: Uuid,
        /// Service the request targeted.
        service: ServiceType,
    },
    /// A response arrived for an opaque with no in-flight request.
    UnknownResponseReceived {
        /// Event context.
        ctx: EventContext,
        /// The orphaned opaque.
        opaque: u32,
    },
}

/// An injected, process-wide event sink.
///
/// Publication must be non-blocking; implementations drop events rather
/// than stall the I/O path.
pub trait EventBus: Send + Sync + std::fmt::Debug {
    /// Publishes an event.
    fn publish(&self, event: CoreEvent);
}

/// Queue-backed bus fanning events out to broadcast subscribers.
///
/// Events published while no subscriber exists are dropped.
#[derive(Debug)]
pub struct BroadcastEventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl BroadcastEventBus {
    /// Creates a bus with the given queue capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribes to published events.
    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus for BroadcastEventBus {
    fn publish(&self, event: CoreEvent) {
        let _ = self.sender.send(event);
    }
}

/// Test bus collecting every published event into a list.
#[derive(Debug, Default)]
pub struct CollectingEventBus {
    events: Mutex<Vec<CoreEvent>>,
}

impl CollectingEventBus {
    /// Creates an empty collecting bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of the collected events.
    pub fn events(&self) -> Vec<CoreEvent> {
        self.events.lock().expect("event list poisoned").clone()
    }

    /// Removes and returns all collected events.
    pub fn drain(&self) -> Vec<CoreEvent> {
        std::mem::take(&mut *self.events.lock().expect("event list poisoned"))
    }
}

impl EventBus for CollectingEventBus {
    fn publish(&self, event: CoreEvent) {
        self.events.lock().expect("event list poisoned").push(event);
    }
}
