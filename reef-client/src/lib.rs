//! Core I/O runtime for the Reef document database client.
//!
//! This crate turns logical requests — "upsert this key", "fetch the
//! current cluster topology" — into framed traffic against a dynamically
//! changing set of service endpoints, and framed server responses back into
//! typed results. It is built on [Tokio](https://tokio.rs/) and sits below
//! the fluent public client surface.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use reef_client::{BroadcastEventBus, Core, CoreConfig, StaticCredentialsProvider};
//! use reef_core::protocol::{DocKey, KvRequest};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let core = Core::connect(
//!         "couchbase://127.0.0.1/travel-sample",
//!         Arc::new(StaticCredentialsProvider::new("user", "pass")),
//!         CoreConfig::default(),
//!         Arc::new(BroadcastEventBus::default()),
//!     )
//!     .await?;
//!
//!     let response = core
//!         .dispatch(KvRequest::Upsert {
//!             key: DocKey::new(b"airline_10".to_vec()),
//!             value: br#"{"name":"40-Mile Air"}"#.to_vec(),
//!             flags: 0x0200_0006,
//!             expiry: 0,
//!             datatype: 0x01,
//!         })
//!         .await?;
//!     println!("stored with cas {}", response.cas);
//!
//!     core.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! | Layer | Module | Responsibility |
//! |-------|--------|----------------|
//! | Dispatcher | [`dispatcher`] | Routing, retry, timeout, shutdown drain |
//! | Pools | [`pool`] | Endpoint sets per (node, service) |
//! | Endpoint | [`endpoint`] | One connection, opaque demux, lifecycle |
//! | Bootstrap | [`bootstrap`] | HELLO, error map, SASL, select-bucket |
//! | Topology | [`topology`] | Config parsing and revision ordering |
//! | Locator | [`locator`] | VBucket and round-robin placement |

#![warn(missing_docs)]

pub mod auth;
pub mod bootstrap;
pub mod config;
pub mod connection;
pub mod connstr;
pub mod credentials;
pub mod dispatcher;
pub mod endpoint;
pub mod events;
pub mod http;
pub mod locator;
pub mod pool;
pub mod retry;
pub mod runtime;
pub mod topology;

pub use config::{CoreConfig, CoreConfigBuilder, PoolConfig, SelectionStrategy};
pub use connstr::ConnectionString;
pub use credentials::{Credentials, CredentialsProvider, StaticCredentialsProvider};
pub use dispatcher::{Core, KvOperation};
pub use endpoint::{Endpoint, EndpointState};
pub use events::{BroadcastEventBus, CollectingEventBus, CoreEvent, EventBus, EventContext};
pub use http::{HttpResponse, HttpService};
pub use pool::ServicePool;
pub use retry::{BestEffortRetryStrategy, FailFastRetryStrategy, RetryStrategy};
pub use topology::{BucketConfig, ConfigProvider, ConfigRevision, NodeInfo};

pub use reef_core::{CoreError, ErrorContext, Result};
