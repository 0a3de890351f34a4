//! Per-connection bootstrap pipeline.
//!
//! A freshly connected channel walks a fixed sequence before it may carry
//! user traffic: feature negotiation, best-effort error map loading, SASL
//! authentication, and bucket selection. Every stage races one shared
//! bootstrap deadline; expiry fails the bootstrap and the transport is
//! closed by the caller.

use std::time::Instant;

use tokio::time::timeout_at;
use uuid::Uuid;

use reef_core::errmap::ErrorMap;
use reef_core::error::{CoreError, ErrorContext, Result};
use reef_core::protocol::{
    ChannelContext, CompressionConfig, KvFrame, KvRequest, ServerFeature, Status,
};

use crate::auth::{plain_payload, SaslMechanism, ScramClient};
use crate::connection::KvConnection;
use crate::credentials::Credentials;
use crate::events::{CoreEvent, EventBus, EventContext};

/// Inputs to the bootstrap pipeline.
#[derive(Debug)]
pub struct BootstrapArgs {
    /// Client name announced in HELLO.
    pub client_name: String,
    /// Features to propose.
    pub features: Vec<ServerFeature>,
    /// Credentials for SASL.
    pub credentials: Credentials,
    /// Bucket to select, for data-service channels bound to one.
    pub bucket: Option<String>,
    /// True if the transport is secured with TLS.
    pub tls: bool,
    /// Id of the owning core, for events.
    pub core_id: Uuid,
}

/// The negotiated result of a successful bootstrap.
#[derive(Debug)]
pub struct NegotiatedChannel {
    /// Accepted features and selected bucket.
    pub context: ChannelContext,
    /// The server error map, when one was loaded.
    pub error_map: Option<ErrorMap>,
}

struct Exchange<'a> {
    connection: &'a mut KvConnection,
    deadline: tokio::time::Instant,
    opaque: u32,
    node: String,
}

impl<'a> Exchange<'a> {
    /// Performs one request/response roundtrip under the shared deadline.
    async fn roundtrip(&mut self, request: KvRequest) -> Result<KvFrame> {
        self.opaque = self.opaque.wrapping_add(1);
        let opaque = self.opaque;
        // Bootstrap runs before negotiation, so encode against a bare
        // channel context with compression off.
        let frame = request.encode(
            opaque,
            0,
            &ChannelContext::default(),
            &CompressionConfig::disabled(),
        )?;

        let deadline = self.deadline;
        let node = self.node.clone();
        let timeout_node = self.node.clone();
        let connection = &mut *self.connection;

        let io = async move {
            connection.send(frame).await?;
            loop {
                match connection.receive().await? {
                    Some(response) if response.opaque == opaque => return Ok(response),
                    Some(other) => {
                        tracing::trace!(
                            opaque = other.opaque,
                            "ignoring frame with foreign opaque during bootstrap"
                        );
                    }
                    None => {
                        return Err(CoreError::ConnectionClosed {
                            ctx: ErrorContext::default().with_node(node.clone()),
                        })
                    }
                }
            }
        };

        timeout_at(deadline, io).await.map_err(|_| {
            CoreError::UnambiguousTimeout {
                ctx: ErrorContext::default().with_node(timeout_node),
            }
        })?
    }
}

/// Runs the bootstrap pipeline on a freshly connected channel.
///
/// On success the channel is ready for dispatch; on error the caller closes
/// the transport.
pub async fn run(
    connection: &mut KvConnection,
    args: &BootstrapArgs,
    deadline: tokio::time::Instant,
    bus: &dyn EventBus,
) -> Result<NegotiatedChannel> {
    let event_ctx = EventContext::for_connection(
        args.core_id,
        connection.local_addr(),
        connection.peer_addr(),
    );
    let node = connection
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let mut exchange = Exchange {
        connection,
        deadline,
        opaque: 0,
        node,
    };

    let negotiated = negotiate_features(&mut exchange, args, bus, &event_ctx).await?;
    let error_map = load_error_map(&mut exchange, bus, &event_ctx).await?;
    authenticate(&mut exchange, args, bus, &event_ctx).await?;
    let bucket = select_bucket(&mut exchange, args, bus, &event_ctx).await?;

    Ok(NegotiatedChannel {
        context: ChannelContext::new(negotiated, bucket),
        error_map,
    })
}

/// Stage 2: HELLO. Failure is non-fatal; the server's silent defaults apply.
async fn negotiate_features(
    exchange: &mut Exchange<'_>,
    args: &BootstrapArgs,
    bus: &dyn EventBus,
    event_ctx: &EventContext,
) -> Result<Vec<ServerFeature>> {
    let started = Instant::now();
    let response = exchange
        .roundtrip(KvRequest::Hello {
            client_name: args.client_name.clone(),
            features: args.features.clone(),
        })
        .await?;

    let mut negotiated = Vec::new();
    if response.is_success() {
        for chunk in response.body.chunks_exact(2) {
            let code = u16::from_be_bytes([chunk[0], chunk[1]]);
            if let Some(feature) = ServerFeature::from_code(code) {
                negotiated.push(feature);
            }
        }
    } else {
        tracing::debug!(
            status = %Status::from_raw(response.status()),
            "server declined feature negotiation"
        );
    }

    bus.publish(CoreEvent::FeatureNegotiationCompleted {
        ctx: event_ctx.clone().with_elapsed(started.elapsed()),
        negotiated: negotiated.clone(),
    });
    Ok(negotiated)
}

/// Stage 3: error map, best effort.
async fn load_error_map(
    exchange: &mut Exchange<'_>,
    bus: &dyn EventBus,
    event_ctx: &EventContext,
) -> Result<Option<ErrorMap>> {
    let started = Instant::now();
    let response = exchange.roundtrip(reef_core::protocol::request::error_map_request()).await?;
    let elapsed = started.elapsed();

    if !response.is_success() {
        bus.publish(CoreEvent::ErrorMapLoadingFailure {
            ctx: event_ctx.clone().with_elapsed(elapsed),
            status: Status::from_raw(response.status()),
        });
        return Ok(None);
    }

    match ErrorMap::from_json(&response.body) {
        Ok(map) => {
            bus.publish(CoreEvent::ErrorMapLoaded {
                ctx: event_ctx.clone().with_elapsed(elapsed),
                version: map.version,
                entries: map.len(),
            });
            Ok(Some(map))
        }
        Err(e) => {
            bus.publish(CoreEvent::ErrorMapUndecodable {
                ctx: event_ctx.clone().with_elapsed(elapsed),
                message: e.to_string(),
            });
            Ok(None)
        }
    }
}

/// Stage 4: SASL. Any failure fails the bootstrap permanently.
async fn authenticate(
    exchange: &mut Exchange<'_>,
    args: &BootstrapArgs,
    bus: &dyn EventBus,
    event_ctx: &EventContext,
) -> Result<()> {
    let started = Instant::now();

    let result = run_sasl(exchange, args).await;
    match &result {
        Ok(()) => bus.publish(CoreEvent::SaslAuthCompleted {
            ctx: event_ctx.clone().with_elapsed(started.elapsed()),
        }),
        Err(e) => bus.publish(CoreEvent::SaslAuthFailed {
            ctx: event_ctx.clone().with_elapsed(started.elapsed()),
            message: e.to_string(),
        }),
    }
    result
}

async fn run_sasl(exchange: &mut Exchange<'_>, args: &BootstrapArgs) -> Result<()> {
    let auth_error = |message: String, node: &str| CoreError::AuthenticationFailure {
        message,
        ctx: ErrorContext::default().with_node(node),
    };

    let list = exchange.roundtrip(KvRequest::SaslListMechs).await?;
    if !list.is_success() {
        return Err(auth_error(
            format!(
                "listing SASL mechanisms failed with {}",
                Status::from_raw(list.status())
            ),
            &exchange.node,
        ));
    }
    let offered = String::from_utf8_lossy(&list.body).to_string();

    let mechanism = SaslMechanism::select(&offered, args.tls).ok_or_else(|| {
        auth_error(
            format!("no usable SASL mechanism among '{}'", offered),
            &exchange.node,
        )
    })?;
    tracing::debug!(mechanism = mechanism.name(), "selected SASL mechanism");

    match mechanism.scram_hash() {
        None => {
            let response = exchange
                .roundtrip(KvRequest::SaslAuth {
                    mechanism: mechanism.name().to_string(),
                    payload: plain_payload(
                        args.credentials.username(),
                        args.credentials.password(),
                    ),
                })
                .await?;
            if !response.is_success() {
                return Err(auth_error(
                    "the server rejected the credentials".to_string(),
                    &exchange.node,
                ));
            }
            Ok(())
        }
        Some(hash) => {
            let mut client = ScramClient::new(
                hash,
                args.credentials.username(),
                args.credentials.password(),
            );

            let first = exchange
                .roundtrip(KvRequest::SaslAuth {
                    mechanism: mechanism.name().to_string(),
                    payload: client.client_first()?,
                })
                .await?;

            match Status::from_raw(first.status()) {
                Status::AuthContinue => {
                    let final_payload = client.handle_server_first(&first.body)?;
                    let last = exchange
                        .roundtrip(KvRequest::SaslStep {
                            mechanism: mechanism.name().to_string(),
                            payload: final_payload,
                        })
                        .await?;
                    if !last.is_success() {
                        return Err(auth_error(
                            "the server rejected the credentials".to_string(),
                            &exchange.node,
                        ));
                    }
                    client.verify_server_final(&last.body)
                }
                Status::Success => {
                    // Unusual: the server short-circuited the exchange. The
                    // server signature cannot be verified in this shape.
                    tracing::warn!("server completed SCRAM in a single step");
                    Ok(())
                }
                _ => Err(auth_error(
                    "the server rejected the credentials".to_string(),
                    &exchange.node,
                )),
            }
        }
    }
}

/// Stage 5: bucket selection, only for channels bound to a bucket.
async fn select_bucket(
    exchange: &mut Exchange<'_>,
    args: &BootstrapArgs,
    bus: &dyn EventBus,
    event_ctx: &EventContext,
) -> Result<Option<String>> {
    let Some(bucket) = &args.bucket else {
        return Ok(None);
    };

    let started = Instant::now();
    let response = exchange
        .roundtrip(KvRequest::SelectBucket {
            name: bucket.clone(),
        })
        .await?;
    let elapsed = started.elapsed();

    if response.is_success() {
        bus.publish(CoreEvent::BucketSelected {
            ctx: event_ctx.clone().with_elapsed(elapsed),
            bucket: bucket.clone(),
        });
        return Ok(Some(bucket.clone()));
    }

    let status = Status::from_raw(response.status());
    bus.publish(CoreEvent::BucketSelectionFailed {
        ctx: event_ctx.clone().with_elapsed(elapsed),
        bucket: bucket.clone(),
        status,
    });
    Err(CoreError::BucketNotFound {
        name: bucket.clone(),
        ctx: ErrorContext::default()
            .with_node(exchange.node.clone())
            .with_status(status),
    })
}
