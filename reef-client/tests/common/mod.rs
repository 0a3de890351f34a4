//! Scripted mock KV server for integration tests.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::{BufMut, Bytes, BytesMut};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Decoder, Encoder};

use reef_core::protocol::constants::opcode;
use reef_core::protocol::{KvCodec, KvFrame};

const SCRAM_SALT: &[u8] = b"test-salt-0123";
const SCRAM_ITERATIONS: u32 = 64;

/// How the mock answers the error map request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorMapMode {
    /// Reply with a small valid map.
    Reply,
    /// Reply with a non-success status.
    Fail,
    /// Never reply; used to drive bootstrap timeouts.
    Silent,
}

/// A scripted reply for one data operation.
#[derive(Debug, Clone)]
pub enum KvReply {
    /// Success with the given cas and optional mutation token.
    Success {
        /// CAS returned to the client.
        cas: u64,
        /// Mutation token `(partition-uuid, seqno)` placed in the extras.
        token: Option<(u64, u64)>,
    },
    /// A bare status reply.
    Status(u16),
    /// `NOT_MY_VBUCKET` with a piggybacked config at the given revision.
    NotMyVbucketWithConfig(u64),
    /// Sleep before replying with the inner reply.
    Delay(Duration, Box<KvReply>),
}

/// Shared state of the mock cluster.
pub struct MockState {
    pub bucket: String,
    pub username: String,
    pub password: String,
    pub errmap_mode: ErrorMapMode,
    pub select_bucket_status: u16,
    pub config_rev: AtomicU64,
    pub upsert_script: Mutex<VecDeque<KvReply>>,
    /// Filled in by [`MockCluster::start`] once the listener is bound.
    pub port: AtomicU64,
}

impl MockState {
    fn config_json(&self, rev: u64) -> String {
        let port = self.port.load(Ordering::Acquire);
        format!(
            r#"{{
                "rev": {rev},
                "revEpoch": 1,
                "name": "{bucket}",
                "uuid": "mock-bucket-uuid",
                "nodeLocator": "vbucket",
                "bucketCapabilities": ["couchapi", "dcp", "xattr"],
                "nodes": [{{"hostname": "127.0.0.1:8091", "ports": {{"direct": {port}}}}}],
                "nodesExt": [{{"hostname": "127.0.0.1", "services": {{"kv": {port}, "mgmt": 8091}}}}],
                "vBucketServerMap": {{
                    "hashAlgorithm": "CRC",
                    "numReplicas": 0,
                    "serverList": ["127.0.0.1:{port}"],
                    "vBucketMap": [[0], [0], [0], [0], [0], [0], [0], [0]]
                }}
            }}"#,
            rev = rev,
            bucket = self.bucket,
        )
    }
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            bucket: "default".to_string(),
            username: "user".to_string(),
            password: "pass".to_string(),
            errmap_mode: ErrorMapMode::Reply,
            select_bucket_status: 0x00,
            config_rev: AtomicU64::new(1),
            upsert_script: Mutex::new(VecDeque::new()),
            port: AtomicU64::new(0),
        }
    }
}

/// A mock cluster node listening on a loopback port.
pub struct MockCluster {
    /// Address the mock listens on.
    pub addr: SocketAddr,
    /// Shared scripted state.
    pub state: Arc<MockState>,
}

impl MockCluster {
    /// Starts a mock with the given state.
    pub async fn start(state: MockState) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        state.port.store(u64::from(addr.port()), Ordering::Release);
        let state = Arc::new(state);

        let accept_state = state.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((socket, _)) => {
                        let conn_state = accept_state.clone();
                        tokio::spawn(async move {
                            let _ = handle_connection(socket, conn_state).await;
                        });
                    }
                    Err(_) => break,
                }
            }
        });

        Self { addr, state }
    }

    /// Starts a mock with default state.
    pub async fn start_default() -> Self {
        Self::start(MockState::default()).await
    }

    /// Returns a connection string pointing at this mock.
    pub fn connection_string(&self) -> String {
        format!(
            "couchbase://127.0.0.1:{}/{}",
            self.addr.port(),
            self.state.bucket
        )
    }

    /// Queues scripted replies for upcoming upserts.
    pub fn script_upserts(&self, replies: impl IntoIterator<Item = KvReply>) {
        self.state
            .upsert_script
            .lock()
            .unwrap()
            .extend(replies);
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).unwrap();
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn hi_sha256(password: &[u8], salt: &[u8], iterations: u32) -> Vec<u8> {
    let mut salted = salt.to_vec();
    salted.extend_from_slice(&1u32.to_be_bytes());
    let mut current = hmac_sha256(password, &salted);
    let mut result = current.clone();
    for _ in 1..iterations {
        current = hmac_sha256(password, &current);
        for (acc, byte) in result.iter_mut().zip(&current) {
            *acc ^= byte;
        }
    }
    result
}

fn attr<'a>(payload: &'a str, key: char) -> Option<&'a str> {
    payload
        .split(',')
        .find(|part| part.starts_with(key) && part[1..].starts_with('='))
        .map(|part| &part[2..])
}

struct ScramServerSession {
    client_first_bare: String,
    server_first: String,
    combined_nonce: String,
}

fn success(frame: &KvFrame, extras: Bytes, body: Bytes) -> KvFrame {
    KvFrame::response(frame.opcode, 0, 0x00, frame.opaque, 0, extras, Bytes::new(), body)
}

fn status_reply(frame: &KvFrame, status: u16) -> KvFrame {
    KvFrame::response(
        frame.opcode,
        0,
        status,
        frame.opaque,
        0,
        Bytes::new(),
        Bytes::new(),
        Bytes::new(),
    )
}

async fn handle_connection(mut socket: TcpStream, state: Arc<MockState>) -> std::io::Result<()> {
    let mut codec = KvCodec::new();
    let mut buffer = BytesMut::with_capacity(8192);
    let mut scram: Option<ScramServerSession> = None;

    loop {
        let frame = loop {
            match codec.decode(&mut buffer) {
                Ok(Some(frame)) => break frame,
                Ok(None) => {}
                Err(_) => return Ok(()),
            }
            if socket.read_buf(&mut buffer).await? == 0 {
                return Ok(());
            }
        };

        let reply = match frame.opcode {
            opcode::HELLO => {
                // Accept everything proposed except collections, so test
                // keys stay unprefixed on the wire.
                let mut accepted = BytesMut::new();
                for chunk in frame.body.chunks_exact(2) {
                    let code = u16::from_be_bytes([chunk[0], chunk[1]]);
                    if code != 0x12 {
                        accepted.put_u16(code);
                    }
                }
                Some(success(&frame, Bytes::new(), accepted.freeze()))
            }
            opcode::ERROR_MAP => match state.errmap_mode {
                ErrorMapMode::Reply => {
                    let map = r#"{"version":1,"revision":1,"errors":{"86":{"name":"ETMPFAIL","desc":"Temporary failure","attrs":["temp","retry-later"]}}}"#;
                    Some(success(&frame, Bytes::new(), Bytes::from_static(map.as_bytes())))
                }
                ErrorMapMode::Fail => Some(status_reply(&frame, 0x81)),
                ErrorMapMode::Silent => None,
            },
            opcode::SASL_LIST_MECHS => Some(success(
                &frame,
                Bytes::new(),
                Bytes::from_static(b"SCRAM-SHA256 SCRAM-SHA1"),
            )),
            opcode::SASL_AUTH => {
                let client_first = String::from_utf8_lossy(&frame.body).to_string();
                let bare = client_first
                    .strip_prefix("n,,")
                    .unwrap_or(&client_first)
                    .to_string();
                let client_nonce = attr(&bare, 'r').unwrap_or("").to_string();
                let combined = format!("{}mock-server-nonce", client_nonce);
                let server_first = format!(
                    "r={},s={},i={}",
                    combined,
                    BASE64.encode(SCRAM_SALT),
                    SCRAM_ITERATIONS
                );
                scram = Some(ScramServerSession {
                    client_first_bare: bare,
                    server_first: server_first.clone(),
                    combined_nonce: combined,
                });
                Some(KvFrame::response(
                    frame.opcode,
                    0,
                    0x21, // AUTH_CONTINUE
                    frame.opaque,
                    0,
                    Bytes::new(),
                    Bytes::new(),
                    Bytes::from(server_first.into_bytes()),
                ))
            }
            opcode::SASL_STEP => {
                let session = match scram.take() {
                    Some(session) => session,
                    None => {
                        let _ = send(&mut socket, status_reply(&frame, 0x20)).await;
                        continue;
                    }
                };
                let client_final = String::from_utf8_lossy(&frame.body).to_string();
                let proof = attr(&client_final, 'p').unwrap_or("").to_string();
                let without_proof = client_final
                    .rsplit_once(",p=")
                    .map(|(head, _)| head.to_string())
                    .unwrap_or_default();
                let auth_message = format!(
                    "{},{},{}",
                    session.client_first_bare, session.server_first, without_proof
                );

                let salted = hi_sha256(
                    state.password.as_bytes(),
                    SCRAM_SALT,
                    SCRAM_ITERATIONS,
                );
                let client_key = hmac_sha256(&salted, b"Client Key");
                let stored_key = Sha256::digest(&client_key).to_vec();
                let signature = hmac_sha256(&stored_key, auth_message.as_bytes());
                let expected: Vec<u8> = client_key
                    .iter()
                    .zip(&signature)
                    .map(|(a, b)| a ^ b)
                    .collect();

                let nonce_ok = attr(&client_final, 'r') == Some(session.combined_nonce.as_str());
                if nonce_ok && BASE64.encode(&expected) == proof {
                    let server_key = hmac_sha256(&salted, b"Server Key");
                    let server_sig = hmac_sha256(&server_key, auth_message.as_bytes());
                    let body = format!("v={}", BASE64.encode(server_sig));
                    Some(success(&frame, Bytes::new(), Bytes::from(body.into_bytes())))
                } else {
                    Some(status_reply(&frame, 0x20))
                }
            }
            opcode::SELECT_BUCKET => {
                let requested = String::from_utf8_lossy(&frame.key);
                if state.select_bucket_status != 0 {
                    Some(status_reply(&frame, state.select_bucket_status))
                } else if requested == state.bucket {
                    Some(success(&frame, Bytes::new(), Bytes::new()))
                } else {
                    Some(status_reply(&frame, 0x01))
                }
            }
            opcode::GET_CONFIG => {
                let rev = state.config_rev.load(Ordering::Acquire);
                Some(success(
                    &frame,
                    Bytes::new(),
                    Bytes::from(state.config_json(rev).into_bytes()),
                ))
            }
            opcode::SET => {
                let scripted = state.upsert_script.lock().unwrap().pop_front();
                let reply = scripted.unwrap_or(KvReply::Success {
                    cas: 42,
                    token: Some((7, 11)),
                });
                Some(render_kv_reply(&frame, reply, &state).await)
            }
            opcode::SUBDOC_MULTI_MUTATE => {
                // One record per sent command; the second path is missing.
                let commands =
                    reef_core::protocol::subdoc::decode_mutation_commands(frame.body.clone())
                        .unwrap_or_default();
                let mut body = BytesMut::new();
                let mut any_failed = false;
                for command in &commands {
                    if command.path.contains('/') && command.path.matches('/').count() > 1 {
                        body.put_u16(0xc0); // PATH_NOT_FOUND for nested paths
                        any_failed = true;
                    } else {
                        body.put_u16(0x00);
                    }
                    body.put_u32(0);
                }
                let status = if any_failed { 0xcc } else { 0x00 };
                Some(KvFrame::response(
                    frame.opcode,
                    0,
                    status,
                    frame.opaque,
                    43,
                    Bytes::new(),
                    Bytes::new(),
                    body.freeze(),
                ))
            }
            opcode::GET => {
                if frame.key.as_ref() == b"present" {
                    let mut extras = BytesMut::new();
                    extras.put_u32(0x0200_0006);
                    Some(KvFrame::response(
                        frame.opcode,
                        0x01,
                        0x00,
                        frame.opaque,
                        99,
                        extras.freeze(),
                        Bytes::new(),
                        Bytes::from_static(b"{\"a\":1}"),
                    ))
                } else {
                    Some(status_reply(&frame, 0x01))
                }
            }
            _ => Some(status_reply(&frame, 0x81)),
        };

        if let Some(reply) = reply {
            send(&mut socket, reply).await?;
        }
    }
}

async fn render_kv_reply(frame: &KvFrame, reply: KvReply, state: &Arc<MockState>) -> KvFrame {
    let mut reply = reply;
    // Unwrap nested delays iteratively.
    let reply = loop {
        match reply {
            KvReply::Delay(delay, inner) => {
                tokio::time::sleep(delay).await;
                reply = *inner;
            }
            other => break other,
        }
    };
    match reply {
        KvReply::Success { cas, token } => {
            let extras = match token {
                Some((uuid, seqno)) => {
                    let mut extras = BytesMut::with_capacity(16);
                    extras.put_u64(uuid);
                    extras.put_u64(seqno);
                    extras.freeze()
                }
                None => Bytes::new(),
            };
            KvFrame::response(
                frame.opcode,
                0,
                0x00,
                frame.opaque,
                cas,
                extras,
                Bytes::new(),
                Bytes::new(),
            )
        }
        KvReply::Status(status) => status_reply(frame, status),
        KvReply::NotMyVbucketWithConfig(rev) => {
            state.config_rev.store(rev, Ordering::Release);
            KvFrame::response(
                frame.opcode,
                0,
                0x07,
                frame.opaque,
                0,
                Bytes::new(),
                Bytes::new(),
                Bytes::from(state.config_json(rev).into_bytes()),
            )
        }
        KvReply::Delay(..) => unreachable!("delays are unwrapped above"),
    }
}

async fn send(socket: &mut TcpStream, frame: KvFrame) -> std::io::Result<()> {
    let mut codec = KvCodec::new();
    let mut buf = BytesMut::with_capacity(frame.wire_size());
    codec
        .encode(frame, &mut buf)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
    socket.write_all(&buf).await
}
