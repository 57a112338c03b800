//! TCP transport using the legacy multiplexed-connection packet framing.
//!
//! Connection set-up:
//!
//! 1. Both sides send `Hello { public_key, nonce }`.
//! 2. Both sides send `Proof { signature }` over the other side's nonce.
//! 3. Each side verifies the proof against the key from step 1.
//!
//! After that every logical message is split into `Packet`s of at most
//! `max_packet_payload` bytes. The last packet of a message has `eof` set;
//! the reader reassembles per stream. The framing is only interpreted to
//! keep message boundaries intact.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use braid_core::{Ed25519PublicKey, Ed25519Signature, Endpoint, Keypair, Protocol};

use super::{Connection, MuxedConnection, Transport};
use crate::codec::CborCodec;
use crate::error::{P2pError, Result};
use crate::mux::{Frame, Multiplexer, StreamId};

const PROOF_DOMAIN: &[u8] = b"braid-mconn-handshake-v0:";
const NONCE_LEN: usize = 32;
/// Authenticated inbound connections waiting for `accept`.
const ACCEPT_BACKLOG: usize = 32;
/// Room for the CBOR envelope around a packet's payload.
const FRAME_OVERHEAD: usize = 1024;

/// Settings for [`MConnTransport`].
#[derive(Debug, Clone)]
pub struct MConnConfig {
    /// Maximum payload bytes per packet.
    pub max_packet_payload: usize,
    /// Maximum size of a reassembled message.
    pub max_message_size: usize,
    /// Deadline for the authentication exchange.
    pub handshake_timeout: Duration,
    /// Frames buffered per direction and per stream.
    pub frame_buffer: usize,
}

impl Default for MConnConfig {
    fn default() -> Self {
        Self {
            max_packet_payload: 1400,
            max_message_size: 32 * 1024 * 1024,
            handshake_timeout: Duration::from_secs(20),
            frame_buffer: 64,
        }
    }
}

/// One piece of a logical message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    pub stream: StreamId,
    pub eof: bool,
    pub data: Bytes,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum WireMessage {
    Hello {
        public_key: Ed25519PublicKey,
        nonce: Bytes,
    },
    Proof {
        signature: Ed25519Signature,
    },
    Packet(Packet),
}

type WireFramed = Framed<TcpStream, CborCodec<WireMessage>>;

/// Split a message into packets.
pub fn packetize(frame: Frame, max_payload: usize) -> Vec<Packet> {
    let Frame { stream, payload } = frame;
    if payload.is_empty() {
        return vec![Packet {
            stream,
            eof: true,
            data: payload,
        }];
    }

    let max_payload = max_payload.max(1);
    let mut packets = Vec::with_capacity(payload.len().div_ceil(max_payload));
    let mut offset = 0;
    while offset < payload.len() {
        let end = (offset + max_payload).min(payload.len());
        packets.push(Packet {
            stream,
            eof: end == payload.len(),
            data: payload.slice(offset..end),
        });
        offset = end;
    }
    packets
}

/// Per-stream packet reassembly.
#[derive(Debug)]
pub struct Reassembler {
    partial: HashMap<StreamId, BytesMut>,
    max_message_size: usize,
}

impl Reassembler {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            partial: HashMap::new(),
            max_message_size,
        }
    }

    /// Add a packet; returns the completed message when `eof` is set.
    pub fn push(&mut self, packet: Packet) -> Result<Option<Frame>> {
        let buf = self.partial.entry(packet.stream).or_default();
        let size = buf.len() + packet.data.len();
        if size > self.max_message_size {
            self.partial.remove(&packet.stream);
            return Err(P2pError::MessageTooLarge {
                size,
                max: self.max_message_size,
            });
        }
        buf.extend_from_slice(&packet.data);

        if !packet.eof {
            return Ok(None);
        }
        let payload = self
            .partial
            .remove(&packet.stream)
            .map(BytesMut::freeze)
            .unwrap_or_default();
        Ok(Some(Frame {
            stream: packet.stream,
            payload,
        }))
    }
}

fn proof_message(nonce: &[u8]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(PROOF_DOMAIN.len() + nonce.len());
    msg.extend_from_slice(PROOF_DOMAIN);
    msg.extend_from_slice(nonce);
    msg
}

async fn next_message(framed: &mut WireFramed) -> Result<WireMessage> {
    match framed.next().await {
        Some(msg) => msg,
        None => Err(P2pError::Handshake("connection closed during handshake".into())),
    }
}

/// Authenticate the remote end. Returns the framed socket and the proven key.
async fn handshake(
    socket: TcpStream,
    keypair: &Keypair,
    config: &MConnConfig,
) -> Result<(WireFramed, Ed25519PublicKey)> {
    socket.set_nodelay(true)?;
    let codec = CborCodec::with_max_frame_length(config.max_packet_payload + FRAME_OVERHEAD);
    let mut framed = Framed::new(socket, codec);

    let nonce: [u8; NONCE_LEN] = rand::random();
    framed
        .send(WireMessage::Hello {
            public_key: keypair.public_key(),
            nonce: Bytes::copy_from_slice(&nonce),
        })
        .await?;

    let (remote_key, remote_nonce) = match next_message(&mut framed).await? {
        WireMessage::Hello { public_key, nonce } => (public_key, nonce),
        _ => return Err(P2pError::Handshake("expected hello".into())),
    };
    if remote_nonce.len() != NONCE_LEN {
        return Err(P2pError::Handshake("invalid nonce length".into()));
    }
    if remote_key == keypair.public_key() {
        return Err(P2pError::SelfConnection);
    }

    framed
        .send(WireMessage::Proof {
            signature: keypair.sign(&proof_message(&remote_nonce)),
        })
        .await?;

    match next_message(&mut framed).await? {
        WireMessage::Proof { signature } => remote_key
            .verify(&proof_message(&nonce), &signature)
            .map_err(|_| P2pError::Handshake("invalid proof signature".into()))?,
        _ => return Err(P2pError::Handshake("expected proof".into())),
    }

    Ok((framed, remote_key))
}

async fn write_packets(
    mut sink: SplitSink<WireFramed, WireMessage>,
    mut outbound: mpsc::Receiver<Frame>,
    closed: CancellationToken,
    max_payload: usize,
) {
    'frames: loop {
        let frame = tokio::select! {
            _ = closed.cancelled() => break,
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        for packet in packetize(frame, max_payload) {
            if let Err(e) = sink.send(WireMessage::Packet(packet)).await {
                tracing::debug!(err = %e, "connection write failed");
                break 'frames;
            }
        }
    }
    closed.cancel();
    let _ = sink.close().await;
}

async fn read_packets(
    mut stream: SplitStream<WireFramed>,
    inbound: mpsc::Sender<Frame>,
    closed: CancellationToken,
    max_message_size: usize,
) {
    let mut reassembler = Reassembler::new(max_message_size);
    loop {
        let msg = tokio::select! {
            _ = closed.cancelled() => break,
            msg = stream.next() => msg,
        };
        let packet = match msg {
            Some(Ok(WireMessage::Packet(packet))) => packet,
            Some(Ok(_)) => {
                tracing::warn!("unexpected handshake message on established connection");
                break;
            }
            Some(Err(e)) => {
                tracing::debug!(err = %e, "connection read failed");
                break;
            }
            None => {
                tracing::debug!("connection closed by remote");
                break;
            }
        };

        match reassembler.push(packet) {
            Ok(Some(frame)) => {
                tokio::select! {
                    _ = closed.cancelled() => break,
                    res = inbound.send(frame) => if res.is_err() { break },
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(err = %e, "protocol error, closing connection");
                break;
            }
        }
    }
    closed.cancel();
}

fn endpoint_for(addr: SocketAddr) -> Endpoint {
    Endpoint::networked(Protocol::mconn(), addr.ip(), addr.port())
}

fn start_connection(
    framed: WireFramed,
    remote_key: Ed25519PublicKey,
    local_endpoint: Endpoint,
    remote_endpoint: Endpoint,
    config: &MConnConfig,
) -> Arc<dyn Connection> {
    let closed = CancellationToken::new();
    let (out_tx, out_rx) = mpsc::channel(config.frame_buffer);
    let (in_tx, in_rx) = mpsc::channel(config.frame_buffer);
    let mux = Multiplexer::new(out_tx, in_rx, closed.clone(), config.frame_buffer);

    let (sink, stream) = framed.split();
    tokio::spawn(write_packets(
        sink,
        out_rx,
        closed.clone(),
        config.max_packet_payload,
    ));
    tokio::spawn(read_packets(stream, in_tx, closed, config.max_message_size));

    Arc::new(MuxedConnection {
        mux,
        remote_key,
        local_endpoint,
        remote_endpoint,
    })
}

async fn establish(
    socket: TcpStream,
    keypair: &Keypair,
    config: &MConnConfig,
) -> Result<Arc<dyn Connection>> {
    let local = endpoint_for(socket.local_addr()?);
    let remote = endpoint_for(socket.peer_addr()?);
    let (framed, remote_key) =
        tokio::time::timeout(config.handshake_timeout, handshake(socket, keypair, config))
            .await
            .map_err(|_| P2pError::Timeout("handshake".into()))??;

    Ok(start_connection(framed, remote_key, local, remote, config))
}

/// Accepts TCP sockets and runs each handshake in its own task. Only
/// authenticated connections reach `incoming`.
async fn accept_sockets(
    listener: TcpListener,
    keypair: Keypair,
    config: MConnConfig,
    incoming: mpsc::Sender<Arc<dyn Connection>>,
    closed: CancellationToken,
) {
    loop {
        let (socket, addr) = tokio::select! {
            _ = closed.cancelled() => break,
            res = listener.accept() => match res {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!(err = %e, "failed to accept tcp connection");
                    continue;
                }
            },
        };
        tracing::trace!(%addr, "accepted tcp connection");

        let keypair = keypair.clone();
        let config = config.clone();
        let incoming = incoming.clone();
        let closed = closed.clone();
        tokio::spawn(async move {
            let conn = tokio::select! {
                _ = closed.cancelled() => return,
                res = establish(socket, &keypair, &config) => match res {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::debug!(%addr, err = %e, "inbound handshake failed");
                        return;
                    }
                },
            };
            tokio::select! {
                _ = closed.cancelled() => {
                    let _ = conn.close().await;
                }
                res = incoming.send(Arc::clone(&conn)) => if res.is_err() {
                    let _ = conn.close().await;
                },
            }
        });
    }
    tracing::debug!("mconn listener stopped");
}

/// TCP transport.
pub struct MConnTransport {
    keypair: Keypair,
    config: MConnConfig,
    incoming: Option<Mutex<mpsc::Receiver<Arc<dyn Connection>>>>,
    local_addr: Option<SocketAddr>,
    closed: CancellationToken,
}

impl MConnTransport {
    /// A dial-only transport.
    pub fn new(keypair: Keypair, config: MConnConfig) -> Self {
        Self {
            keypair,
            config,
            incoming: None,
            local_addr: None,
            closed: CancellationToken::new(),
        }
    }

    /// A transport listening on `addr`.
    pub async fn listen(keypair: Keypair, config: MConnConfig, addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let closed = CancellationToken::new();
        let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
        tokio::spawn(accept_sockets(
            listener,
            keypair.clone(),
            config.clone(),
            tx,
            closed.clone(),
        ));
        tracing::info!(addr = %local_addr, "mconn transport listening");
        Ok(Self {
            keypair,
            config,
            incoming: Some(Mutex::new(rx)),
            local_addr: Some(local_addr),
            closed,
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

impl Drop for MConnTransport {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

#[async_trait]
impl Transport for MConnTransport {
    fn protocols(&self) -> Vec<Protocol> {
        vec![Protocol::mconn()]
    }

    fn endpoints(&self) -> Vec<Endpoint> {
        self.local_addr.map(endpoint_for).into_iter().collect()
    }

    async fn accept(&self) -> Result<Arc<dyn Connection>> {
        let Some(incoming) = &self.incoming else {
            self.closed.cancelled().await;
            return Err(P2pError::TransportClosed);
        };
        let mut incoming = incoming.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Err(P2pError::TransportClosed),
            conn = incoming.recv() => conn.ok_or(P2pError::TransportClosed),
        }
    }

    async fn dial(&self, endpoint: &Endpoint) -> Result<Arc<dyn Connection>> {
        if self.closed.is_cancelled() {
            return Err(P2pError::TransportClosed);
        }
        if endpoint.protocol.as_str() != Protocol::MCONN {
            return Err(P2pError::UnsupportedProtocol(endpoint.protocol.to_string()));
        }
        let addr = endpoint.socket_addr().ok_or_else(|| P2pError::Dial {
            endpoint: endpoint.to_string(),
            reason: "endpoint has no socket address".into(),
        })?;

        let socket = TcpStream::connect(addr).await.map_err(|e| P2pError::Dial {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        })?;
        establish(socket, &self.keypair, &self.config).await
    }

    async fn close(&self) -> Result<()> {
        self.closed.cancel();
        Ok(())
    }
}
