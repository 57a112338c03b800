//! Typed, addressable message channels.
//!
//! A channel binds a [`ChannelId`] (the stream id used on every connection)
//! to one message type. Reactors read inbound [`Envelope`]s from a
//! [`Channel`] and write outbound ones through a [`ChannelSender`]. The
//! router does the rest: encoding, peer selection, scheduling.
//!
//! Delivery is asynchronous and at most once. Messages may be dropped when
//! a queue is full or the peer goes away.

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;

use braid_core::PeerId;

use crate::error::{P2pError, Result};

/// Identifies a channel, and the stream carrying it on every connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u16);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

/// Static properties of a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelDescriptor {
    pub id: ChannelId,
    /// Relative send priority; higher drains faster.
    pub priority: u32,
    /// Per-peer outbound queue bound, in messages.
    pub send_queue_capacity: usize,
    /// Largest accepted inbound message, in bytes.
    pub recv_message_capacity: usize,
    /// Inbound queue bound, in messages.
    pub recv_buffer_capacity: usize,
}

impl ChannelDescriptor {
    pub fn new(id: u16) -> Self {
        Self {
            id: ChannelId(id),
            priority: 1,
            send_queue_capacity: 32,
            recv_message_capacity: 1024 * 1024,
            recv_buffer_capacity: 128,
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_send_queue_capacity(mut self, capacity: usize) -> Self {
        self.send_queue_capacity = capacity;
        self
    }

    pub fn with_recv_message_capacity(mut self, capacity: usize) -> Self {
        self.recv_message_capacity = capacity;
        self
    }

    pub fn with_recv_buffer_capacity(mut self, capacity: usize) -> Self {
        self.recv_buffer_capacity = capacity;
        self
    }
}

/// A message plus its routing metadata.
///
/// Inbound envelopes always have `from` set. Outbound envelopes must set
/// exactly one of `to` and `broadcast`; anything else is dropped by the
/// router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope<M> {
    pub from: Option<PeerId>,
    pub to: Option<PeerId>,
    pub broadcast: bool,
    pub message: M,
}

impl<M> Envelope<M> {
    /// Address `message` to one peer.
    pub fn to(peer: PeerId, message: M) -> Self {
        Self {
            from: None,
            to: Some(peer),
            broadcast: false,
            message,
        }
    }

    /// Address `message` to every connected peer.
    pub fn broadcast(message: M) -> Self {
        Self {
            from: None,
            to: None,
            broadcast: true,
            message,
        }
    }

    /// An inbound envelope.
    pub fn inbound(from: PeerId, message: M) -> Self {
        Self {
            from: Some(from),
            to: None,
            broadcast: false,
            message,
        }
    }

    /// Whether exactly one of `to` and `broadcast` is set.
    pub fn is_addressed(&self) -> bool {
        self.to.is_some() != self.broadcast
    }
}

/// What the router should do about a misbehaving peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerErrorAction {
    /// Log only.
    None,
    /// Close the connection.
    Disconnect,
    /// Close the connection and never talk to the peer again.
    Ban,
}

/// A fault attributed to a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerError {
    pub peer_id: PeerId,
    pub error: String,
    pub action: PeerErrorAction,
}

impl PeerError {
    pub fn disconnect(peer_id: PeerId, error: impl fmt::Display) -> Self {
        Self {
            peer_id,
            error: error.to_string(),
            action: PeerErrorAction::Disconnect,
        }
    }

    pub fn ban(peer_id: PeerId, error: impl fmt::Display) -> Self {
        Self {
            peer_id,
            error: error.to_string(),
            action: PeerErrorAction::Ban,
        }
    }
}

/// A wire value could not be turned into the channel's message type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot unwrap message: {0}")]
pub struct UnwrapError(pub String);

/// A type that can travel on a channel.
///
/// Channels carrying several message kinds use a tagged-union `Wire` type;
/// `unwrap` fails on an empty or unknown case. Single-kind channels use
/// [`plain_channel_message!`](crate::plain_channel_message).
pub trait ChannelMessage: Sized + Send + 'static {
    type Wire: Serialize + DeserializeOwned + Send + 'static;

    fn wrap(self) -> Self::Wire;

    fn unwrap(wire: Self::Wire) -> std::result::Result<Self, UnwrapError>;
}

/// Implement [`ChannelMessage`] as the identity for a serde type.
#[macro_export]
macro_rules! plain_channel_message {
    ($ty:ty) => {
        impl $crate::ChannelMessage for $ty {
            type Wire = $ty;

            fn wrap(self) -> Self::Wire {
                self
            }

            fn unwrap(wire: Self::Wire) -> ::std::result::Result<Self, $crate::UnwrapError> {
                Ok(wire)
            }
        }
    };
}

/// Encode a message for the wire.
pub fn encode_message<M: ChannelMessage>(message: M) -> Result<Bytes> {
    Ok(Bytes::from(braid_core::encode(&message.wrap())?))
}

/// Decode a wire payload into a message.
pub fn decode_message<M: ChannelMessage>(payload: &[u8]) -> Result<M> {
    let wire: M::Wire =
        braid_core::decode(payload).map_err(|e| P2pError::Decode(e.to_string()))?;
    M::unwrap(wire).map_err(|e| P2pError::Decode(e.to_string()))
}

/// Cloneable write side of a channel.
pub struct ChannelSender<M> {
    id: ChannelId,
    outbound: mpsc::Sender<Envelope<M>>,
    errors: mpsc::Sender<PeerError>,
}

impl<M> Clone for ChannelSender<M> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            outbound: self.outbound.clone(),
            errors: self.errors.clone(),
        }
    }
}

impl<M: ChannelMessage> ChannelSender<M> {
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Queue an envelope for routing.
    pub async fn send(&self, envelope: Envelope<M>) -> Result<()> {
        self.outbound
            .send(envelope)
            .await
            .map_err(|_| P2pError::ChannelClosed)
    }

    /// Send `message` to one peer.
    pub async fn to(&self, peer: PeerId, message: M) -> Result<()> {
        self.send(Envelope::to(peer, message)).await
    }

    /// Send `message` to every connected peer.
    pub async fn broadcast(&self, message: M) -> Result<()> {
        self.send(Envelope::broadcast(message)).await
    }

    /// Report a misbehaving peer to the router.
    pub async fn report_error(&self, error: PeerError) -> Result<()> {
        self.errors
            .send(error)
            .await
            .map_err(|_| P2pError::ChannelClosed)
    }
}

/// A reactor's handle on one channel.
pub struct Channel<M> {
    id: ChannelId,
    inbound: mpsc::Receiver<Envelope<M>>,
    sender: Option<ChannelSender<M>>,
}

impl<M: ChannelMessage> Channel<M> {
    pub(crate) fn new(
        id: ChannelId,
        inbound: mpsc::Receiver<Envelope<M>>,
        outbound: mpsc::Sender<Envelope<M>>,
        errors: mpsc::Sender<PeerError>,
    ) -> Self {
        Self {
            id,
            inbound,
            sender: Some(ChannelSender {
                id,
                outbound,
                errors,
            }),
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Next inbound envelope. Returns `None` once the channel is closed and
    /// drained.
    pub async fn recv(&mut self) -> Option<Envelope<M>> {
        self.inbound.recv().await
    }

    /// A sender for this channel.
    pub fn sender(&self) -> Result<ChannelSender<M>> {
        self.sender.clone().ok_or(P2pError::ChannelClosed)
    }

    /// Close the outbound side.
    ///
    /// Once every [`ChannelSender`] is gone the router drains what was
    /// queued, releases the channel id and ends the inbound side.
    pub fn close(&mut self) {
        self.sender = None;
    }
}

/// Type-erased inbound side of an open channel, held by the router.
#[async_trait]
pub(crate) trait InboundSink: Send + Sync {
    /// Decode `payload` and deliver it. `Ok(false)` means the channel is
    /// gone.
    async fn deliver(&self, from: PeerId, payload: Bytes) -> Result<bool>;
}

pub(crate) struct TypedInbound<M> {
    pub(crate) tx: mpsc::Sender<Envelope<M>>,
}

#[async_trait]
impl<M: ChannelMessage> InboundSink for TypedInbound<M> {
    async fn deliver(&self, from: PeerId, payload: Bytes) -> Result<bool> {
        let message = decode_message::<M>(&payload)?;
        Ok(self.tx.send(Envelope::inbound(from, message)).await.is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note(String);

    crate::plain_channel_message!(Note);

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Wrapper {
        text: Option<String>,
    }

    #[derive(Debug, PartialEq)]
    struct Text(String);

    impl ChannelMessage for Text {
        type Wire = Wrapper;

        fn wrap(self) -> Wrapper {
            Wrapper { text: Some(self.0) }
        }

        fn unwrap(wire: Wrapper) -> std::result::Result<Self, UnwrapError> {
            wire.text
                .map(Text)
                .ok_or_else(|| UnwrapError("empty wrapper".into()))
        }
    }

    fn peer(byte: u8) -> PeerId {
        PeerId::from_bytes([byte; 20])
    }

    #[test]
    fn test_envelope_addressing() {
        assert!(Envelope::to(peer(1), ()).is_addressed());
        assert!(Envelope::broadcast(()).is_addressed());

        let mut both = Envelope::to(peer(1), ());
        both.broadcast = true;
        assert!(!both.is_addressed());

        let neither = Envelope {
            from: None,
            to: None,
            broadcast: false,
            message: (),
        };
        assert!(!neither.is_addressed());
    }

    #[test]
    fn test_plain_message_codec() {
        let bytes = encode_message(Note("hi".into())).unwrap();
        assert_eq!(decode_message::<Note>(&bytes).unwrap(), Note("hi".into()));
    }

    #[test]
    fn test_wrapper_rejects_empty_case() {
        let empty = braid_core::encode(&Wrapper { text: None }).unwrap();
        assert!(matches!(
            decode_message::<Text>(&empty),
            Err(P2pError::Decode(_))
        ));

        let bytes = encode_message(Text("ok".into())).unwrap();
        assert_eq!(decode_message::<Text>(&bytes).unwrap(), Text("ok".into()));
    }

    #[tokio::test]
    async fn test_sender_fails_after_router_side_closes() {
        let (in_tx, in_rx) = mpsc::channel(1);
        let (out_tx, out_rx) = mpsc::channel(1);
        let (err_tx, _err_rx) = mpsc::channel(1);
        let mut channel = Channel::<Note>::new(ChannelId(1), in_rx, out_tx, err_tx);
        let sender = channel.sender().unwrap();

        drop(out_rx);
        assert!(matches!(
            sender.to(peer(2), Note("x".into())).await,
            Err(P2pError::ChannelClosed)
        ));

        channel.close();
        assert!(matches!(channel.sender(), Err(P2pError::ChannelClosed)));

        drop(in_tx);
        assert!(channel.recv().await.is_none());
    }

    #[test]
    fn test_channel_id_display() {
        assert_eq!(ChannelId(0x60).to_string(), "0x60");
    }
}
