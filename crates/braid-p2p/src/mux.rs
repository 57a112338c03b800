//! Stream multiplexing over one connection.
//!
//! A connection carries [`Frame`]s tagged with a stream id. The
//! [`Multiplexer`] runs one demux task that routes inbound frames to
//! per-stream bounded queues. Frames for ids nobody has claimed yet are
//! buffered (bounded) and handed to the first [`Stream`] that claims the id.
//!
//! An id is held by at most one stream handle at a time. Dropping both
//! halves of a stream releases the id.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{P2pError, Result};

/// Logical stream number within a connection.
pub type StreamId = u16;

/// One message on one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub stream: StreamId,
    pub payload: Bytes,
}

struct Slot {
    generation: u64,
    tx: mpsc::Sender<Bytes>,
    /// Present while no handle has claimed the id.
    pending: Option<mpsc::Receiver<Bytes>>,
}

#[derive(Default)]
struct MuxState {
    slots: HashMap<StreamId, Slot>,
    next_generation: u64,
    closed: bool,
}

struct Shared {
    state: Mutex<MuxState>,
    outbound: mpsc::Sender<Frame>,
    buffer: usize,
    closed: CancellationToken,
}

impl Shared {
    async fn dispatch(&self, frame: Frame) {
        let Frame { stream, payload } = frame;
        let (tx, claimed) = {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            if state.closed {
                return;
            }
            let buffer = self.buffer;
            let slot = state.slots.entry(stream).or_insert_with(|| {
                let (tx, rx) = mpsc::channel(buffer);
                Slot {
                    generation: 0,
                    tx,
                    pending: Some(rx),
                }
            });
            (slot.tx.clone(), slot.pending.is_none())
        };

        if claimed {
            tokio::select! {
                _ = self.closed.cancelled() => {}
                res = tx.send(payload) => {
                    if res.is_err() {
                        tracing::trace!(stream, "stream released during delivery");
                    }
                }
            }
        } else if tx.try_send(payload).is_err() {
            tracing::debug!(stream, "dropping frame for unclaimed stream, buffer full");
        }
    }

    fn shutdown(&self) {
        self.closed.cancel();
        if let Ok(mut state) = self.state.lock() {
            state.closed = true;
            state.slots.clear();
        }
    }

    fn release(&self, id: StreamId, generation: u64) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        let owned = state
            .slots
            .get(&id)
            .map_or(false, |slot| slot.generation == generation && slot.pending.is_none());
        if owned {
            state.slots.remove(&id);
        }
    }
}

/// Demultiplexes one connection's inbound frames into streams.
pub struct Multiplexer {
    shared: Arc<Shared>,
}

impl Multiplexer {
    /// Start a multiplexer.
    ///
    /// `outbound` receives every frame written by any stream; `inbound`
    /// yields frames read off the wire. `closed` is the connection's
    /// liveness token: cancelling it closes every stream, and the
    /// multiplexer cancels it itself when `inbound` ends.
    pub fn new(
        outbound: mpsc::Sender<Frame>,
        inbound: mpsc::Receiver<Frame>,
        closed: CancellationToken,
        buffer: usize,
    ) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(MuxState::default()),
            outbound,
            buffer: buffer.max(1),
            closed,
        });
        tokio::spawn(demux(shared.clone(), inbound));
        Self { shared }
    }

    /// Claim stream `id`.
    pub fn stream(&self, id: StreamId) -> Result<Stream> {
        let mut state = self
            .shared
            .state
            .lock()
            .map_err(|_| P2pError::ConnectionClosed)?;
        if state.closed || self.shared.closed.is_cancelled() {
            return Err(P2pError::ConnectionClosed);
        }

        state.next_generation += 1;
        let generation = state.next_generation;

        let inbound = match state.slots.get_mut(&id) {
            Some(slot) => {
                let rx = slot.pending.take().ok_or(P2pError::StreamInUse(id))?;
                slot.generation = generation;
                rx
            }
            None => {
                let (tx, rx) = mpsc::channel(self.shared.buffer);
                state.slots.insert(
                    id,
                    Slot {
                        generation,
                        tx,
                        pending: None,
                    },
                );
                rx
            }
        };

        let release = Arc::new(Release {
            shared: Arc::downgrade(&self.shared),
            id,
            generation,
        });
        Ok(Stream {
            sender: StreamSender {
                id,
                outbound: self.shared.outbound.clone(),
                closed: self.shared.closed.clone(),
                _release: release.clone(),
            },
            receiver: StreamReceiver {
                id,
                inbound,
                _release: release,
            },
        })
    }

    /// Close the connection and every stream on it.
    pub fn close(&self) {
        self.shared.shutdown();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Token cancelled when the connection closes for any reason.
    pub fn closed_token(&self) -> CancellationToken {
        self.shared.closed.clone()
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        self.shared.shutdown();
    }
}

async fn demux(shared: Arc<Shared>, mut inbound: mpsc::Receiver<Frame>) {
    loop {
        let frame = tokio::select! {
            _ = shared.closed.cancelled() => break,
            frame = inbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        shared.dispatch(frame).await;
    }
    shared.shutdown();
}

struct Release {
    shared: Weak<Shared>,
    id: StreamId,
    generation: u64,
}

impl Drop for Release {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.release(self.id, self.generation);
        }
    }
}

/// A bidirectional, message-preserving pipe identified by a stream id.
pub struct Stream {
    sender: StreamSender,
    receiver: StreamReceiver,
}

impl Stream {
    pub fn id(&self) -> StreamId {
        self.sender.id
    }

    /// Send one message.
    pub async fn send(&self, payload: Bytes) -> Result<()> {
        self.sender.send(payload).await
    }

    /// Next inbound message, or `None` once the connection has closed and
    /// buffered messages are drained.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.receiver.recv().await
    }

    /// Release the stream id.
    pub fn close(self) {}

    /// Split into independently owned halves. The id stays held until both
    /// halves are dropped.
    pub fn split(self) -> (StreamSender, StreamReceiver) {
        (self.sender, self.receiver)
    }
}

/// Write half of a [`Stream`].
#[derive(Clone)]
pub struct StreamSender {
    id: StreamId,
    outbound: mpsc::Sender<Frame>,
    closed: CancellationToken,
    _release: Arc<Release>,
}

impl StreamSender {
    pub fn id(&self) -> StreamId {
        self.id
    }

    pub async fn send(&self, payload: Bytes) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(P2pError::ConnectionClosed);
        }
        let frame = Frame {
            stream: self.id,
            payload,
        };
        tokio::select! {
            _ = self.closed.cancelled() => Err(P2pError::ConnectionClosed),
            res = self.outbound.send(frame) => res.map_err(|_| P2pError::ConnectionClosed),
        }
    }
}

/// Read half of a [`Stream`].
pub struct StreamReceiver {
    id: StreamId,
    inbound: mpsc::Receiver<Bytes>,
    _release: Arc<Release>,
}

impl StreamReceiver {
    pub fn id(&self) -> StreamId {
        self.id
    }

    pub async fn recv(&mut self) -> Option<Bytes> {
        self.inbound.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct Harness {
        mux: Multiplexer,
        wire_in: mpsc::Sender<Frame>,
        wire_out: mpsc::Receiver<Frame>,
    }

    fn harness(buffer: usize) -> Harness {
        let (out_tx, out_rx) = mpsc::channel(16);
        let (in_tx, in_rx) = mpsc::channel(16);
        Harness {
            mux: Multiplexer::new(out_tx, in_rx, CancellationToken::new(), buffer),
            wire_in: in_tx,
            wire_out: out_rx,
        }
    }

    fn frame(stream: StreamId, payload: &'static [u8]) -> Frame {
        Frame {
            stream,
            payload: Bytes::from_static(payload),
        }
    }

    #[tokio::test]
    async fn test_send_tags_frames_with_stream_id() {
        let mut h = harness(4);
        let stream = h.mux.stream(7).unwrap();
        stream.send(Bytes::from_static(b"hi")).await.unwrap();
        assert_eq!(h.wire_out.recv().await.unwrap(), frame(7, b"hi"));
    }

    #[tokio::test]
    async fn test_inbound_routed_per_stream() {
        let h = harness(4);
        let mut a = h.mux.stream(1).unwrap();
        let mut b = h.mux.stream(2).unwrap();

        h.wire_in.send(frame(2, b"two")).await.unwrap();
        h.wire_in.send(frame(1, b"one")).await.unwrap();

        assert_eq!(a.recv().await.unwrap(), Bytes::from_static(b"one"));
        assert_eq!(b.recv().await.unwrap(), Bytes::from_static(b"two"));
    }

    #[tokio::test]
    async fn test_stream_id_held_once() {
        let h = harness(4);
        let stream = h.mux.stream(3).unwrap();
        assert!(matches!(h.mux.stream(3), Err(P2pError::StreamInUse(3))));

        stream.close();
        assert!(h.mux.stream(3).is_ok());
    }

    #[tokio::test]
    async fn test_split_halves_hold_id_until_both_dropped() {
        let h = harness(4);
        let (tx, rx) = h.mux.stream(4).unwrap().split();
        drop(rx);
        assert!(matches!(h.mux.stream(4), Err(P2pError::StreamInUse(4))));
        drop(tx);
        assert!(h.mux.stream(4).is_ok());
    }

    #[tokio::test]
    async fn test_unclaimed_frames_buffered_then_dropped() {
        let h = harness(2);
        for payload in [&b"a"[..], b"b", b"c"] {
            h.wire_in
                .send(Frame {
                    stream: 9,
                    payload: Bytes::copy_from_slice(payload),
                })
                .await
                .unwrap();
        }

        // A round trip through a claimed stream proves the demux task has
        // processed everything sent before it.
        let mut sync = h.mux.stream(1).unwrap();
        h.wire_in.send(frame(1, b"sync")).await.unwrap();
        sync.recv().await.unwrap();

        let mut late = h.mux.stream(9).unwrap();
        assert_eq!(late.recv().await.unwrap(), Bytes::from_static(b"a"));
        assert_eq!(late.recv().await.unwrap(), Bytes::from_static(b"b"));
        assert!(tokio::time::timeout(Duration::from_millis(50), late.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_close_ends_streams() {
        let h = harness(4);
        let mut stream = h.mux.stream(1).unwrap();
        h.wire_in.send(frame(1, b"last")).await.unwrap();
        assert_eq!(stream.recv().await.unwrap(), Bytes::from_static(b"last"));

        h.mux.close();
        assert!(h.mux.is_closed());
        assert!(stream.recv().await.is_none());
        assert!(matches!(
            stream.send(Bytes::from_static(b"x")).await,
            Err(P2pError::ConnectionClosed)
        ));
        assert!(matches!(h.mux.stream(2), Err(P2pError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_wire_eof_closes_connection() {
        let Harness { mux, wire_in, .. } = harness(4);
        let token = mux.closed_token();
        drop(wire_in);
        tokio::time::timeout(Duration::from_secs(1), token.cancelled())
            .await
            .unwrap();
        assert!(mux.is_closed());
    }
}
