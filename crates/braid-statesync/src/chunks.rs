//! Bookkeeping for the chunks of the snapshot being fetched.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use bytes::Bytes;
use tokio::time::Instant;

use braid_core::{Chunk, PeerId, Snapshot};

use crate::error::{Result, StateSyncError};

#[derive(Debug, Clone, Copy)]
struct Request {
    peer: PeerId,
    deadline: Instant,
}

/// Tracks every index of one snapshot as pending, in flight or retrieved.
///
/// Each index is in exactly one of the three states. Retrieved is final.
#[derive(Debug)]
pub struct ChunkQueue {
    snapshot: Snapshot,
    pending: BTreeSet<u32>,
    in_flight: BTreeMap<u32, Request>,
    retrieved: BTreeMap<u32, Bytes>,
    attempts: HashMap<u32, u32>,
}

impl ChunkQueue {
    pub fn new(snapshot: Snapshot) -> Self {
        Self {
            pending: (0..snapshot.chunks).collect(),
            in_flight: BTreeMap::new(),
            retrieved: BTreeMap::new(),
            attempts: HashMap::new(),
            snapshot,
        }
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    /// Store a chunk.
    ///
    /// Returns `Ok(false)` if the index was already retrieved. Chunks that do
    /// not belong to the snapshot are rejected and leave the queue untouched.
    pub fn add(&mut self, chunk: Chunk) -> Result<bool> {
        if !chunk.belongs_to(&self.snapshot) {
            return Err(StateSyncError::ChunkMismatch(format!(
                "chunk {}/{}/{} does not belong to snapshot {}/{} with {} chunks",
                chunk.height,
                chunk.format,
                chunk.index,
                self.snapshot.height,
                self.snapshot.format,
                self.snapshot.chunks
            )));
        }
        if self.retrieved.contains_key(&chunk.index) {
            return Ok(false);
        }
        self.pending.remove(&chunk.index);
        self.in_flight.remove(&chunk.index);
        self.retrieved.insert(chunk.index, chunk.payload);
        Ok(true)
    }

    /// Pending indices, lowest first.
    pub fn pending(&self) -> impl Iterator<Item = u32> + '_ {
        self.pending.iter().copied()
    }

    /// Move a pending index in flight.
    pub fn dispatch(&mut self, index: u32, peer: PeerId, deadline: Instant) -> bool {
        if !self.pending.remove(&index) {
            return false;
        }
        self.in_flight.insert(index, Request { peer, deadline });
        true
    }

    /// Return an in-flight index to pending and count a failed attempt.
    ///
    /// Returns the peer it was requested from and the attempts so far.
    pub fn fail(&mut self, index: u32) -> Option<(PeerId, u32)> {
        let request = self.in_flight.remove(&index)?;
        self.pending.insert(index);
        let attempts = self.attempts.entry(index).or_insert(0);
        *attempts += 1;
        Some((request.peer, *attempts))
    }

    /// Who `index` is currently requested from.
    pub fn requested_from(&self, index: u32) -> Option<PeerId> {
        self.in_flight.get(&index).map(|r| r.peer)
    }

    /// In-flight indices requested from `peer`.
    pub fn in_flight_for(&self, peer: &PeerId) -> Vec<u32> {
        self.in_flight
            .iter()
            .filter(|(_, r)| r.peer == *peer)
            .map(|(index, _)| *index)
            .collect()
    }

    /// In-flight indices whose deadline has passed.
    pub fn expired(&self, now: Instant) -> Vec<u32> {
        self.in_flight
            .iter()
            .filter(|(_, r)| r.deadline <= now)
            .map(|(index, _)| *index)
            .collect()
    }

    /// Earliest in-flight deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.in_flight.values().map(|r| r.deadline).min()
    }

    /// Requests outstanding against `peer`.
    pub fn load(&self, peer: &PeerId) -> usize {
        self.in_flight.values().filter(|r| r.peer == *peer).count()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn attempts(&self, index: u32) -> u32 {
        self.attempts.get(&index).copied().unwrap_or(0)
    }

    pub fn is_retrieved(&self, index: u32) -> bool {
        self.retrieved.contains_key(&index)
    }

    pub fn retrieved_len(&self) -> usize {
        self.retrieved.len()
    }

    pub fn is_complete(&self) -> bool {
        self.retrieved.len() == self.snapshot.chunks as usize
    }

    /// Chunk payloads in index order, once every chunk is retrieved.
    pub fn into_chunks(self) -> Option<Vec<Bytes>> {
        if !self.is_complete() {
            return None;
        }
        Some(self.retrieved.into_values().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::Duration;

    fn snapshot(chunks: u32) -> Snapshot {
        Snapshot {
            height: 100,
            format: 1,
            chunks,
            hash: Bytes::from_static(b"H"),
            metadata: Bytes::new(),
        }
    }

    fn chunk(index: u32, payload: &'static [u8]) -> Chunk {
        Chunk {
            height: 100,
            format: 1,
            index,
            payload: Bytes::from_static(payload),
            sender: PeerId::from_bytes([1; 20]),
        }
    }

    #[test]
    fn test_out_of_range_rejected_without_mutation() {
        let mut queue = ChunkQueue::new(snapshot(3));
        assert!(queue.add(chunk(3, b"x")).is_err());

        let mut wrong_height = chunk(0, b"x");
        wrong_height.height = 99;
        assert!(queue.add(wrong_height).is_err());

        let mut wrong_format = chunk(0, b"x");
        wrong_format.format = 2;
        assert!(queue.add(wrong_format).is_err());

        assert_eq!(queue.retrieved_len(), 0);
        assert_eq!(queue.pending().collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[test]
    fn test_readding_retrieved_is_noop() {
        let mut queue = ChunkQueue::new(snapshot(2));
        assert!(queue.add(chunk(0, b"first")).unwrap());
        assert!(!queue.add(chunk(0, b"second")).unwrap());
        assert!(queue.add(chunk(1, b"b")).unwrap());

        let chunks = queue.into_chunks().unwrap();
        assert_eq!(chunks, vec![Bytes::from_static(b"first"), Bytes::from_static(b"b")]);
    }

    #[test]
    fn test_fail_returns_index_to_pending() {
        let mut queue = ChunkQueue::new(snapshot(2));
        let peer = PeerId::from_bytes([7; 20]);
        let deadline = Instant::now() + Duration::from_secs(1);

        assert!(queue.dispatch(1, peer, deadline));
        assert!(!queue.dispatch(1, peer, deadline));
        assert_eq!(queue.requested_from(1), Some(peer));
        assert_eq!(queue.load(&peer), 1);

        assert_eq!(queue.fail(1), Some((peer, 1)));
        assert_eq!(queue.fail(1), None);
        assert_eq!(queue.attempts(1), 1);
        assert_eq!(queue.pending().collect::<Vec<_>>(), vec![0, 1]);
    }

    #[test]
    fn test_unsolicited_chunk_clears_in_flight() {
        let mut queue = ChunkQueue::new(snapshot(1));
        let peer = PeerId::from_bytes([7; 20]);
        queue.dispatch(0, peer, Instant::now() + Duration::from_secs(1));
        assert!(queue.add(chunk(0, b"a")).unwrap());
        assert_eq!(queue.in_flight_len(), 0);
        assert!(queue.is_complete());
    }

    #[test]
    fn test_expired() {
        let mut queue = ChunkQueue::new(snapshot(2));
        let peer = PeerId::from_bytes([7; 20]);
        let now = Instant::now();
        queue.dispatch(0, peer, now);
        queue.dispatch(1, peer, now + Duration::from_secs(60));
        assert_eq!(queue.expired(now), vec![0]);
        assert_eq!(queue.next_deadline(), Some(now));
    }

    #[test]
    fn test_incomplete_has_no_chunks() {
        let mut queue = ChunkQueue::new(snapshot(2));
        queue.add(chunk(1, b"b")).unwrap();
        assert!(queue.into_chunks().is_none());
    }

    proptest! {
        #[test]
        fn prop_every_index_in_one_state(
            ops in prop::collection::vec((0u8..3, 0u32..6), 0..40)
        ) {
            let mut queue = ChunkQueue::new(snapshot(6));
            let peer = PeerId::from_bytes([2; 20]);
            let deadline = Instant::now();
            for (op, index) in ops {
                match op {
                    0 => { queue.dispatch(index, peer, deadline); }
                    1 => { queue.fail(index); }
                    _ => { queue.add(chunk(index, b"c")).unwrap(); }
                }
                let pending: BTreeSet<u32> = queue.pending().collect();
                for i in 0..6 {
                    let states = [
                        pending.contains(&i),
                        queue.requested_from(i).is_some(),
                        queue.is_retrieved(i),
                    ];
                    prop_assert_eq!(states.iter().filter(|s| **s).count(), 1);
                }
            }
        }
    }
}
