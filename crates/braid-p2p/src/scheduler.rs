//! Per-peer outbound scheduling.
//!
//! Each connected peer has one [`PeerQueue`]: a bounded FIFO per channel
//! plus a selector that favours the channel with the lowest ratio of
//! recently sent bytes to priority. `recently_sent` decays geometrically so
//! a burst on one channel is forgiven after a while.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::channel::{ChannelDescriptor, ChannelId};

/// How often `recently_sent` decays.
const DECAY_INTERVAL: Duration = Duration::from_secs(2);
/// Factor applied at each decay step.
const DECAY_FACTOR: f64 = 0.8;

#[derive(Debug)]
struct ChannelQueue {
    priority: u32,
    capacity: usize,
    items: VecDeque<Bytes>,
    recently_sent: f64,
}

impl ChannelQueue {
    fn ratio(&self) -> f64 {
        self.recently_sent / f64::from(self.priority.max(1))
    }
}

/// Priority scheduler over per-channel queues.
#[derive(Debug)]
pub struct Scheduler {
    queues: BTreeMap<ChannelId, ChannelQueue>,
    last_decay: Instant,
}

impl Scheduler {
    pub fn new<'a>(descriptors: impl IntoIterator<Item = &'a ChannelDescriptor>) -> Self {
        let mut scheduler = Self {
            queues: BTreeMap::new(),
            last_decay: Instant::now(),
        };
        for descriptor in descriptors {
            scheduler.add_channel(descriptor);
        }
        scheduler
    }

    /// Start scheduling a channel. Existing queues are kept.
    pub fn add_channel(&mut self, descriptor: &ChannelDescriptor) {
        self.queues.entry(descriptor.id).or_insert_with(|| ChannelQueue {
            priority: descriptor.priority,
            capacity: descriptor.send_queue_capacity.max(1),
            items: VecDeque::new(),
            recently_sent: 0.0,
        });
    }

    /// Stop scheduling a channel, discarding anything queued.
    pub fn remove_channel(&mut self, id: ChannelId) {
        self.queues.remove(&id);
    }

    /// Queue a message. Returns `false` if the channel is unknown or its
    /// queue is full.
    pub fn push(&mut self, id: ChannelId, payload: Bytes) -> bool {
        match self.queues.get_mut(&id) {
            Some(queue) if queue.items.len() < queue.capacity => {
                queue.items.push_back(payload);
                true
            }
            _ => false,
        }
    }

    /// Take the next message to send.
    pub fn pop(&mut self) -> Option<(ChannelId, Bytes)> {
        self.decay(Instant::now());

        let id = self
            .queues
            .iter()
            .filter(|(_, q)| !q.items.is_empty())
            .min_by(|(_, a), (_, b)| a.ratio().total_cmp(&b.ratio()))
            .map(|(id, _)| *id)?;

        let queue = self.queues.get_mut(&id)?;
        let payload = queue.items.pop_front()?;
        queue.recently_sent += payload.len() as f64;
        Some((id, payload))
    }

    pub fn len(&self) -> usize {
        self.queues.values().map(|q| q.items.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.values().all(|q| q.items.is_empty())
    }

    fn decay(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_decay);
        let steps = (elapsed.as_millis() / DECAY_INTERVAL.as_millis()) as i32;
        if steps == 0 {
            return;
        }
        let factor = DECAY_FACTOR.powi(steps);
        for queue in self.queues.values_mut() {
            queue.recently_sent *= factor;
        }
        self.last_decay = now;
    }
}

/// A [`Scheduler`] shared between routing tasks and one peer's send task.
pub(crate) struct PeerQueue {
    scheduler: Mutex<Scheduler>,
    notify: Notify,
}

impl PeerQueue {
    pub(crate) fn new(scheduler: Scheduler) -> Self {
        Self {
            scheduler: Mutex::new(scheduler),
            notify: Notify::new(),
        }
    }

    pub(crate) fn add_channel(&self, descriptor: &ChannelDescriptor) {
        if let Ok(mut scheduler) = self.scheduler.lock() {
            scheduler.add_channel(descriptor);
        }
    }

    pub(crate) fn remove_channel(&self, id: ChannelId) {
        if let Ok(mut scheduler) = self.scheduler.lock() {
            scheduler.remove_channel(id);
        }
    }

    pub(crate) fn enqueue(&self, id: ChannelId, payload: Bytes) -> bool {
        let queued = match self.scheduler.lock() {
            Ok(mut scheduler) => scheduler.push(id, payload),
            Err(_) => false,
        };
        if queued {
            self.notify.notify_one();
        }
        queued
    }

    /// Wait for the next message, or `None` on cancellation.
    pub(crate) async fn dequeue(&self, cancel: &CancellationToken) -> Option<(ChannelId, Bytes)> {
        loop {
            if let Some(next) = self.scheduler.lock().ok()?.pop() {
                return Some(next);
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = self.notify.notified() => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn descriptors() -> Vec<ChannelDescriptor> {
        vec![
            ChannelDescriptor::new(1)
                .with_priority(1)
                .with_send_queue_capacity(8),
            ChannelDescriptor::new(2)
                .with_priority(4)
                .with_send_queue_capacity(8),
        ]
    }

    fn payload(n: usize) -> Bytes {
        Bytes::from(vec![0u8; n])
    }

    #[test]
    fn test_full_queue_drops() {
        let desc = ChannelDescriptor::new(1).with_send_queue_capacity(2);
        let mut scheduler = Scheduler::new([&desc]);
        assert!(scheduler.push(ChannelId(1), payload(1)));
        assert!(scheduler.push(ChannelId(1), payload(1)));
        assert!(!scheduler.push(ChannelId(1), payload(1)));
        assert!(!scheduler.push(ChannelId(9), payload(1)));
        assert_eq!(scheduler.len(), 2);
    }

    #[test]
    fn test_higher_priority_gets_more_bandwidth() {
        let descs = descriptors();
        let mut scheduler = Scheduler::new(&descs);
        for _ in 0..8 {
            scheduler.push(ChannelId(1), payload(100));
            scheduler.push(ChannelId(2), payload(100));
        }

        let first_five: Vec<u16> = (0..5).map(|_| scheduler.pop().unwrap().0 .0).collect();
        let high = first_five.iter().filter(|id| **id == 2).count();
        assert!(high >= 4, "high priority sent {} of first five", high);
    }

    #[test]
    fn test_fifo_within_channel() {
        let descs = descriptors();
        let mut scheduler = Scheduler::new(&descs);
        scheduler.push(ChannelId(1), Bytes::from_static(b"a"));
        scheduler.push(ChannelId(1), Bytes::from_static(b"b"));
        assert_eq!(scheduler.pop().unwrap().1, Bytes::from_static(b"a"));
        assert_eq!(scheduler.pop().unwrap().1, Bytes::from_static(b"b"));
        assert!(scheduler.pop().is_none());
    }

    #[test]
    fn test_removed_channel_discards_queue() {
        let descs = descriptors();
        let mut scheduler = Scheduler::new(&descs);
        scheduler.push(ChannelId(1), payload(1));
        scheduler.remove_channel(ChannelId(1));
        assert!(scheduler.is_empty());
        assert!(!scheduler.push(ChannelId(1), payload(1)));
    }

    #[tokio::test]
    async fn test_dequeue_wakes_on_enqueue() {
        let descs = descriptors();
        let queue = std::sync::Arc::new(PeerQueue::new(Scheduler::new(&descs)));
        let cancel = CancellationToken::new();

        let waiter = {
            let queue = queue.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { queue.dequeue(&cancel).await })
        };
        tokio::task::yield_now().await;
        assert!(queue.enqueue(ChannelId(2), payload(3)));

        let (id, bytes) = waiter.await.unwrap().unwrap();
        assert_eq!(id, ChannelId(2));
        assert_eq!(bytes.len(), 3);

        cancel.cancel();
        assert!(queue.dequeue(&cancel).await.is_none());
    }

    proptest! {
        #[test]
        fn prop_every_queued_message_is_popped_once(
            pushes in prop::collection::vec((1u16..=2, 1usize..64), 0..16)
        ) {
            let descs = descriptors();
            let mut scheduler = Scheduler::new(&descs);
            let mut accepted = 0;
            for (id, len) in pushes {
                if scheduler.push(ChannelId(id), payload(len)) {
                    accepted += 1;
                }
            }
            let mut popped = 0;
            while scheduler.pop().is_some() {
                popped += 1;
            }
            prop_assert_eq!(accepted, popped);
        }
    }
}
