//! Proptest generators for property-based testing.

use bytes::Bytes;
use proptest::prelude::*;

use braid_core::{Keypair, PeerId, Snapshot};
use braid_statesync::{ChunkRequest, ChunkResponse, SnapshotsRequest, StateSyncMessage};

/// Generate a random keypair.
pub fn keypair() -> impl Strategy<Value = Keypair> {
    any::<[u8; 32]>().prop_map(|seed| Keypair::from_seed(&seed))
}

/// Generate a random PeerId.
pub fn peer_id() -> impl Strategy<Value = PeerId> {
    any::<[u8; 20]>().prop_map(PeerId::from_bytes)
}

/// A small pool of peer ids, so that generated advertisements collide.
pub fn peer_from_pool(size: u8) -> impl Strategy<Value = PeerId> {
    (0..size.max(1)).prop_map(|i| PeerId::from_bytes([i; 20]))
}

/// Generate a valid snapshot descriptor.
///
/// Heights, formats and hashes come from narrow ranges so that duplicate
/// keys and ranking ties are common.
pub fn snapshot() -> impl Strategy<Value = Snapshot> {
    (1u64..=20, 1u32..=3, 1u32..=16, 0u8..4).prop_map(|(height, format, chunks, hash)| {
        Snapshot {
            height,
            format,
            chunks,
            hash: Bytes::from(vec![hash + 1; 32]),
            metadata: Bytes::new(),
        }
    })
}

/// Generate chunk payload bytes of at most `max_len`.
pub fn payload(max_len: usize) -> impl Strategy<Value = Bytes> {
    prop::collection::vec(any::<u8>(), 0..=max_len).prop_map(Bytes::from)
}

/// Generate a well-formed state sync message.
pub fn message() -> impl Strategy<Value = StateSyncMessage> {
    prop_oneof![
        Just(StateSyncMessage::SnapshotsRequest(SnapshotsRequest {})),
        snapshot().prop_map(|s| StateSyncMessage::SnapshotsResponse(s.into())),
        (1u64..1000, any::<u32>(), any::<u32>()).prop_map(|(height, format, index)| {
            StateSyncMessage::ChunkRequest(ChunkRequest {
                height,
                format,
                index,
            })
        }),
        (1u64..1000, any::<u32>(), any::<u32>(), payload(64)).prop_map(
            |(height, format, index, chunk)| {
                let missing = chunk.is_empty();
                StateSyncMessage::ChunkResponse(ChunkResponse {
                    height,
                    format,
                    index,
                    chunk,
                    missing,
                })
            }
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn generated_messages_validate(msg in message()) {
            prop_assert!(msg.validate().is_ok());
        }

        #[test]
        fn generated_snapshots_rank_consistently(a in snapshot(), b in snapshot()) {
            prop_assert_eq!(a.rank_cmp(&b), b.rank_cmp(&a).reverse());
        }
    }
}
