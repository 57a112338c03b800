//! Length-delimited CBOR framing.
//!
//! Every byte stream in the p2p layer carries a sequence of frames, each a
//! big-endian length prefix followed by one CBOR value.

use std::marker::PhantomData;

use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::error::P2pError;

/// Default upper bound on a single frame.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 32 * 1024 * 1024;

/// A codec that frames values of type `T` as length-prefixed CBOR.
#[derive(Debug)]
pub struct CborCodec<T> {
    length_codec: LengthDelimitedCodec,
    _marker: PhantomData<fn() -> T>,
}

impl<T> CborCodec<T> {
    pub fn new() -> Self {
        Self::with_max_frame_length(DEFAULT_MAX_FRAME_LENGTH)
    }

    /// A codec that rejects frames longer than `max` bytes.
    pub fn with_max_frame_length(max: usize) -> Self {
        Self {
            length_codec: LengthDelimitedCodec::builder()
                .max_frame_length(max)
                .new_codec(),
            _marker: PhantomData,
        }
    }
}

impl<T> Default for CborCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: DeserializeOwned> Decoder for CborCodec<T> {
    type Item = T;
    type Error = P2pError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(frame) = self.length_codec.decode(src)? else {
            return Ok(None);
        };

        braid_core::decode(&frame)
            .map(Some)
            .map_err(|e| P2pError::Decode(e.to_string()))
    }
}

impl<T: Serialize> Encoder<T> for CborCodec<T> {
    type Error = P2pError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let cbor = braid_core::encode(&item)?;
        self.length_codec
            .encode(Bytes::from(cbor), dst)
            .map_err(P2pError::Io)
    }
}
