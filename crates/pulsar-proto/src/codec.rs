//! Length-delimited JSON framing.
//!
//! Each frame is a 4-byte big-endian length followed by one JSON document.
//! [`JsonCodec`] is typed on both directions so a server and a client cannot
//! accidentally decode their own message type:
//!
//! ```ignore
//! use futures::{SinkExt, StreamExt};
//! use pulsar_proto::{ClientCodec, Request};
//! use tokio_util::codec::Framed;
//!
//! let mut framed = Framed::new(stream, ClientCodec::new());
//! framed.send(Request::GetJobStatus { job_id: 1 }).await?;
//! let response = framed.next().await;
//! ```

use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::error::ProtoError;
use crate::{Request, Response};

/// Largest accepted frame (64 MiB). A batch of a few hundred thousand paths fits.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Codec decoding `D` and encoding `E`.
#[derive(Debug)]
pub struct JsonCodec<D, E> {
    inner: LengthDelimitedCodec,
    max_frame_len: usize,
    _marker: PhantomData<fn(E) -> D>,
}

/// Codec used by a Star: reads requests, writes responses.
pub type ServerCodec = JsonCodec<Request, Response>;

/// Codec used by clients and distributors: writes requests, reads responses.
pub type ClientCodec = JsonCodec<Response, Request>;

impl<D, E> JsonCodec<D, E> {
    pub fn new() -> Self {
        Self::with_max_frame_len(MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .max_frame_length(max_frame_len)
                .new_codec(),
            max_frame_len,
            _marker: PhantomData,
        }
    }
}

impl<D, E> Default for JsonCodec<D, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: DeserializeOwned, E> Decoder for JsonCodec<D, E> {
    type Item = D;
    type Error = ProtoError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<D>, ProtoError> {
        match self.inner.decode(src)? {
            Some(frame) => Ok(Some(serde_json::from_slice(&frame)?)),
            None => Ok(None),
        }
    }
}

impl<D, E: Serialize> Encoder<E> for JsonCodec<D, E> {
    type Error = ProtoError;

    fn encode(&mut self, item: E, dst: &mut BytesMut) -> Result<(), ProtoError> {
        let body = serde_json::to_vec(&item)?;
        if body.len() > self.max_frame_len {
            return Err(ProtoError::FrameTooLarge {
                len: body.len(),
                max: self.max_frame_len,
            });
        }
        self.inner.encode(Bytes::from(body), dst)?;
        Ok(())
    }
}
