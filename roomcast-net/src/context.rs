use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::{de::DeserializeOwned, Serialize};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::io::BoxedIo;

/// A framed MessagePack conversation over an established connection.
///
/// Every frame is a 4-byte big-endian length prefix followed by one
/// MessagePack object encoded with named fields.
pub struct Context {
    frames: Framed<BoxedIo, LengthDelimitedCodec>,
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The peer closed the connection between frames.
    #[error("connection closed")]
    Closed,
    #[error("io")]
    Io(#[source] std::io::Error),
    #[error("decode")]
    Decode(#[source] rmp_serde::decode::Error),
    #[error("encode")]
    Encode(#[source] rmp_serde::encode::Error),
}

impl FrameError {
    /// Whether the error is a clean end-of-stream.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

impl Context {
    #[must_use]
    pub fn new(io: BoxedIo) -> Self {
        Self {
            frames: Framed::new(io, LengthDelimitedCodec::new()),
        }
    }

    /// Read the next frame and decode it as `T`.
    pub async fn read_obj<T: DeserializeOwned>(&mut self) -> Result<T, FrameError> {
        let frame = match self.frames.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(err)) => return Err(FrameError::Io(err)),
            None => return Err(FrameError::Closed),
        };
        rmp_serde::from_slice(&frame).map_err(FrameError::Decode)
    }

    /// Encode `obj` into one frame and flush it to the peer.
    pub async fn write_obj<T: Serialize>(&mut self, obj: &T) -> Result<(), FrameError> {
        let body = rmp_serde::to_vec_named(obj).map_err(FrameError::Encode)?;
        self.frames
            .send(Bytes::from(body))
            .await
            .map_err(FrameError::Io)
    }
}
