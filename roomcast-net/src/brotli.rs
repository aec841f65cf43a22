use async_compression::tokio::{bufread::BrotliDecoder, write::BrotliEncoder};
use tokio::io::{self, BufReader};

use crate::io::BoxedIo;

/// Wraps `io` with streaming brotli in both directions.
///
/// The encoder only emits buffered output on flush, so framed writers must
/// flush after every frame.
pub(crate) fn duplex(io: BoxedIo) -> BoxedIo {
    let (read, write) = io::split(io);
    let read = BrotliDecoder::new(BufReader::new(read));
    let write = BrotliEncoder::new(write);
    Box::new(io::join(read, write))
}

#[cfg(test)]
mod tests {
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    use crate::io::BoxedIo;

    #[tokio::test]
    async fn round_trips_after_flush() {
        let (near, far) = duplex(4096);
        let mut near = super::duplex(Box::new(near) as BoxedIo);
        let mut far = super::duplex(Box::new(far) as BoxedIo);

        near.write_all(b"compressible compressible compressible")
            .await
            .unwrap();
        near.flush().await.unwrap();

        let mut buf = [0u8; 38];
        far.read_exact(&mut buf).await.unwrap();
        assert_eq!(b"compressible compressible compressible", &buf);

        // More data on the same stream keeps decoding.
        far.write_all(b"reply").await.unwrap();
        far.flush().await.unwrap();

        let mut buf = [0u8; 5];
        near.read_exact(&mut buf).await.unwrap();
        assert_eq!(b"reply", &buf);
    }
}
