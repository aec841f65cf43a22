use std::{
    io,
    pin::Pin,
    task::{ready, Context, Poll},
};

use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

pin_project! {
    /// Applies a bitwise NOT to every byte flowing in either direction.
    #[derive(Debug)]
    pub(crate) struct BitReverse<S> {
        #[pin]
        inner: S,
    }
}

impl<S> BitReverse<S> {
    pub(crate) fn new(inner: S) -> Self {
        Self { inner }
    }
}

impl<S: AsyncRead> AsyncRead for BitReverse<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        let filled = buf.filled().len();
        ready!(this.inner.poll_read(cx, buf))?;
        for byte in &mut buf.filled_mut()[filled..] {
            *byte = !*byte;
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite> AsyncWrite for BitReverse<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.project();
        let flipped = buf.iter().map(|byte| !byte).collect::<Vec<u8>>();
        // A partial write of the flipped buffer consumes the same prefix of `buf`.
        this.inner.poll_write(cx, &flipped)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    use super::BitReverse;

    #[tokio::test]
    async fn round_trips_when_both_ends_reverse() {
        let (near, far) = duplex(64);
        let mut near = BitReverse::new(near);
        let mut far = BitReverse::new(far);

        near.write_all(b"hello relay").await.unwrap();
        near.flush().await.unwrap();

        let mut buf = [0u8; 11];
        far.read_exact(&mut buf).await.unwrap();
        assert_eq!(b"hello relay", &buf);
    }

    #[tokio::test]
    async fn wire_bytes_are_complemented() {
        let (near, mut far) = duplex(64);
        let mut near = BitReverse::new(near);

        near.write_all(&[0x00, 0xff, 0x5a]).await.unwrap();

        let mut buf = [0u8; 3];
        far.read_exact(&mut buf).await.unwrap();
        assert_eq!([0xff, 0x00, 0xa5], buf);
    }
}
