use tokio::io::{AsyncRead, AsyncWrite};

/// Byte stream trait object bound used across the filter chain.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Io for T {}

pub type BoxedIo = Box<dyn Io>;
