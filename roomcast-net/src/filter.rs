use std::str::FromStr;

/// A transport filter, applied in configured order from the outside in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filter {
    /// Bitwise NOT of every byte in both directions.
    Reverse,
    /// Streaming brotli compression.
    Brotli,
    /// Stream multiplexing over one connection.
    Multiplex,
    /// TLS with the inbound's configured certificate.
    Tls,
}

#[derive(Debug, thiserror::Error)]
#[error("unknown filter {0:?}")]
pub struct UnknownFilterError(pub String);

impl FromStr for Filter {
    type Err = UnknownFilterError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name {
            "reverse" => Ok(Self::Reverse),
            "brotli" => Ok(Self::Brotli),
            "multiplex" => Ok(Self::Multiplex),
            "tls" => Ok(Self::Tls),
            _ => Err(UnknownFilterError(name.to_owned())),
        }
    }
}
