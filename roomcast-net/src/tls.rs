use std::{fs::File, io::BufReader, path::Path, sync::Arc};

use tokio_rustls::{rustls::ServerConfig, TlsAcceptor};

#[derive(Debug, thiserror::Error)]
pub enum TlsLoadError {
    #[error("read pem material")]
    Io(#[from] std::io::Error),
    #[error("no private key found")]
    NoPrivateKey,
    #[error("build server config")]
    Config(#[source] tokio_rustls::rustls::Error),
}

/// Load a TLS acceptor from PEM-encoded certificate chain and private key files.
pub fn load_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor, TlsLoadError> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
        .collect::<Result<Vec<_>, _>>()?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
        .ok_or(TlsLoadError::NoPrivateKey)?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(TlsLoadError::Config)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}
