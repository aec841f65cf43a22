use std::{io, sync::Arc};

use rustls_platform_verifier::Verifier;
use tokio::{net::TcpStream, sync::Mutex};
use tokio_rustls::{
    rustls::{
        self,
        client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
        crypto::CryptoProvider,
        pki_types::{CertificateDer, ServerName, UnixTime},
        ClientConfig, DigitallySignedStruct, SignatureScheme,
    },
    TlsConnector,
};

use crate::{
    brotli,
    context::Context,
    filter::Filter,
    io::BoxedIo,
    mux::MuxClient,
    reverse::BitReverse,
};

/// Client-side counterpart of an inbound's filter chain.
///
/// With a `multiplex` filter configured, one underlying connection is shared
/// and every [`Dialer::connect`] opens a new stream on it; otherwise each
/// call dials a fresh TCP connection.
#[derive(Debug)]
pub struct Dialer {
    addr: String,
    filters: Vec<Filter>,
    tls: Option<DialerTls>,
    mux: Mutex<Option<MuxClient>>,
}

/// TLS parameters for a [`Filter::Tls`] stage on the dialer side.
#[derive(Debug, Clone)]
pub struct DialerTls {
    pub server_name: String,
    /// Skip certificate verification. Only for endpoints with self-signed
    /// certificates.
    pub insecure: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum DialError {
    #[error("io")]
    Io(#[from] io::Error),
    #[error("invalid tls server name")]
    ServerName,
    #[error("tls filter configured without tls parameters")]
    MissingTls,
    #[error("multiplex filter may appear at most once")]
    NestedMultiplex,
}

impl Dialer {
    #[must_use]
    pub fn new(addr: impl Into<String>, filters: Vec<Filter>, tls: Option<DialerTls>) -> Self {
        Self {
            addr: addr.into(),
            filters,
            tls,
            mux: Mutex::new(None),
        }
    }

    /// Establish one logical connection through the filter chain.
    pub async fn connect(&self) -> Result<Context, DialError> {
        Ok(Context::new(self.establish().await?))
    }

    async fn establish(&self) -> Result<BoxedIo, DialError> {
        match self.filters.iter().position(|f| *f == Filter::Multiplex) {
            None => {
                let tcp = TcpStream::connect(&self.addr).await?;
                self.wrap(Box::new(tcp), &self.filters).await
            }
            Some(pos) => {
                let stream = self.open_mux_stream(pos).await?;
                self.wrap(stream, &self.filters[pos + 1..]).await
            }
        }
    }

    async fn open_mux_stream(&self, pos: usize) -> Result<BoxedIo, DialError> {
        let mut shared = self.mux.lock().await;
        if let Some(client) = shared.as_ref() {
            if !client.is_closed() {
                if let Ok(stream) = client.open().await {
                    return Ok(Box::new(stream));
                }
            }
        }

        let tcp = TcpStream::connect(&self.addr).await?;
        let io = self.wrap(Box::new(tcp), &self.filters[..pos]).await?;
        let client = MuxClient::new(io);
        let stream = client.open().await?;
        *shared = Some(client);
        Ok(Box::new(stream))
    }

    async fn wrap(&self, io: BoxedIo, filters: &[Filter]) -> Result<BoxedIo, DialError> {
        let mut io = io;
        for filter in filters {
            io = match filter {
                Filter::Reverse => Box::new(BitReverse::new(io)),
                Filter::Brotli => brotli::duplex(io),
                Filter::Multiplex => return Err(DialError::NestedMultiplex),
                Filter::Tls => {
                    let tls = self.tls.as_ref().ok_or(DialError::MissingTls)?;
                    let name = ServerName::try_from(tls.server_name.clone())
                        .map_err(|_| DialError::ServerName)?;
                    let connector = TlsConnector::from(Arc::new(client_config(tls.insecure)));
                    Box::new(connector.connect(name, io).await?)
                }
            };
        }
        Ok(io)
    }
}

fn client_config(insecure: bool) -> ClientConfig {
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .expect("the default provider supports the default protocol versions")
        .dangerous();

    if insecure {
        builder
            .with_custom_certificate_verifier(Arc::new(InsecureVerifier(provider)))
            .with_no_client_auth()
    } else {
        builder
            .with_custom_certificate_verifier(Arc::new(Verifier::new().with_provider(provider)))
            .with_no_client_auth()
    }
}

#[derive(Debug)]
struct InsecureVerifier(Arc<CryptoProvider>);

impl ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
