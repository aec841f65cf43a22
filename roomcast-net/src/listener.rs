use std::{io, net::SocketAddr};

use futures_util::future::BoxFuture;
use tokio::{net::TcpListener, sync::mpsc};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{brotli, filter::Filter, io::BoxedIo, mux, reverse::BitReverse};

/// A bound listener plus the filter chain applied to each accepted connection.
pub struct Inbound {
    name: String,
    listener: TcpListener,
    filters: Vec<Filter>,
    tls: Option<TlsAcceptor>,
}

impl Inbound {
    /// Bind a TCP listener on `addr`. The `tls` acceptor must be present iff
    /// `filters` contains [`Filter::Tls`].
    pub async fn bind(
        name: &str,
        addr: &str,
        filters: Vec<Filter>,
        tls: Option<TlsAcceptor>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            name: name.to_owned(),
            listener,
            filters,
            tls,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` fires, sending fully filtered
    /// streams to `conns`.
    pub(crate) async fn accept_loop(self, conns: mpsc::Sender<BoxedIo>, shutdown: CancellationToken) {
        loop {
            let stream = tokio::select! {
                () = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _peer)) => stream,
                    Err(err) => {
                        warn!(listener = %self.name, %err, "accept failed");
                        continue;
                    }
                },
            };
            let _ = stream.set_nodelay(true);

            tokio::spawn(apply_filters(
                Box::new(stream) as BoxedIo,
                self.filters.clone(),
                self.tls.clone(),
                conns.clone(),
            ));
        }
    }
}

fn apply_filters(
    io: BoxedIo,
    filters: Vec<Filter>,
    tls: Option<TlsAcceptor>,
    conns: mpsc::Sender<BoxedIo>,
) -> BoxFuture<'static, ()> {
    // Boxed because the multiplex arm recurses for every accepted stream.
    Box::pin(async move {
        let mut io = io;
        for (idx, filter) in filters.iter().enumerate() {
            match filter {
                Filter::Reverse => io = Box::new(BitReverse::new(io)),
                Filter::Brotli => io = brotli::duplex(io),
                Filter::Tls => {
                    let Some(acceptor) = tls.clone() else {
                        warn!("tls filter configured without certificate material");
                        return;
                    };
                    match acceptor.accept(io).await {
                        Ok(accepted) => io = Box::new(accepted),
                        Err(err) => {
                            debug!(%err, "tls handshake failed");
                            return;
                        }
                    }
                }
                Filter::Multiplex => {
                    // The connection outlives shutdown so open streams can
                    // finish cleanly; it ends when the peer goes away.
                    let rest = filters[idx + 1..].to_vec();
                    let (streams_tx, mut streams_rx) = mpsc::channel(16);

                    let fanout = async {
                        while let Some(stream) = streams_rx.recv().await {
                            tokio::spawn(apply_filters(
                                Box::new(stream) as BoxedIo,
                                rest.clone(),
                                tls.clone(),
                                conns.clone(),
                            ));
                        }
                    };
                    tokio::join!(mux::serve(io, streams_tx), fanout);
                    return;
                }
            }
        }
        let _ = conns.send(io).await;
    })
}
