use std::{io, path::Path, str::FromStr, sync::Arc};

use tokio_util::sync::CancellationToken;
use tracing::info;

use roomcast_auth::LoginKey;
use roomcast_net::{load_acceptor, Filter, Inbound, Server, TlsLoadError};

use crate::{
    arbiter::Arbiter,
    config::{Config, InboundConfig},
    handlers::{self, AppState},
    rooms::{Dial, RoomManager},
    upstream,
};

/// The assembled relay: configuration plus the upstream dialer.
///
/// Construction is explicit so tests can swap the upstream implementation;
/// everything else is wired together inside [`Relay::serve`].
pub struct Relay {
    config: Config,
    dial: Arc<dyn Dial>,
}

#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error("no inbounds configured")]
    NoInbounds,
    #[error("unknown filter {filter:?} in inbound {name:?}")]
    UnknownFilter { name: String, filter: String },
    #[error("load tls material for inbound {name:?}")]
    Tls {
        name: String,
        #[source]
        source: TlsLoadError,
    },
    #[error("listen on {name:?} ({addr})")]
    Bind {
        name: String,
        addr: String,
        #[source]
        source: io::Error,
    },
}

impl Relay {
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            config,
            dial: Arc::new(upstream::Dialer::default()),
        }
    }

    /// Replace the upstream dialer.
    #[must_use]
    pub fn with_upstream(mut self, dial: Arc<dyn Dial>) -> Self {
        self.dial = dial;
        self
    }

    /// Bind all inbounds and serve until `shutdown` fires, then wait for
    /// every connection handler to drain.
    ///
    /// Returns an error without serving if the configuration is unusable or
    /// any listener fails to bind.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<(), ServeError> {
        if self.config.inbounds.is_empty() {
            return Err(ServeError::NoInbounds);
        }

        let mut inbounds = Vec::with_capacity(self.config.inbounds.len());
        for inbound in &self.config.inbounds {
            inbounds.push(bind_inbound(inbound).await?);
        }

        let (arbiter, driver) = Arbiter::channel(shutdown.clone());
        let rooms = RoomManager::new(arbiter.clone(), Arc::clone(&self.dial), shutdown.clone());
        tokio::spawn(driver.run(rooms));
        arbiter.start_flush_ticker();

        let state = Arc::new(AppState {
            arbiter,
            login_key: LoginKey::new(self.config.login_key.as_bytes()),
            shutdown: shutdown.clone(),
        });

        let mut server = Server::new(shutdown);
        let login_state = Arc::clone(&state);
        server.register("login", move |ctx| {
            handlers::login(Arc::clone(&login_state), ctx)
        });
        let logout_state = Arc::clone(&state);
        server.register("logout", move |ctx| {
            handlers::logout(Arc::clone(&logout_state), ctx)
        });
        let subscribe_state = Arc::clone(&state);
        server.register("subscribe", move |ctx| {
            handlers::subscribe(Arc::clone(&subscribe_state), ctx)
        });

        server.serve(inbounds).await;
        Ok(())
    }
}

async fn bind_inbound(config: &InboundConfig) -> Result<Inbound, ServeError> {
    let mut filters = Vec::with_capacity(config.filters.len());
    for name in &config.filters {
        filters.push(
            Filter::from_str(name).map_err(|_| ServeError::UnknownFilter {
                name: config.name.clone(),
                filter: name.clone(),
            })?,
        );
    }

    let tls = if filters.contains(&Filter::Tls) {
        let acceptor = load_acceptor(Path::new(&config.tls_pem), Path::new(&config.tls_key))
            .map_err(|source| ServeError::Tls {
                name: config.name.clone(),
                source,
            })?;
        Some(acceptor)
    } else {
        None
    };

    let inbound = Inbound::bind(&config.name, &config.addr, filters, tls)
        .await
        .map_err(|source| ServeError::Bind {
            name: config.name.clone(),
            addr: config.addr.clone(),
            source,
        })?;
    info!(name = %config.name, addr = %config.addr, "listening");
    Ok(inbound)
}
