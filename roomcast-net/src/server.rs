use std::{collections::HashMap, future::Future, sync::Arc};

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, warn};

use crate::{context::Context, io::BoxedIo, listener::Inbound};

const CONN_BACKLOG: usize = 64;

type Handler = Arc<dyn Fn(Context) -> BoxFuture<'static, ()> + Send + Sync>;

/// Method-dispatch RPC server over a set of inbound listeners.
///
/// Every connection starts with a method-name frame; the registered handler
/// for that method owns the connection from then on. Connection handlers are
/// tracked so [`Server::serve`] only returns once all of them have drained.
pub struct Server {
    handlers: HashMap<String, Handler>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Server {
    #[must_use]
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            handlers: HashMap::new(),
            shutdown,
            tracker: TaskTracker::new(),
        }
    }

    pub fn register<F, Fut>(&mut self, method: &str, handler: F)
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handlers
            .insert(method.to_owned(), Arc::new(move |ctx| Box::pin(handler(ctx))));
    }

    /// Serve until the shutdown token fires, then wait for every connection
    /// handler to finish.
    pub async fn serve(self, inbounds: Vec<Inbound>) {
        let (conns_tx, mut conns_rx) = mpsc::channel(CONN_BACKLOG);
        for inbound in inbounds {
            tokio::spawn(inbound.accept_loop(conns_tx.clone(), self.shutdown.clone()));
        }
        drop(conns_tx);

        let handlers = Arc::new(self.handlers);
        loop {
            let io = tokio::select! {
                () = self.shutdown.cancelled() => break,
                io = conns_rx.recv() => match io {
                    Some(io) => io,
                    None => break,
                },
            };
            self.tracker.spawn(dispatch(
                io,
                Arc::clone(&handlers),
                self.shutdown.clone(),
            ));
        }

        self.tracker.close();
        self.tracker.wait().await;
    }
}

async fn dispatch(io: BoxedIo, handlers: Arc<HashMap<String, Handler>>, shutdown: CancellationToken) {
    let mut ctx = Context::new(io);
    let method: String = tokio::select! {
        () = shutdown.cancelled() => return,
        method = ctx.read_obj() => match method {
            Ok(method) => method,
            Err(err) => {
                debug!(%err, "read method frame failed");
                return;
            }
        },
    };

    match handlers.get(&method) {
        Some(handler) => handler(ctx).await,
        None => warn!(%method, "unknown method"),
    }
}
