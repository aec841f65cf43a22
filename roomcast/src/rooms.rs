use std::{collections::HashMap, sync::Arc, time::Duration};

use arc_swap::ArcSwap;
use bytes::Bytes;
use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use roomcast_proto::{MSG_TYPE_ROOM_CONN_FAIL, MSG_TYPE_WS_CONNECT, MSG_TYPE_WS_DISCONNECT};

use crate::arbiter::Arbiter;
use crate::upstream::{RoomInfo, UpstreamError};

const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_CAP: Duration = Duration::from_secs(30);

/// A live upstream room connection handed back by a [`Dial`] implementation.
pub struct RoomConn {
    /// Current room metadata, updated by the connection as state changes
    /// arrive.
    pub info: Arc<ArcSwap<RoomInfo>>,
    pub events: mpsc::Receiver<RoomEvent>,
}

#[derive(Debug)]
pub enum RoomEvent {
    /// A command-tagged event body from the room.
    Message { cmd: String, payload: Bytes },
    /// The room's live state flipped; current metadata is in [`RoomConn::info`].
    StateChange { cmd: String },
    /// The connection died.
    Closed { error: UpstreamError },
}

/// Opens upstream room connections.
///
/// Implemented by [`crate::upstream::Dialer`] for the real chat service and
/// by mocks in tests.
pub trait Dial: Send + Sync + 'static {
    fn dial(&self, room_id: i64) -> BoxFuture<'static, Result<RoomConn, UpstreamError>>;
}

/// Keeps at most one upstream client per room and surfaces its lifecycle to
/// the arbiter as synthetic subscriber events.
#[derive(Clone)]
pub(crate) struct RoomManager {
    inner: Arc<Inner>,
}

struct Inner {
    arbiter: Arbiter,
    dial: Arc<dyn Dial>,
    shutdown: CancellationToken,
    rooms: Mutex<HashMap<i64, RoomState>>,
}

enum RoomState {
    /// Placeholder while a dial or reconnect is in flight.
    Connecting,
    Connected(Arc<ArcSwap<RoomInfo>>),
}

impl RoomManager {
    pub(crate) fn new(arbiter: Arbiter, dial: Arc<dyn Dial>, shutdown: CancellationToken) -> Self {
        Self {
            inner: Arc::new(Inner {
                arbiter,
                dial,
                shutdown,
                rooms: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Make sure an upstream client exists for `room_id`.
    ///
    /// Idempotent: a room already connecting is left alone, and a room
    /// already connected only produces a connect notice targeted at the
    /// requesting subscriber so a late joiner sees the current room info.
    pub(crate) async fn ensure(&self, room_id: i64, sub_id: u32) {
        let mut rooms = self.inner.rooms.lock().await;
        match rooms.get(&room_id) {
            Some(RoomState::Connected(room_info)) => {
                self.inner
                    .arbiter
                    .room_state(
                        room_id,
                        MSG_TYPE_WS_CONNECT,
                        Some(info_json(room_info)),
                        vec![sub_id],
                    )
                    .await;
            }
            Some(RoomState::Connecting) => {}
            None => {
                rooms.insert(room_id, RoomState::Connecting);
                drop(rooms);

                let this = self.clone();
                tokio::spawn(async move {
                    let dialed = this.inner.dial.dial(room_id).await;
                    this.dial_finished(room_id, dialed).await;
                });
            }
        }
    }

    async fn dial_finished(&self, room_id: i64, dialed: Result<RoomConn, UpstreamError>) {
        match dialed {
            Ok(conn) => self.attach(room_id, conn).await,
            Err(error) => {
                warn!(room_id, %error, "upstream dial failed");
                let mut rooms = self.inner.rooms.lock().await;
                rooms.remove(&room_id);
                self.inner
                    .arbiter
                    .room_state(room_id, MSG_TYPE_ROOM_CONN_FAIL, None, Vec::new())
                    .await;
            }
        }
    }

    fn attach(&self, room_id: i64, conn: RoomConn) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let RoomConn { info, events } = conn;
            {
                let mut rooms = self.inner.rooms.lock().await;
                rooms.insert(room_id, RoomState::Connected(Arc::clone(&info)));
                self.inner
                    .arbiter
                    .room_state(
                        room_id,
                        MSG_TYPE_WS_CONNECT,
                        Some(info_json(&info)),
                        Vec::new(),
                    )
                    .await;
            }

            let this = self.clone();
            tokio::spawn(this.pump(room_id, info, events));
        })
    }

    /// Forward room events to the arbiter until the connection dies.
    async fn pump(
        self,
        room_id: i64,
        info: Arc<ArcSwap<RoomInfo>>,
        mut events: mpsc::Receiver<RoomEvent>,
    ) {
        loop {
            match events.recv().await {
                Some(RoomEvent::Message { cmd, payload }) => {
                    self.inner
                        .arbiter
                        .room_data(room_id, cmd, payload, true)
                        .await;
                }
                Some(RoomEvent::StateChange { cmd }) => {
                    self.inner
                        .arbiter
                        .room_data(room_id, cmd, info_json(&info), false)
                        .await;
                }
                Some(RoomEvent::Closed { error }) => {
                    self.disconnected(room_id, &info, &error).await;
                    return;
                }
                None => {
                    self.disconnected(room_id, &info, &UpstreamError::Closed)
                        .await;
                    return;
                }
            }
        }
    }

    async fn disconnected(
        &self,
        room_id: i64,
        info: &Arc<ArcSwap<RoomInfo>>,
        error: &UpstreamError,
    ) {
        warn!(room_id, %error, "upstream connection interrupted");

        let mut rooms = self.inner.rooms.lock().await;
        self.inner
            .arbiter
            .room_state(
                room_id,
                MSG_TYPE_WS_DISCONNECT,
                Some(info_json(info)),
                Vec::new(),
            )
            .await;
        rooms.insert(room_id, RoomState::Connecting);
        drop(rooms);

        let this = self.clone();
        tokio::spawn(async move {
            this.reconnect(room_id).await;
        });
    }

    async fn reconnect(self, room_id: i64) {
        info!(room_id, "reconnecting upstream room");
        let mut backoff = Backoff::new();
        loop {
            let dialed = tokio::select! {
                () = self.inner.shutdown.cancelled() => return,
                dialed = self.inner.dial.dial(room_id) => dialed,
            };

            match dialed {
                Ok(conn) => {
                    self.attach(room_id, conn).await;
                    return;
                }
                Err(error) => {
                    let wait = backoff.next_delay();
                    warn!(room_id, %error, ?wait, "reconnect attempt failed");
                    tokio::select! {
                        () = self.inner.shutdown.cancelled() => return,
                        () = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }
    }
}

fn info_json(info: &Arc<ArcSwap<RoomInfo>>) -> Bytes {
    Bytes::from(serde_json::to_vec(&**info.load()).unwrap_or_default())
}

/// Reconnect backoff: 1 s doubling to a 30 s cap.
#[derive(Debug)]
struct Backoff {
    next: Duration,
}

impl Backoff {
    fn new() -> Self {
        Self {
            next: RECONNECT_BASE,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(RECONNECT_CAP);
        delay
    }
}
