//! WebSocket client for the upstream live-chat service.

use std::{io, sync::Arc};

use arc_swap::ArcSwap;
use futures_util::{future::BoxFuture, SinkExt, StreamExt};
use http::Uri;
use rustls_platform_verifier::Verifier;
use serde::{Deserialize, Serialize};
use tokio::{net::TcpStream, sync::mpsc, time};
use tokio_rustls::{
    rustls::{self, pki_types::ServerName, ClientConfig},
    TlsConnector,
};
use tokio_websockets::{ClientBuilder, Message, WebSocketStream};
use tracing::debug;

use roomcast_net::BoxedIo;

use crate::rooms::{Dial, RoomConn, RoomEvent};

pub use self::wire::{WireError, CMD_LIVE, CMD_PREPARING};

pub(crate) mod wire;

const DEFAULT_ENDPOINT: &str = "wss://broadcastlv.chat.bilibili.com/sub";
const HEARTBEAT_INTERVAL: time::Duration = time::Duration::from_secs(30);
const EVENT_BUF: usize = 64;

/// Metadata of an upstream room, re-serialized as JSON into connection
/// state-change batches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomInfo {
    pub room_id: i64,
    /// 1 while the room is live, 0 otherwise.
    pub live_status: u8,
}

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("invalid upstream endpoint")]
    BadEndpoint,
    #[error("io")]
    Io(#[from] io::Error),
    #[error("malformed upstream frame")]
    Wire(#[from] wire::WireError),
    #[error("connection closed by upstream")]
    Closed,
}

/// Dials the real upstream chat service.
#[derive(Debug, Clone)]
pub struct Dialer {
    endpoint: Uri,
}

impl Dialer {
    #[must_use]
    pub fn new(endpoint: Uri) -> Self {
        Self { endpoint }
    }
}

impl Default for Dialer {
    fn default() -> Self {
        Self::new(Uri::from_static(DEFAULT_ENDPOINT))
    }
}

impl Dial for Dialer {
    fn dial(&self, room_id: i64) -> BoxFuture<'static, Result<RoomConn, UpstreamError>> {
        let endpoint = self.endpoint.clone();
        Box::pin(async move { connect(endpoint, room_id).await })
    }
}

async fn connect(endpoint: Uri, room_id: i64) -> Result<RoomConn, UpstreamError> {
    let host = endpoint
        .host()
        .ok_or(UpstreamError::BadEndpoint)?
        .to_owned();
    let secure = matches!(endpoint.scheme_str(), Some("wss" | "https"));
    let port = endpoint.port_u16().unwrap_or(if secure { 443 } else { 80 });

    let tcp = TcpStream::connect((host.as_str(), port)).await?;
    let io: BoxedIo = if secure {
        let name =
            ServerName::try_from(host.clone()).map_err(|_| UpstreamError::BadEndpoint)?;
        Box::new(tls_connector().connect(name, tcp).await?)
    } else {
        Box::new(tcp)
    };

    let (mut socket, _response) = ClientBuilder::from_uri(endpoint)
        .connect_on(io)
        .await
        .map_err(|err| UpstreamError::Io(websockets_error_to_io(err)))?;

    let join = serde_json::json!({
        "uid": 0,
        "roomid": room_id,
        "protover": 3,
        "platform": "web",
        "type": 2,
    });
    let body = serde_json::to_vec(&join).unwrap_or_default();
    socket
        .send(Message::binary(wire::encode(wire::OP_JOIN, &body)))
        .await
        .map_err(|err| UpstreamError::Io(websockets_error_to_io(err)))?;

    let info = Arc::new(ArcSwap::from_pointee(RoomInfo {
        room_id,
        live_status: 0,
    }));
    let (events_tx, events_rx) = mpsc::channel(EVENT_BUF);
    tokio::spawn(run(socket, room_id, Arc::clone(&info), events_tx));

    Ok(RoomConn {
        info,
        events: events_rx,
    })
}

/// Pump the connection: heartbeats out, frames in, events to the manager.
async fn run(
    mut socket: WebSocketStream<BoxedIo>,
    room_id: i64,
    info: Arc<ArcSwap<RoomInfo>>,
    events: mpsc::Sender<RoomEvent>,
) {
    let mut heartbeat = time::interval(HEARTBEAT_INTERVAL);
    heartbeat.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                let ping = Message::binary(wire::encode(wire::OP_HEARTBEAT, b""));
                if let Err(err) = socket.send(ping).await {
                    let error = UpstreamError::Io(websockets_error_to_io(err));
                    let _ = events.send(RoomEvent::Closed { error }).await;
                    return;
                }
            }
            incoming = socket.next() => match incoming {
                Some(Ok(message)) if message.is_binary() => {
                    let frames = match wire::decode(message.into_payload().into()) {
                        Ok(frames) => frames,
                        Err(err) => {
                            let _ = events.send(RoomEvent::Closed { error: err.into() }).await;
                            return;
                        }
                    };
                    for frame in frames {
                        if !handle_frame(frame, room_id, &info, &events).await {
                            return;
                        }
                    }
                }
                Some(Ok(_message)) => {}
                Some(Err(err)) => {
                    let error = UpstreamError::Io(websockets_error_to_io(err));
                    let _ = events.send(RoomEvent::Closed { error }).await;
                    return;
                }
                None => {
                    let _ = events.send(RoomEvent::Closed { error: UpstreamError::Closed }).await;
                    return;
                }
            }
        }
    }
}

async fn handle_frame(
    frame: wire::Frame,
    room_id: i64,
    info: &Arc<ArcSwap<RoomInfo>>,
    events: &mpsc::Sender<RoomEvent>,
) -> bool {
    match frame.opcode {
        wire::OP_SEND_MSG_REPLY => {
            let Some(cmd) = wire::command_tag(&frame.body) else {
                return true;
            };
            if cmd == CMD_LIVE || cmd == CMD_PREPARING {
                info.store(Arc::new(RoomInfo {
                    room_id,
                    live_status: u8::from(cmd == CMD_LIVE),
                }));
                events.send(RoomEvent::StateChange { cmd }).await.is_ok()
            } else {
                events
                    .send(RoomEvent::Message {
                        cmd,
                        payload: frame.body,
                    })
                    .await
                    .is_ok()
            }
        }
        wire::OP_JOIN_REPLY => {
            debug!(room_id, "joined upstream room");
            true
        }
        wire::OP_HEARTBEAT_REPLY => true,
        _ => true,
    }
}

fn tls_connector() -> TlsConnector {
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    TlsConnector::from(Arc::new(
        ClientConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()
            .expect("the default provider supports the default protocol versions")
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(Verifier::new().with_provider(provider)))
            .with_no_client_auth(),
    ))
}

fn websockets_error_to_io(err: tokio_websockets::Error) -> io::Error {
    match err {
        tokio_websockets::Error::Io(err) => err,
        err => io::Error::new(io::ErrorKind::Other, err),
    }
}

#[cfg(test)]
mod tests {
    use super::RoomInfo;

    #[test]
    fn room_info_serializes_for_state_batches() {
        let info = RoomInfo {
            room_id: 22_865_391,
            live_status: 1,
        };
        let json = serde_json::to_string(&info).unwrap();
        assert_eq!(r#"{"room_id":22865391,"live_status":1}"#, json);

        let decoded: RoomInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(info, decoded);
    }
}
