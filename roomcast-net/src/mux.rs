use std::{collections::VecDeque, future, io, task::Poll};

use tokio::sync::{mpsc, oneshot};
use tokio_util::compat::{Compat, FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt};
use yamux::{Config, Connection, Mode};

use crate::io::BoxedIo;

pub(crate) type MuxStream = Compat<yamux::Stream>;

/// Accept inbound multiplexed streams over `io` until the connection dies,
/// handing each stream to `accepted`.
pub(crate) async fn serve(io: BoxedIo, accepted: mpsc::Sender<MuxStream>) {
    let mut conn = Connection::new(io.compat(), Config::default(), Mode::Server);
    loop {
        match future::poll_fn(|cx| conn.poll_next_inbound(cx)).await {
            Some(Ok(stream)) => {
                if accepted.send(stream.compat()).await.is_err() {
                    break;
                }
            }
            Some(Err(_)) | None => break,
        }
    }
}

type OpenReply = oneshot::Sender<io::Result<MuxStream>>;

/// Client end of a multiplexed connection. Streams are opened through a
/// driver task that owns the connection and keeps its IO moving.
#[derive(Debug, Clone)]
pub(crate) struct MuxClient {
    opens: mpsc::Sender<OpenReply>,
}

impl MuxClient {
    pub(crate) fn new(io: BoxedIo) -> Self {
        let (opens, requests) = mpsc::channel(16);
        tokio::spawn(drive(io, requests));
        Self { opens }
    }

    /// Whether the underlying connection has terminated.
    pub(crate) fn is_closed(&self) -> bool {
        self.opens.is_closed()
    }

    /// Open a new outbound stream.
    pub(crate) async fn open(&self) -> io::Result<MuxStream> {
        let (reply, result) = oneshot::channel();
        self.opens
            .send(reply)
            .await
            .map_err(|_| broken_pipe())?;
        result.await.map_err(|_| broken_pipe())?
    }
}

async fn drive(io: BoxedIo, mut requests: mpsc::Receiver<OpenReply>) {
    let mut conn = Connection::new(io.compat(), Config::default(), Mode::Client);
    let mut pending: VecDeque<OpenReply> = VecDeque::new();
    let mut requests_done = false;

    future::poll_fn(|cx| {
        while !requests_done {
            match requests.poll_recv(cx) {
                Poll::Ready(Some(reply)) => pending.push_back(reply),
                Poll::Ready(None) => requests_done = true,
                Poll::Pending => break,
            }
        }

        while !pending.is_empty() {
            match conn.poll_new_outbound(cx) {
                Poll::Ready(Ok(stream)) => {
                    if let Some(reply) = pending.pop_front() {
                        let _ = reply.send(Ok(stream.compat()));
                    }
                }
                Poll::Ready(Err(_)) => {
                    for reply in pending.drain(..) {
                        let _ = reply.send(Err(broken_pipe()));
                    }
                    return Poll::Ready(());
                }
                Poll::Pending => break,
            }
        }

        // Drive connection IO. The server does not open streams towards us,
        // so any inbound stream is dropped on arrival.
        loop {
            match conn.poll_next_inbound(cx) {
                Poll::Ready(Some(Ok(_stream))) => {}
                Poll::Ready(Some(Err(_)) | None) => return Poll::Ready(()),
                Poll::Pending => return Poll::Pending,
            }
        }
    })
    .await;
}

fn broken_pipe() -> io::Error {
    io::ErrorKind::BrokenPipe.into()
}
