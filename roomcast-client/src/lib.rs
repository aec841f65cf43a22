use std::collections::HashMap;

use bytes::Bytes;
use serde::Serialize;
use serde_json::value::RawValue;

use roomcast_net::{Context, DialError, Dialer, FrameError};
use roomcast_proto::{
    MsgLoginReq, MsgLoginRsp, MsgLogoutReq, MsgLogoutRsp, MsgSubscribeData, MsgSubscribeReq,
    MsgSubscribeRoom, MsgSubscribeRsp,
};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("dial")]
    Dial(#[from] DialError),
    #[error("frame")]
    Frame(#[from] FrameError),
    /// The relay answered `ok = false`.
    #[error("request rejected: {0}")]
    Rejected(String),
}

/// A downstream client of the roomcast relay.
///
/// `login` keeps its connection open and yields every batch the relay pushes;
/// `subscribe` and `logout` are short request/response calls authenticated by
/// the secret received at login.
#[derive(Debug)]
pub struct RelayClient {
    name: String,
    dialer: Dialer,
    sid: u32,
    secret: Bytes,
}

impl RelayClient {
    #[must_use]
    pub fn new(name: impl Into<String>, dialer: Dialer) -> Self {
        Self {
            name: name.into(),
            dialer,
            sid: 0,
            secret: Bytes::new(),
        }
    }

    /// The subscriber id allocated at login.
    #[must_use]
    pub fn subscriber_id(&self) -> u32 {
        self.sid
    }

    /// Log in and return the connection batches will be pushed over.
    pub async fn login(&mut self) -> Result<Context, ClientError> {
        let mut ctx = self
            .call(
                "login",
                &MsgLoginReq {
                    id: self.name.clone(),
                },
            )
            .await?;

        let rsp: MsgLoginRsp = ctx.read_obj().await?;
        self.sid = rsp.sid;
        self.secret = rsp.sec;
        Ok(ctx)
    }

    /// Replace this subscriber's room interests wholesale.
    pub async fn subscribe(&self, rooms: Vec<MsgSubscribeRoom>) -> Result<(), ClientError> {
        let mut ctx = self
            .call(
                "subscribe",
                &MsgSubscribeReq {
                    sid: self.sid,
                    sec: self.secret.clone(),
                    rooms,
                },
            )
            .await?;

        let rsp: MsgSubscribeRsp = ctx.read_obj().await?;
        if rsp.ok {
            Ok(())
        } else {
            Err(ClientError::Rejected(rsp.msg))
        }
    }

    pub async fn logout(&self) -> Result<(), ClientError> {
        let mut ctx = self
            .call(
                "logout",
                &MsgLogoutReq {
                    sid: self.sid,
                    sec: self.secret.clone(),
                },
            )
            .await?;

        let rsp: MsgLogoutRsp = ctx.read_obj().await?;
        if rsp.ok {
            Ok(())
        } else {
            Err(ClientError::Rejected(rsp.msg))
        }
    }

    /// Read the next pushed batch from the login connection.
    ///
    /// Returns `None` once the relay closes the connection.
    pub async fn read_batch(
        ctx: &mut Context,
    ) -> Result<Option<Vec<MsgSubscribeData>>, ClientError> {
        match ctx.read_obj::<roomcast_proto::MsgSubscribeBatch>().await {
            Ok(batch) => Ok(Some(batch.msgs)),
            Err(err) if err.is_closed() => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Extract the raw bytes of a top-level field from a JSON payload.
    #[must_use]
    pub fn json_field(data: &[u8], key: &str) -> Option<Vec<u8>> {
        let fields: HashMap<&str, &RawValue> = serde_json::from_slice(data).ok()?;
        fields.get(key).map(|raw| raw.get().as_bytes().to_vec())
    }

    async fn call<T: Serialize>(&self, method: &str, req: &T) -> Result<Context, ClientError> {
        let mut ctx = self.dialer.connect().await?;
        ctx.write_obj(&method).await?;
        ctx.write_obj(req).await?;
        Ok(ctx)
    }
}
