use std::sync::Arc;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use roomcast_auth::LoginKey;
use roomcast_net::Context;
use roomcast_proto::{MsgLoginReq, MsgLoginRsp, MsgLogoutReq, MsgLogoutRsp, MsgSubscribeReq, MsgSubscribeRsp};

use crate::arbiter::{mailbox, Arbiter};

/// State shared by every RPC handler.
pub(crate) struct AppState {
    pub(crate) arbiter: Arbiter,
    pub(crate) login_key: LoginKey,
    pub(crate) shutdown: CancellationToken,
}

/// Allocate a subscriber, then push mailbox batches to the wire until the
/// mailbox closes or the connection dies. Always logs the subscriber out on
/// the way out.
pub(crate) async fn login(state: Arc<AppState>, mut ctx: Context) {
    let req: MsgLoginReq = match ctx.read_obj().await {
        Ok(req) => req,
        Err(err) => {
            warn!(%err, "read login request failed");
            return;
        }
    };

    let (sender, mut receiver) = mailbox();
    let Ok(sub_id) = state.arbiter.alloc_subscriber(sender).await else {
        // Interrupted by shutdown.
        return;
    };
    info!(client = %req.id, sub_id, "subscriber logged in");

    let serve = async {
        let rsp = MsgLoginRsp {
            sid: sub_id,
            sec: Bytes::from(state.login_key.derive(sub_id)),
        };
        if let Err(err) = ctx.write_obj(&rsp).await {
            warn!(%err, "send login response failed");
            return;
        }

        while let Some(batch) = receiver.recv().await {
            if let Err(err) = ctx.write_obj(&batch).await {
                warn!(client = %req.id, %err, "send batch failed");
                return;
            }
        }
    };
    tokio::select! {
        () = state.shutdown.cancelled() => {}
        () = serve => {}
    }

    state.arbiter.logout(sub_id).await;
}

pub(crate) async fn logout(state: Arc<AppState>, mut ctx: Context) {
    let req: MsgLogoutReq = match ctx.read_obj().await {
        Ok(req) => req,
        Err(err) => {
            warn!(%err, "read logout request failed");
            return;
        }
    };

    let mut rsp = MsgLogoutRsp {
        ok: true,
        msg: String::new(),
    };
    if !state.login_key.verify(req.sid, &req.sec) {
        warn!(sub_id = req.sid, "logout failed: secret check failed");
        rsp.ok = false;
        rsp.msg = "logout failed: secret check failed".to_owned();
    }

    if rsp.ok {
        state.arbiter.logout(req.sid).await;
    }

    if let Err(err) = ctx.write_obj(&rsp).await {
        warn!(%err, "send logout response failed");
    }
}

pub(crate) async fn subscribe(state: Arc<AppState>, mut ctx: Context) {
    let req: MsgSubscribeReq = match ctx.read_obj().await {
        Ok(req) => req,
        Err(err) => {
            warn!(%err, "read subscribe request failed");
            return;
        }
    };

    if !state.login_key.verify(req.sid, &req.sec) {
        warn!(sub_id = req.sid, "subscribe failed: secret check failed");
        let _ = ctx
            .write_obj(&MsgSubscribeRsp {
                ok: false,
                msg: "secret check failed".to_owned(),
            })
            .await;
        return;
    }

    // Replace the subscription set wholesale: clear synchronously, then
    // register the requested rooms.
    if state.arbiter.clear_subscriptions(req.sid).await.is_ok() {
        for room in req.rooms {
            state
                .arbiter
                .subscribe_room(room.room_id, req.sid, room.cmds)
                .await;
        }
    }

    if let Err(err) = ctx
        .write_obj(&MsgSubscribeRsp {
            ok: true,
            msg: String::new(),
        })
        .await
    {
        warn!(%err, "send subscribe response failed");
    }
}
