pub use self::messages::{
    MsgLoginReq, MsgLoginRsp, MsgLogoutReq, MsgLogoutRsp, MsgSubscribeBatch, MsgSubscribeData,
    MsgSubscribeReq, MsgSubscribeRoom, MsgSubscribeRsp, MSG_TYPE_DATA, MSG_TYPE_ROOM_CONN_FAIL,
    MSG_TYPE_WS_CONNECT, MSG_TYPE_WS_DISCONNECT,
};

mod messages;
