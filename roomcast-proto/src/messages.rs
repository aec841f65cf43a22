use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Raw upstream event body forwarded to a subscriber.
pub const MSG_TYPE_DATA: u8 = 0;
/// The room's upstream connection was established.
pub const MSG_TYPE_WS_CONNECT: u8 = 1;
/// The room's upstream connection was lost.
pub const MSG_TYPE_WS_DISCONNECT: u8 = 2;
/// Dialing the room's upstream connection failed.
pub const MSG_TYPE_ROOM_CONN_FAIL: u8 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgLoginReq {
    #[serde(rename = "id")]
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgLoginRsp {
    #[serde(rename = "sid")]
    pub sid: u32,
    #[serde(rename = "sec")]
    pub sec: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgLogoutReq {
    #[serde(rename = "sid")]
    pub sid: u32,
    #[serde(rename = "sec")]
    pub sec: Bytes,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgLogoutRsp {
    #[serde(rename = "ok")]
    pub ok: bool,
    #[serde(rename = "msg")]
    pub msg: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgSubscribeReq {
    #[serde(rename = "sid")]
    pub sid: u32,
    #[serde(rename = "sec")]
    pub sec: Bytes,
    #[serde(rename = "rooms")]
    pub rooms: Vec<MsgSubscribeRoom>,
}

/// One room's worth of interests in a subscribe request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgSubscribeRoom {
    #[serde(rename = "room")]
    pub room_id: i64,
    #[serde(rename = "cmds")]
    pub cmds: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgSubscribeRsp {
    #[serde(rename = "ok")]
    pub ok: bool,
    #[serde(rename = "msg")]
    pub msg: String,
}

/// An ordered group of per-event records delivered as one framed wire message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgSubscribeBatch {
    #[serde(rename = "msgs")]
    pub msgs: Vec<MsgSubscribeData>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgSubscribeData {
    #[serde(rename = "room")]
    pub room_id: i64,
    #[serde(rename = "type")]
    pub msg_type: u8,
    #[serde(rename = "cmd")]
    pub cmd: String,
    #[serde(rename = "data")]
    pub data: Bytes,
}

impl MsgSubscribeBatch {
    /// Append `other`'s records after this batch's, preserving order.
    ///
    /// The payload buffers are shared, not copied; they are treated as
    /// immutable once enqueued.
    pub fn combine_with(&mut self, other: &MsgSubscribeBatch) {
        self.msgs.extend_from_slice(&other.msgs);
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use claims::assert_ok;

    use super::{MsgLoginRsp, MsgSubscribeBatch, MsgSubscribeData, MSG_TYPE_DATA};

    fn data(cmd: &str, payload: &'static [u8]) -> MsgSubscribeData {
        MsgSubscribeData {
            room_id: 7,
            msg_type: MSG_TYPE_DATA,
            cmd: cmd.to_owned(),
            data: Bytes::from_static(payload),
        }
    }

    #[test]
    fn combine_preserves_order() {
        let mut batch = MsgSubscribeBatch {
            msgs: vec![data("A", b"1")],
        };
        let other = MsgSubscribeBatch {
            msgs: vec![data("B", b"2"), data("C", b"3")],
        };

        batch.combine_with(&other);
        assert_eq!(
            vec!["A", "B", "C"],
            batch.msgs.iter().map(|m| m.cmd.as_str()).collect::<Vec<_>>()
        );
    }

    #[test]
    fn clone_shares_payload_buffers() {
        let batch = MsgSubscribeBatch {
            msgs: vec![data("A", b"payload")],
        };
        let cloned = batch.clone();

        assert_eq!(
            batch.msgs[0].data.as_ptr(),
            cloned.msgs[0].data.as_ptr(),
            "payload buffers must be shared between clones"
        );
    }

    #[test]
    fn wire_encoding_uses_field_tags() {
        let rsp = MsgLoginRsp {
            sid: 42,
            sec: Bytes::from_static(b"\x01\x02"),
        };

        let encoded = assert_ok!(rmp_serde::to_vec_named(&rsp));
        let text = String::from_utf8_lossy(&encoded);
        assert!(text.contains("sid"));
        assert!(text.contains("sec"));

        let decoded: MsgLoginRsp = assert_ok!(rmp_serde::from_slice(&encoded));
        assert_eq!(rsp, decoded);
    }

    #[test]
    fn batch_round_trips_through_messagepack() {
        let batch = MsgSubscribeBatch {
            msgs: vec![data("DANMU_MSG", b"{\"cmd\":\"DANMU_MSG\"}")],
        };

        let encoded = assert_ok!(rmp_serde::to_vec_named(&batch));
        let decoded: MsgSubscribeBatch = assert_ok!(rmp_serde::from_slice(&encoded));
        assert_eq!(batch, decoded);
    }
}
