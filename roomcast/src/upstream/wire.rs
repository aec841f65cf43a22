//! Binary frame layer of the upstream chat protocol.
//!
//! Every websocket message carries one or more frames. A frame starts with a
//! 16-byte big-endian header `{packet_len: u32, header_len: u16, version:
//! u16, opcode: u32, sequence: u32}`; version 2 and 3 bodies are compressed
//! aggregates of further frames.

use std::io::Read;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Deserialize;

pub(crate) const OP_HEARTBEAT: u32 = 2;
pub(crate) const OP_HEARTBEAT_REPLY: u32 = 3;
pub(crate) const OP_SEND_MSG_REPLY: u32 = 5;
pub(crate) const OP_JOIN: u32 = 7;
pub(crate) const OP_JOIN_REPLY: u32 = 8;

const VERSION_PLAIN: u16 = 1;
const VERSION_ZLIB: u16 = 2;
const VERSION_BROTLI: u16 = 3;

const HEADER_LEN: usize = 16;

/// Live-state command tags. These update the room metadata instead of being
/// forwarded as ordinary room messages.
pub const CMD_LIVE: &str = "LIVE";
pub const CMD_PREPARING: &str = "PREPARING";

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Frame {
    pub(crate) version: u16,
    pub(crate) opcode: u32,
    pub(crate) body: Bytes,
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("frame header truncated")]
    Truncated,
    #[error("frame length {0} out of range")]
    BadLength(u32),
    #[error("decompress frame body")]
    Decompress(#[source] std::io::Error),
}

/// Encode one client frame.
pub(crate) fn encode(opcode: u32, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + body.len());
    buf.put_u32((HEADER_LEN + body.len()) as u32);
    buf.put_u16(HEADER_LEN as u16);
    buf.put_u16(VERSION_PLAIN);
    buf.put_u32(opcode);
    buf.put_u32(1);
    buf.put_slice(body);
    buf.freeze()
}

/// Split one websocket message into frames, expanding compressed aggregates.
pub(crate) fn decode(mut data: Bytes) -> Result<Vec<Frame>, WireError> {
    let mut frames = Vec::new();
    while !data.is_empty() {
        let frame = split_frame(&mut data)?;
        match frame.version {
            VERSION_ZLIB => {
                let mut inner = Vec::new();
                flate2::read::ZlibDecoder::new(frame.body.as_ref())
                    .read_to_end(&mut inner)
                    .map_err(WireError::Decompress)?;
                frames.extend(decode(Bytes::from(inner))?);
            }
            VERSION_BROTLI => {
                let mut inner = Vec::new();
                brotli::Decompressor::new(frame.body.as_ref(), 4096)
                    .read_to_end(&mut inner)
                    .map_err(WireError::Decompress)?;
                frames.extend(decode(Bytes::from(inner))?);
            }
            _ => frames.push(frame),
        }
    }
    Ok(frames)
}

fn split_frame(data: &mut Bytes) -> Result<Frame, WireError> {
    if data.len() < HEADER_LEN {
        return Err(WireError::Truncated);
    }

    let mut header = data.slice(..HEADER_LEN);
    let packet_len = header.get_u32() as usize;
    let header_len = usize::from(header.get_u16());
    let version = header.get_u16();
    let opcode = header.get_u32();
    let _sequence = header.get_u32();

    if packet_len < header_len || header_len < HEADER_LEN || packet_len > data.len() {
        return Err(WireError::BadLength(packet_len as u32));
    }

    let mut packet = data.split_to(packet_len);
    packet.advance(header_len);
    Ok(Frame {
        version,
        opcode,
        body: packet,
    })
}

#[derive(Debug, Default, Deserialize)]
struct CmdProbe {
    #[serde(default)]
    cmd: String,
}

/// Probe the top-level `cmd` tag of an event body without materializing the
/// whole object.
pub(crate) fn command_tag(body: &[u8]) -> Option<String> {
    serde_json::from_slice::<CmdProbe>(body)
        .ok()
        .filter(|probe| !probe.cmd.is_empty())
        .map(|probe| probe.cmd)
}
