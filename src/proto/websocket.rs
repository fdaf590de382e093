//! WebSocket upgrade path.
//!
//! The handshake answers the `Sec-WebSocket-Key` with the RFC 6455 accept
//! digest; afterwards client frames are unmasked, fragmented messages are
//! reassembled through the session's fragment queue, and every complete
//! message travels to the dealer as one `websocket` envelope.

use std::net::SocketAddr;

use base64::{Engine, prelude::BASE64_STANDARD};
use bytes::{BufMut, Bytes, BytesMut};
use codec::{Command, SessionId};
use service::{ConnId, dealer::Dealer};
use sha1::{Digest, Sha1};

use super::{Mode, Step};
use crate::Gateway;

pub const OP_CONT: u8 = 0x0;
pub const OP_TEXT: u8 = 0x1;
pub const OP_BINARY: u8 = 0x2;
pub const OP_CLOSE: u8 = 0x8;
pub const OP_PING: u8 = 0x9;
pub const OP_PONG: u8 = 0xa;

/// Frames past this size are a protocol violation rather than traffic.
const MAX_PAYLOAD: usize = 16 * 1024 * 1024;

static GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

pub(crate) struct WsState {
    id: SessionId,
    dealer: Dealer,
}

impl WsState {
    pub fn new(id: SessionId, dealer: Dealer) -> Self {
        Self { id, dealer }
    }
}

/// Sec-WebSocket-Accept digest:
/// `base64(sha1(key + 258EAFA5-E914-47DA-95CA-C5AB0DC85B11))`.
pub fn accept_key(key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key.trim().as_bytes());
    sha1.update(GUID.as_bytes());

    BASE64_STANDARD.encode(sha1.finalize())
}

pub fn accept_response(key: &str) -> Bytes {
    Bytes::from(format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Server: {}\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        crate::SOFTWARE,
        accept_key(key),
    ))
}

pub struct WsFrame {
    pub fin: bool,
    pub opcode: u8,
    pub payload: Bytes,
}

/// Decode one client frame.
///
/// `Ok(None)` means the frame is not complete yet; `Err` is a protocol
/// violation (reserved bits, unmasked client frame, oversized payload).
pub fn decode(buf: &[u8]) -> Result<Option<(WsFrame, usize)>, ()> {
    if buf.len() < 2 {
        return Ok(None);
    }

    if buf[0] & 0x70 != 0 {
        return Err(());
    }

    let fin = buf[0] & 0x80 != 0;
    let opcode = buf[0] & 0x0f;

    // client frames must be masked
    if buf[1] & 0x80 == 0 {
        return Err(());
    }

    let (len, mut offset) = match buf[1] & 0x7f {
        126 => {
            if buf.len() < 4 {
                return Ok(None);
            }

            (u16::from_be_bytes([buf[2], buf[3]]) as usize, 4)
        }
        127 => {
            if buf.len() < 10 {
                return Ok(None);
            }

            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&buf[2..10]);
            (u64::from_be_bytes(bytes) as usize, 10)
        }
        len => (len as usize, 2),
    };

    if len > MAX_PAYLOAD {
        return Err(());
    }

    if buf.len() < offset + 4 + len {
        return Ok(None);
    }

    let mask = [
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ];
    offset += 4;

    let mut payload = buf[offset..offset + len].to_vec();
    for (index, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask[index % 4];
    }

    Ok(Some((
        WsFrame {
            fin,
            opcode,
            payload: Bytes::from(payload),
        },
        offset + len,
    )))
}

/// Encode a server frame (never masked).
pub fn frame(opcode: u8, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(payload.len() + 10);
    buf.put_u8(0x80 | (opcode & 0x0f));

    if payload.len() < 126 {
        buf.put_u8(payload.len() as u8);
    } else if payload.len() <= u16::MAX as usize {
        buf.put_u8(126);
        buf.put_u16(payload.len() as u16);
    } else {
        buf.put_u8(127);
        buf.put_u64(payload.len() as u64);
    }

    buf.put_slice(payload);
    buf.freeze()
}

pub(crate) fn on_bytes(
    gateway: &Gateway,
    conn: ConnId,
    address: SocketAddr,
    state: &mut WsState,
    buf: &mut BytesMut,
) -> Step {
    loop {
        let (ws, size) = match decode(buf) {
            Err(()) => {
                log::warn!("websocket protocol violation: addr={address:?}");
                return Step::Close;
            }
            Ok(None) => return Step::Continue,
            Ok(Some(it)) => it,
        };

        let _ = buf.split_to(size);

        match ws.opcode {
            OP_TEXT | OP_BINARY | OP_CONT => {
                let Some(session) = gateway.service.get(state.id) else {
                    // the dealer already ended this session
                    return Step::Close;
                };

                if !ws.fin {
                    session.lock().request.fragments.push_back(ws.payload);
                    continue;
                }

                let message = if ws.opcode == OP_CONT {
                    let mut assembled = BytesMut::new();

                    {
                        let mut inner = session.lock();
                        while let Some(fragment) = inner.request.fragments.pop_front() {
                            assembled.extend_from_slice(&fragment);
                        }
                    }

                    assembled.extend_from_slice(&ws.payload);
                    assembled.freeze()
                } else {
                    ws.payload
                };

                gateway.service.touch_session(state.id);
                gateway.bus.send(
                    state.dealer.identity().clone(),
                    Some(state.id),
                    Command::WebSocket,
                    message,
                );
            }
            OP_PING => {
                gateway.exchanger.send(conn, frame(OP_PONG, &ws.payload));
            }
            OP_PONG => {}
            OP_CLOSE => {
                gateway.exchanger.send(conn, frame(OP_CLOSE, &[]));
                gateway.exchanger.shutdown(conn);
                gateway.service.close_session(state.id);
                return Step::Upgrade(Mode::Draining);
            }
            _ => {
                log::warn!("unknown websocket opcode: addr={address:?}, opcode={}", ws.opcode);
                return Step::Close;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // the RFC 6455 section 1.3 example key
    #[test]
    fn accept_key_matches_rfc_sample() {
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    fn masked(opcode: u8, fin: bool, payload: &[u8]) -> Vec<u8> {
        let mask = [0x11, 0x22, 0x33, 0x44];
        let mut out = vec![
            (if fin { 0x80 } else { 0x00 }) | opcode,
            0x80 | payload.len() as u8,
        ];
        out.extend_from_slice(&mask);
        out.extend(
            payload
                .iter()
                .enumerate()
                .map(|(index, byte)| byte ^ mask[index % 4]),
        );
        out
    }

    #[test]
    fn decode_unmasks_client_frames() {
        let bytes = masked(OP_TEXT, true, b"hello");
        let (frame, size) = decode(&bytes).unwrap().unwrap();

        assert_eq!(size, bytes.len());
        assert!(frame.fin);
        assert_eq!(frame.opcode, OP_TEXT);
        assert_eq!(frame.payload.as_ref(), b"hello");
    }

    #[test]
    fn decode_waits_for_whole_frames() {
        let bytes = masked(OP_TEXT, true, b"hello");
        for cut in 0..bytes.len() {
            assert!(decode(&bytes[..cut]).unwrap().is_none());
        }
    }

    #[test]
    fn unmasked_client_frames_are_refused() {
        // a server-style frame fed back in must be rejected
        let bytes = frame(OP_TEXT, b"hello");
        assert!(decode(&bytes).is_err());
    }
}
