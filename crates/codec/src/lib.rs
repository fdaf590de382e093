//! ## Gateway bus wire format
//!
//! Every message exchanged with a dealer backend is a four-frame envelope:
//!
//! ```text
//! [dealer-identity][session-id][command][payload]
//! ```
//!
//! On the wire an envelope is a one-byte frame count followed by the frames,
//! each prefixed with a u32 big-endian length. A whole envelope is always
//! encoded into a single buffer, so a send is atomic with respect to other
//! messages multiplexed onto the same socket.
//!
//! The session-id frame is the 16-byte wire form of a 128-bit session id, or
//! empty for messages that address a dealer rather than a session (liveness
//! probes).

pub mod envelope;

use std::{array::TryFromSliceError, str::FromStr, str::Utf8Error};

use bytes::{BufMut, Bytes, BytesMut};

#[derive(Debug)]
pub enum Error {
    InvalidInput,
    Incomplete,
    FrameTooLarge,
    PayloadTooLarge,
    UnknownCommand,
    BadSessionId,
    Utf8Error(Utf8Error),
    TryFromSliceError(TryFromSliceError),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<Utf8Error> for Error {
    fn from(value: Utf8Error) -> Self {
        Self::Utf8Error(value)
    }
}

impl From<TryFromSliceError> for Error {
    fn from(value: TryFromSliceError) -> Self {
        Self::TryFromSliceError(value)
    }
}

/// Frames larger than this are rejected before any allocation happens.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Number of frames in an envelope.
const FRAME_COUNT: usize = 4;

/// The 128-bit session identifier, split into two 64-bit words.
///
/// The first word is the primary hash-table key; both words travel on the
/// wire as 16 little-endian bytes.
///
/// # Example
///
/// ```
/// use gateway_server_codec::SessionId;
///
/// let id = SessionId(1, 2);
/// let bytes = id.to_bytes();
///
/// assert_eq!(SessionId::from_bytes(&bytes).unwrap(), id);
/// assert_eq!(id.to_string().parse::<SessionId>().unwrap(), id);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub u64, pub u64);

impl SessionId {
    pub const WIRE_LEN: usize = 16;

    pub fn to_bytes(self) -> [u8; Self::WIRE_LEN] {
        let mut bytes = [0u8; Self::WIRE_LEN];
        bytes[..8].copy_from_slice(&self.0.to_le_bytes());
        bytes[8..].copy_from_slice(&self.1.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() != Self::WIRE_LEN {
            return Err(Error::BadSessionId);
        }

        Ok(Self(
            u64::from_le_bytes(bytes[..8].try_into()?),
            u64::from_le_bytes(bytes[8..].try_into()?),
        ))
    }

    /// Bucket index for a table whose size is `mask + 1` (a power of two).
    pub fn bucket(&self, mask: u64) -> usize {
        (self.0 & mask) as usize
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}{:016x}", self.0, self.1)
    }
}

impl FromStr for SessionId {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value.len() != 32 {
            return Err(Error::BadSessionId);
        }

        Ok(Self(
            u64::from_str_radix(&value[..16], 16).map_err(|_| Error::BadSessionId)?,
            u64::from_str_radix(&value[16..], 16).map_err(|_| Error::BadSessionId)?,
        ))
    }
}

/// Commands understood on the bus.
///
/// `Ping`/`Pong` carry dealer liveness, `End` terminates a session, the rest
/// carry application traffic for the protocol hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Uwsgi,
    Body,
    Headers,
    End,
    Ping,
    Pong,
    WebSocket,
    SocketIo,
    Join,
    Leave,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uwsgi => "uwsgi",
            Self::Body => "body",
            Self::Headers => "headers",
            Self::End => "end",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::WebSocket => "websocket",
            Self::SocketIo => "socket.io",
            Self::Join => "join",
            Self::Leave => "leave",
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        Ok(match bytes {
            b"uwsgi" => Self::Uwsgi,
            b"body" => Self::Body,
            b"headers" => Self::Headers,
            b"end" => Self::End,
            b"ping" => Self::Ping,
            b"pong" => Self::Pong,
            b"websocket" => Self::WebSocket,
            b"socket.io" => Self::SocketIo,
            b"join" => Self::Join,
            b"leave" => Self::Leave,
            _ => return Err(Error::UnknownCommand),
        })
    }
}

/// A decoded bus message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub identity: Bytes,
    pub session: Option<SessionId>,
    pub command: Command,
    pub payload: Bytes,
}

impl Frame {
    /// Encode the whole envelope into `buf` as one contiguous message.
    pub fn encode(&self, buf: &mut BytesMut) {
        let session = self.session.map(SessionId::to_bytes);
        let command = self.command.as_str().as_bytes();

        buf.reserve(
            1 + FRAME_COUNT * 4
                + self.identity.len()
                + session.map(|it| it.len()).unwrap_or(0)
                + command.len()
                + self.payload.len(),
        );

        buf.put_u8(FRAME_COUNT as u8);
        for frame in [
            self.identity.as_ref(),
            session.as_ref().map(|it| it.as_slice()).unwrap_or(&[]),
            command,
            self.payload.as_ref(),
        ] {
            buf.put_u32(frame.len() as u32);
            buf.put_slice(frame);
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }
}

/// Incremental envelope decoder.
///
/// `message_size` probes a receive buffer for one complete envelope without
/// consuming anything; the caller splits that many bytes off and hands them
/// to `decode`.
///
/// # Example
///
/// ```
/// use bytes::Bytes;
/// use gateway_server_codec::{Command, Decoder, Frame, SessionId};
///
/// let frame = Frame {
///     identity: Bytes::from_static(b"worker-1"),
///     session: Some(SessionId(7, 9)),
///     command: Command::End,
///     payload: Bytes::new(),
/// };
///
/// let bytes = frame.to_bytes();
///
/// assert_eq!(Decoder::message_size(&bytes).unwrap(), bytes.len());
/// assert_eq!(Decoder::decode(&bytes).unwrap(), frame);
/// ```
pub struct Decoder;

impl Decoder {
    /// Total size in bytes of the first envelope in `buf`, or
    /// `Err(Incomplete)` when more bytes are needed.
    pub fn message_size(buf: &[u8]) -> Result<usize, Error> {
        if buf.is_empty() {
            return Err(Error::Incomplete);
        }

        if buf[0] as usize != FRAME_COUNT {
            return Err(Error::InvalidInput);
        }

        let mut offset = 1;
        for _ in 0..FRAME_COUNT {
            if buf.len() < offset + 4 {
                return Err(Error::Incomplete);
            }

            let len = u32::from_be_bytes(buf[offset..offset + 4].try_into()?) as usize;
            if len > MAX_FRAME_SIZE {
                return Err(Error::FrameTooLarge);
            }

            offset += 4 + len;
        }

        if buf.len() < offset {
            return Err(Error::Incomplete);
        }

        Ok(offset)
    }

    /// Decode exactly one envelope from `buf`.
    pub fn decode(buf: &[u8]) -> Result<Frame, Error> {
        let size = Self::message_size(buf)?;
        if size != buf.len() {
            return Err(Error::InvalidInput);
        }

        let mut frames = [&buf[..0]; FRAME_COUNT];
        let mut offset = 1;
        for frame in frames.iter_mut() {
            let len = u32::from_be_bytes(buf[offset..offset + 4].try_into()?) as usize;
            *frame = &buf[offset + 4..offset + 4 + len];
            offset += 4 + len;
        }

        if frames[0].is_empty() {
            return Err(Error::InvalidInput);
        }

        Ok(Frame {
            identity: Bytes::copy_from_slice(frames[0]),
            session: if frames[1].is_empty() {
                None
            } else {
                Some(SessionId::from_bytes(frames[1])?)
            },
            command: Command::from_bytes(frames[2])?,
            payload: Bytes::copy_from_slice(frames[3]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_size_is_incremental() {
        let frame = Frame {
            identity: Bytes::from_static(b"worker-1"),
            session: Some(SessionId(1, 2)),
            command: Command::Uwsgi,
            payload: Bytes::from_static(b"payload"),
        };

        let bytes = frame.to_bytes();
        for cut in 0..bytes.len() {
            assert!(matches!(
                Decoder::message_size(&bytes[..cut]),
                Err(Error::Incomplete)
            ));
        }

        // Trailing bytes belong to the next message and must not change the
        // reported size.
        let mut run = bytes.to_vec();
        run.extend_from_slice(&bytes);
        assert_eq!(Decoder::message_size(&run).unwrap(), bytes.len());
    }

    #[test]
    fn probe_session_frame_is_empty() {
        let frame = Frame {
            identity: Bytes::from_static(b"worker-1"),
            session: None,
            command: Command::Ping,
            payload: Bytes::new(),
        };

        let decoded = Decoder::decode(&frame.to_bytes()).unwrap();
        assert_eq!(decoded.session, None);
        assert_eq!(decoded.command, Command::Ping);
    }

    #[test]
    fn rejects_unknown_commands_and_bad_counts() {
        let mut bytes = Frame {
            identity: Bytes::from_static(b"worker-1"),
            session: None,
            command: Command::Ping,
            payload: Bytes::new(),
        }
        .to_bytes()
        .to_vec();

        bytes[0] = 3;
        assert!(matches!(
            Decoder::message_size(&bytes),
            Err(Error::InvalidInput)
        ));

        let mut buf = BytesMut::new();
        buf.put_u8(FRAME_COUNT as u8);
        for frame in [&b"worker-1"[..], &[], &b"nope"[..], &[]] {
            buf.put_u32(frame.len() as u32);
            buf.put_slice(frame);
        }

        assert!(matches!(Decoder::decode(&buf), Err(Error::UnknownCommand)));
    }
}
