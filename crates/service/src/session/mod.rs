mod table;

pub use table::SessionTable;

use std::{
    collections::VecDeque,
    sync::atomic::{AtomicU64, Ordering},
};

use bytes::Bytes;
use codec::SessionId;
use parking_lot::{Mutex, MutexGuard};

use crate::{dealer::Dealer, vhost::Vhost, ConnId};

/// A specially optimised timer.
///
/// This timer does not advance on its own; the owning service stacks it once
/// per second from a background thread, and every timestamp in the core is a
/// tick read from it.
///
/// ```
/// use gateway_server_service::session::Timer;
///
/// let timer = Timer::default();
///
/// assert_eq!(timer.get(), 0);
/// assert_eq!(timer.add(), 1);
/// assert_eq!(timer.get(), 1);
/// ```
#[derive(Default)]
pub struct Timer(AtomicU64);

impl Timer {
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn add(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// The protocol variant a session speaks towards its client.
///
/// The variant selects the `send_headers`/`send_body`/`send_end` hook set
/// used when dealer frames are delivered back to the client; a protocol
/// upgrade swaps the tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http11,
    Spdy,
    WebSocket,
    SocketIo,
}

/// Per-request parse state.
///
/// One of these lives in every session and is cleared between requests; the
/// reset releases every buffer the previous request accumulated.
#[derive(Debug, PartialEq, Eq)]
pub struct RequestState {
    pub initialized: bool,
    /// Collected header key/value pairs, bounded by the protocol handler.
    pub headers: Vec<(String, String)>,
    /// Whether the previous header callback delivered a value, so the next
    /// one starts a new key.
    pub last_was_value: bool,
    /// The serialized request envelope, once built.
    pub envelope: Option<Bytes>,
    /// Reassembly queue for fragmented WebSocket messages.
    pub fragments: VecDeque<Bytes>,
    pub content_remaining: u64,
    pub keepalive: bool,
}

impl Default for RequestState {
    fn default() -> Self {
        Self {
            initialized: false,
            headers: Vec::new(),
            last_was_value: true,
            envelope: None,
            fragments: VecDeque::new(),
            content_remaining: 0,
            keepalive: false,
        }
    }
}

impl RequestState {
    /// Reset for the next request. Idempotent: a second reset leaves the
    /// state bit-identical to a single one.
    pub fn reset(&mut self) {
        *self = Self {
            initialized: true,
            ..Self::default()
        };
    }
}

/// Per-response validation state for dealer-originated responses.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ResponseState {
    pub initialized: bool,
    pub headers_sent: bool,
}

impl ResponseState {
    pub fn reset(&mut self) {
        *self = Self {
            initialized: true,
            ..Self::default()
        };
    }
}

/// The mutable half of a session.
///
/// All fields are mutated under the session mutex; none of the back
/// references are owning, so dropping a session never tears down its
/// connection or dealer.
pub struct SessionInner {
    /// Persistent sessions survive their connection and are only removed by
    /// timed eviction.
    pub persistent: bool,
    /// Stealth sessions never emit an `end` frame and do not take part in
    /// dealer load accounting.
    pub stealth: bool,
    /// Latch set by the definitive (freeing) close.
    pub closed: bool,
    pub protocol: Protocol,
    pub connection: Option<ConnId>,
    pub dealer: Option<Dealer>,
    pub vhost: Option<Vhost>,
    pub groups: Vec<String>,
    /// Transient server-push queue, dropped on every close.
    pub push_queue: VecDeque<Bytes>,
    /// Outbound long-poll queue; lives as long as the session itself.
    pub sio_queue: VecDeque<Bytes>,
    /// Whether the single-shot delivery timer is currently pending.
    pub timer_armed: bool,
    /// Stream number within the connection, for framed multiplexing
    /// protocols.
    pub stream: u32,
    /// Eviction deadline tick, refreshed by upstream activity.
    pub expires: u64,
    pub request: RequestState,
    pub response: ResponseState,
}

/// A logical request/response context keyed by its 128-bit id.
pub struct Session {
    id: SessionId,
    inner: Mutex<SessionInner>,
}

impl Session {
    pub(crate) fn new(id: SessionId, connection: ConnId, expires: u64) -> Self {
        Self {
            id,
            inner: Mutex::new(SessionInner {
                persistent: false,
                stealth: false,
                closed: false,
                // every session starts out speaking plain HTTP
                protocol: Protocol::Http11,
                connection: Some(connection),
                dealer: None,
                vhost: None,
                groups: Vec::new(),
                push_queue: VecDeque::new(),
                sio_queue: VecDeque::new(),
                timer_armed: false,
                stream: 0,
                expires,
                request: RequestState::default(),
                response: ResponseState::default(),
            }),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_reset_is_idempotent() {
        let mut state = RequestState::default();
        state.headers.push(("Host".into(), "a.example".into()));
        state.envelope = Some(Bytes::from_static(b"x"));
        state.fragments.push_back(Bytes::from_static(b"y"));
        state.last_was_value = false;
        state.content_remaining = 9;

        state.reset();
        let once = format!("{state:?}");

        state.reset();
        assert_eq!(format!("{state:?}"), once);
        assert!(state.initialized);
        assert!(state.last_was_value);
        assert!(state.headers.is_empty());
        assert!(state.envelope.is_none());
    }
}
