pub mod http;
pub mod socketio;
pub mod spdy;
pub mod websocket;

use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};
use codec::{Command, Frame};
use service::{ConnId, session::Protocol, vhost::Acceptor};

use crate::Gateway;

/// What the connection driver should do after a batch of bytes.
pub enum Dispatch {
    Continue,
    Close,
}

/// Internal step result; `Upgrade` swaps the connection's protocol function
/// and reprocesses whatever is left in the buffer.
pub(crate) enum Step {
    Continue,
    Close,
    Upgrade(Mode),
}

pub(crate) enum Mode {
    Http(http::HttpState),
    WebSocket(websocket::WsState),
    /// Reads are discarded; the connection only lives to flush its write
    /// queue (error responses, long-poll deliveries).
    Draining,
}

/// Per-connection protocol dispatch state.
///
/// Plays the role of the connection's protocol function pointer: the
/// current mode parses the bytes, and may replace itself on upgrade.
pub struct ConnState {
    gateway: Gateway,
    acceptor: Acceptor,
    conn: ConnId,
    address: SocketAddr,
    mode: Mode,
}

impl ConnState {
    pub fn new(gateway: Gateway, acceptor: Acceptor, conn: ConnId, address: SocketAddr) -> Self {
        Self {
            gateway,
            acceptor,
            conn,
            address,
            // every connection starts out as plain HTTP
            mode: Mode::Http(http::HttpState::default()),
        }
    }

    /// Feed freshly read bytes to the current protocol function.
    ///
    /// Synchronous; handlers enqueue writes on the connection's queue and
    /// envelopes on the bus, they never block.
    pub fn on_bytes(&mut self, buf: &mut BytesMut) -> Dispatch {
        loop {
            let step = match &mut self.mode {
                Mode::Http(state) => http::on_bytes(
                    &self.gateway,
                    &self.acceptor,
                    self.conn,
                    self.address,
                    state,
                    buf,
                ),
                Mode::WebSocket(state) => {
                    websocket::on_bytes(&self.gateway, self.conn, self.address, state, buf)
                }
                Mode::Draining => {
                    buf.clear();
                    Step::Continue
                }
            };

            match step {
                Step::Continue => return Dispatch::Continue,
                Step::Close => return Dispatch::Close,
                Step::Upgrade(mode) => self.mode = mode,
            }
        }
    }
}

/// Route an inbound dealer frame to its session's protocol hooks.
///
/// Frames for sessions no longer in the table are dropped silently; that is
/// the normal fate of traffic racing a close or addressed to an evicted
/// persistent session.
pub fn deliver(gateway: &Gateway, frame: Frame) {
    let Some(id) = frame.session else {
        return;
    };

    // group membership commands need no protocol hook
    match frame.command {
        Command::Join => {
            if let Ok(group) = std::str::from_utf8(&frame.payload) {
                gateway.service.join_group(group, id);
            }

            return;
        }
        Command::Leave => {
            if let Ok(group) = std::str::from_utf8(&frame.payload) {
                gateway.service.leave_group(group, id);
            }

            return;
        }
        _ => {}
    }

    let Some(session) = gateway.service.get(id) else {
        gateway.statistics.frames_dropped.add(1);
        log::trace!("frame for unknown session dropped: id={id}");
        return;
    };

    let (protocol, connection) = {
        let inner = session.lock();
        (inner.protocol, inner.connection)
    };

    match frame.command {
        Command::Headers => send_headers(gateway, id, protocol, connection, frame.payload),
        Command::Body | Command::WebSocket => {
            send_body(gateway, id, protocol, connection, frame.payload)
        }
        Command::SocketIo => socketio::push(gateway, id, frame.payload),
        Command::End => send_end(gateway, id, protocol, connection),
        _ => {}
    }
}

/// The `send_headers` hook: deliver the dealer's response head.
fn send_headers(
    gateway: &Gateway,
    id: codec::SessionId,
    protocol: Protocol,
    connection: Option<ConnId>,
    payload: Bytes,
) {
    let Some(conn) = connection else {
        gateway.statistics.frames_dropped.add(1);
        return;
    };

    match protocol {
        Protocol::Http11 => {
            // the dealer's head must be a valid response before it reaches
            // the client
            let mut headers = [httparse::EMPTY_HEADER; http::MAX_HEADERS];
            let mut response = httparse::Response::new(&mut headers);

            if !matches!(response.parse(&payload), Ok(httparse::Status::Complete(_))) {
                log::warn!("invalid response head from dealer: id={id}");
                gateway.exchanger.shutdown(conn);
                gateway.service.close_session(id);
                return;
            }

            {
                let Some(session) = gateway.service.get(id) else {
                    return;
                };

                let mut inner = session.lock();
                if inner.response.headers_sent {
                    log::trace!("duplicate response head dropped: id={id}");
                    return;
                }

                inner.response.headers_sent = true;
            }

            gateway.exchanger.send(conn, payload);
        }
        Protocol::Spdy => {
            let mut headers = [httparse::EMPTY_HEADER; http::MAX_HEADERS];
            let mut response = httparse::Response::new(&mut headers);

            if !matches!(response.parse(&payload), Ok(httparse::Status::Complete(_))) {
                log::warn!("invalid response head from dealer: id={id}");
                gateway.exchanger.shutdown(conn);
                gateway.service.close_session(id);
                return;
            }

            let stream = gateway
                .service
                .get(id)
                .map(|it| it.lock().stream)
                .unwrap_or(1);

            let mut pairs = vec![
                (
                    "status".to_string(),
                    format!(
                        "{} {}",
                        response.code.unwrap_or(200),
                        response.reason.unwrap_or("OK")
                    ),
                ),
                ("version".to_string(), "HTTP/1.1".to_string()),
            ];

            for header in response.headers.iter() {
                pairs.push((
                    header.name.to_ascii_lowercase(),
                    String::from_utf8_lossy(header.value).to_string(),
                ));
            }

            if let Some(context) = gateway.exchanger.spdy(conn) {
                let mut context = context.lock();
                let context = context.get_or_insert_with(spdy::Context::new);
                gateway
                    .exchanger
                    .send(conn, spdy::syn_reply(context, stream, &pairs));
            }
        }
        // neither upgrade protocol has a separate response head
        Protocol::WebSocket | Protocol::SocketIo => {}
    }
}

/// The `send_body` hook: deliver response payload bytes.
fn send_body(
    gateway: &Gateway,
    id: codec::SessionId,
    protocol: Protocol,
    connection: Option<ConnId>,
    payload: Bytes,
) {
    match protocol {
        // long-poll sessions queue instead of writing through
        Protocol::SocketIo => {
            socketio::push(gateway, id, payload);
            return;
        }
        _ => {}
    }

    let Some(conn) = connection else {
        gateway.statistics.frames_dropped.add(1);
        return;
    };

    match protocol {
        Protocol::Http11 => {
            gateway.exchanger.send(conn, payload);
        }
        Protocol::Spdy => {
            let stream = gateway
                .service
                .get(id)
                .map(|it| it.lock().stream)
                .unwrap_or(1);

            gateway.exchanger.send(conn, spdy::data(stream, &payload, false));
        }
        Protocol::WebSocket => {
            gateway
                .exchanger
                .send(conn, websocket::frame(websocket::OP_TEXT, &payload));
        }
        Protocol::SocketIo => unreachable!(),
    }
}

/// The `send_end` hook: the dealer finished this session.
fn send_end(
    gateway: &Gateway,
    id: codec::SessionId,
    protocol: Protocol,
    connection: Option<ConnId>,
) {
    if let Some(conn) = connection {
        match protocol {
            Protocol::Http11 => {
                let keepalive = gateway
                    .service
                    .get(id)
                    .map(|it| it.lock().request.keepalive)
                    .unwrap_or(false);

                if !keepalive {
                    gateway.exchanger.shutdown(conn);
                }
            }
            Protocol::Spdy => {
                let stream = gateway
                    .service
                    .get(id)
                    .map(|it| it.lock().stream)
                    .unwrap_or(1);

                gateway.exchanger.send(conn, spdy::data(stream, &[], true));
            }
            Protocol::WebSocket => {
                gateway
                    .exchanger
                    .send(conn, websocket::frame(websocket::OP_CLOSE, &[]));
                gateway.exchanger.shutdown(conn);
            }
            Protocol::SocketIo => {}
        }
    }

    gateway.service.close_session(id);
}
