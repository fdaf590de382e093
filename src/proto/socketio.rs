//! Socket.IO long polling.
//!
//! The handshake creates a persistent session that outlives every
//! connection it is served on. Dealer pushes queue on the session; a poll
//! either drains one queued message immediately or parks the connection
//! behind the session's single-shot delivery timer, which answers with one
//! message or an empty heartbeat. The timer is armed by upstream activity
//! (polls and pushes), never by its own expiry.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use codec::{Command, SessionId};
use service::{ConnId, session::Protocol, vhost::Acceptor};

use super::http::{self, Head, Outcome};
use crate::Gateway;

/// Seconds an empty poll is parked before the heartbeat answers it.
const POLL_TIMEOUT: u64 = 5;

/// Heartbeat/close timeouts advertised in the handshake body.
const HANDSHAKE_TIMEOUTS: (u32, u32) = (15, 10);

pub(crate) fn on_request(
    gateway: &Gateway,
    acceptor: &Acceptor,
    conn: ConnId,
    address: SocketAddr,
    head: &Head,
) -> Outcome {
    let path = head.path.split('?').next().unwrap_or(head.path.as_str());
    let parts: Vec<&str> = path.trim_matches('/').split('/').collect();

    match parts.as_slice() {
        ["socket.io", "1"] => handshake(gateway, acceptor, conn, address, head),
        ["socket.io", "1", "xhr-polling", sid] => {
            let Ok(id) = sid.parse::<SessionId>() else {
                return not_found(gateway, conn);
            };

            match head.method.as_str() {
                "GET" => poll(gateway, conn, id),
                "POST" => {
                    if gateway.service.get(id).is_none() {
                        return not_found(gateway, conn);
                    }

                    let remaining = head
                        .header("content-length")
                        .and_then(|it| it.trim().parse().ok())
                        .unwrap_or(0);

                    Outcome::SioPost { id, remaining }
                }
                _ => not_found(gateway, conn),
            }
        }
        _ => not_found(gateway, conn),
    }
}

/// `GET /socket.io/1/`: open a persistent session and hand its id out.
fn handshake(
    gateway: &Gateway,
    acceptor: &Acceptor,
    conn: ConnId,
    address: SocketAddr,
    head: &Head,
) -> Outcome {
    let session = gateway.service.open_session(conn);
    let id = session.id();

    {
        let mut inner = session.lock();
        inner.persistent = true;
        inner.protocol = Protocol::SocketIo;
        inner.request.reset();
        inner.request.keepalive = false;
    }

    let Some(host) = head.host() else {
        return http::refuse(gateway, conn, id, "400 Bad Request");
    };

    let Some(dealer) = gateway.service.assign_dealer(&session, acceptor, host) else {
        log::warn!("no dealer available: addr={address:?}, host={host:?}");
        return http::refuse(gateway, conn, id, "502 Bad Gateway");
    };

    // announce the new session to its dealer the same way a plain request
    // would
    let server_name = session
        .lock()
        .vhost
        .as_ref()
        .map(|it| it.name().to_string())
        .unwrap_or_else(|| host.to_string());

    match http::build_envelope(head, address, &server_name, 0) {
        Ok(envelope) => {
            gateway
                .bus
                .send(dealer.identity().clone(), Some(id), Command::Uwsgi, envelope);
        }
        Err(_) => return http::refuse(gateway, conn, id, "400 Bad Request"),
    }

    log::info!("socket.io handshake: addr={address:?}, id={id}");

    let (heartbeat, close) = HANDSHAKE_TIMEOUTS;
    gateway
        .exchanger
        .send(conn, respond(format!("{id}:{heartbeat}:{close}:xhr-polling").as_bytes()));
    gateway.exchanger.shutdown(conn);
    Outcome::Drain
}

/// `GET /socket.io/1/xhr-polling/<sid>`: re-attach and wait for traffic.
fn poll(gateway: &Gateway, conn: ConnId, id: SessionId) -> Outcome {
    let Some(session) = gateway.service.attach_session(id, conn) else {
        return not_found(gateway, conn);
    };

    // anything already queued answers the poll on the spot
    let queued = session.lock().sio_queue.pop_front();
    if let Some(message) = queued {
        gateway.exchanger.send(conn, respond(&message));
        gateway.exchanger.shutdown(conn);
        return Outcome::Drain;
    }

    if gateway.service.arm_timer(id) {
        tokio::spawn(fire(gateway.clone(), id));
    } else {
        // another poll already holds the timer; do not park two
        gateway.exchanger.send(conn, respond(b""));
        gateway.exchanger.shutdown(conn);
    }

    Outcome::Drain
}

/// The single-shot delivery timer: one queued message, or the empty
/// heartbeat frame.
async fn fire(gateway: Gateway, id: SessionId) {
    tokio::time::sleep(Duration::from_secs(POLL_TIMEOUT)).await;

    // session evicted in the meantime: the tick is dropped
    let Some(poll) = gateway.service.poll_push(id) else {
        return;
    };

    let Some(conn) = poll.connection else {
        gateway.statistics.frames_dropped.add(1);
        return;
    };

    gateway
        .exchanger
        .send(conn, respond(poll.message.as_deref().unwrap_or(&[])));
    gateway.exchanger.shutdown(conn);
}

/// A dealer push: queue on the session and, when a poll is attached, arm
/// the delivery timer.
pub(crate) fn push(gateway: &Gateway, id: SessionId, payload: Bytes) {
    match gateway.service.queue_push(id, payload) {
        None => {
            gateway.statistics.frames_dropped.add(1);
            log::trace!("push for unknown session dropped: id={id}");
        }
        Some(true) => {
            if gateway.service.arm_timer(id) {
                tokio::spawn(fire(gateway.clone(), id));
            }
        }
        // detached: the message waits in the queue for the next poll
        Some(false) => {}
    }
}

/// `POST` body completed: forward to the dealer and acknowledge.
pub(crate) fn on_post(gateway: &Gateway, id: SessionId, body: Bytes, conn: ConnId) {
    if let Some(session) = gateway.service.get(id) {
        let dealer = session.lock().dealer.clone();
        gateway.service.touch_session(id);

        if let Some(dealer) = dealer {
            gateway
                .bus
                .send(dealer.identity().clone(), Some(id), Command::SocketIo, body);
        }
    }

    gateway.exchanger.send(conn, respond(b"1"));
    gateway.exchanger.shutdown(conn);
}

fn not_found(gateway: &Gateway, conn: ConnId) -> Outcome {
    gateway
        .exchanger
        .send(conn, http::error_response("404 Not Found"));
    gateway.exchanger.shutdown(conn);
    Outcome::Drain
}

fn respond(body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(body.len() + 160);
    buf.extend_from_slice(
        format!(
            "HTTP/1.1 200 OK\r\n\
             Server: {}\r\n\
             Content-Type: text/plain; charset=utf-8\r\n\
             Content-Length: {}\r\n\
             Connection: close\r\n\r\n",
            crate::SOFTWARE,
            body.len(),
        )
        .as_bytes(),
    );
    buf.extend_from_slice(body);
    buf.freeze()
}
