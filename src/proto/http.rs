use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};
use codec::{Command, SessionId, envelope::RequestEnvelope};
use service::{ConnId, dealer::Dealer, session::Protocol, vhost::Acceptor};

use super::{Mode, Step, socketio, websocket};
use crate::Gateway;

/// Per-request header bound; requests with more are refused by the parser.
pub const MAX_HEADERS: usize = 64;

/// How much unparsed request head we are willing to buffer.
const MAX_HEAD_SIZE: usize = 16 * 1024;

#[derive(Default)]
pub(crate) struct HttpState {
    phase: Phase,
}

#[derive(Default)]
enum Phase {
    #[default]
    Headers,
    /// Streaming a request body to the dealer.
    Body {
        id: SessionId,
        dealer: Dealer,
        remaining: u64,
    },
    /// Collecting a long-poll POST body.
    SioPost {
        id: SessionId,
        remaining: usize,
        body: BytesMut,
    },
}

/// An owned copy of a parsed request head.
pub(crate) struct Head {
    pub method: String,
    pub path: String,
    pub minor: u8,
    pub headers: Vec<(String, String)>,
}

impl Head {
    fn from(request: &httparse::Request) -> Self {
        Self {
            method: request.method.unwrap_or("GET").to_string(),
            path: request.path.unwrap_or("/").to_string(),
            minor: request.version.unwrap_or(0),
            headers: request
                .headers
                .iter()
                .take_while(|it| !it.name.is_empty())
                .map(|it| {
                    (
                        it.name.to_string(),
                        String::from_utf8_lossy(it.value).to_string(),
                    )
                })
                .collect(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// The request's host name, without any port suffix.
    pub fn host(&self) -> Option<&str> {
        self.header("host")
            .map(|it| it.split(':').next().unwrap_or(it))
    }
}

/// What a completed request head turned into.
pub(crate) enum Outcome {
    Routed {
        id: SessionId,
        dealer: Dealer,
        remaining: u64,
    },
    Upgrade(websocket::WsState),
    SioPost {
        id: SessionId,
        remaining: usize,
    },
    /// A response was queued; discard the rest of the connection's input.
    Drain,
    Close,
}

pub(crate) fn on_bytes(
    gateway: &Gateway,
    acceptor: &Acceptor,
    conn: ConnId,
    address: SocketAddr,
    state: &mut HttpState,
    buf: &mut BytesMut,
) -> Step {
    loop {
        if buf.is_empty() {
            return Step::Continue;
        }

        match std::mem::take(&mut state.phase) {
            Phase::Headers => {
                let (head, head_len) = {
                    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
                    let mut request = httparse::Request::new(&mut headers);

                    match request.parse(buf) {
                        Err(e) => {
                            log::warn!("http parse error: addr={address:?}, err={e}");
                            return Step::Close;
                        }
                        Ok(httparse::Status::Partial) => {
                            return if buf.len() > MAX_HEAD_SIZE {
                                log::warn!("request head too large: addr={address:?}");
                                Step::Close
                            } else {
                                Step::Continue
                            };
                        }
                        Ok(httparse::Status::Complete(n)) => (Head::from(&request), n),
                    }
                };

                let _ = buf.split_to(head_len);

                match on_request(gateway, acceptor, conn, address, &head) {
                    Outcome::Routed {
                        id,
                        dealer,
                        remaining,
                    } => {
                        if remaining > 0 {
                            state.phase = Phase::Body {
                                id,
                                dealer,
                                remaining,
                            };
                        }

                        // a request without a body leaves us in the headers
                        // phase, ready for the next pipelined request
                    }
                    Outcome::SioPost { id, remaining } => {
                        if remaining == 0 {
                            socketio::on_post(gateway, id, Bytes::new(), conn);
                            return Step::Upgrade(Mode::Draining);
                        }

                        state.phase = Phase::SioPost {
                            id,
                            remaining,
                            body: BytesMut::with_capacity(remaining.min(MAX_HEAD_SIZE)),
                        };
                    }
                    Outcome::Upgrade(ws) => return Step::Upgrade(Mode::WebSocket(ws)),
                    Outcome::Drain => return Step::Upgrade(Mode::Draining),
                    Outcome::Close => return Step::Close,
                }
            }
            Phase::Body {
                id,
                dealer,
                remaining,
            } => {
                let take = remaining.min(buf.len() as u64) as usize;
                let chunk = buf.split_to(take).freeze();

                gateway
                    .bus
                    .send(dealer.identity().clone(), Some(id), Command::Body, chunk);

                if remaining > take as u64 {
                    state.phase = Phase::Body {
                        id,
                        dealer,
                        remaining: remaining - take as u64,
                    };

                    return Step::Continue;
                }
            }
            Phase::SioPost {
                id,
                remaining,
                mut body,
            } => {
                let take = remaining.min(buf.len());
                body.extend_from_slice(&buf.split_to(take));

                if remaining > take {
                    state.phase = Phase::SioPost {
                        id,
                        remaining: remaining - take,
                        body,
                    };

                    return Step::Continue;
                }

                socketio::on_post(gateway, id, body.freeze(), conn);
                return Step::Upgrade(Mode::Draining);
            }
        }
    }
}

fn on_request(
    gateway: &Gateway,
    acceptor: &Acceptor,
    conn: ConnId,
    address: SocketAddr,
    head: &Head,
) -> Outcome {
    // the long-poll endpoints manage their own (persistent) sessions
    if head.path.starts_with("/socket.io/") {
        return socketio::on_request(gateway, acceptor, conn, address, head);
    }

    let session = gateway.service.open_session(conn);
    let id = session.id();

    let mut keepalive = head.minor == 1;
    let mut content_length = 0u64;
    let mut bad_request = false;
    let mut chunked = false;
    let mut hops = 0u32;
    let mut upgrade = false;
    let mut ws_key = None;

    for (name, value) in &head.headers {
        if name.eq_ignore_ascii_case("content-length") {
            match value.trim().parse() {
                Ok(it) => content_length = it,
                Err(_) => bad_request = true,
            }
        } else if name.eq_ignore_ascii_case("transfer-encoding") {
            chunked |= value.to_ascii_lowercase().contains("chunked");
        } else if name.eq_ignore_ascii_case("connection") {
            let value = value.to_ascii_lowercase();
            if value.contains("close") {
                keepalive = false;
            } else if value.contains("keep-alive") {
                keepalive = true;
            }
        } else if name.eq_ignore_ascii_case("upgrade") {
            upgrade = value.eq_ignore_ascii_case("websocket");
        } else if name.eq_ignore_ascii_case("sec-websocket-key") {
            ws_key = Some(value.clone());
        } else if name.eq_ignore_ascii_case("x-gateway-hops") {
            hops = value.trim().parse().unwrap_or(u32::MAX);
        }
    }

    {
        let mut inner = session.lock();
        inner.request.reset();
        inner.response.reset();

        for (name, value) in &head.headers {
            inner.request.headers.push((name.clone(), value.clone()));
        }

        inner.request.last_was_value = true;
        inner.request.keepalive = keepalive;
        inner.request.content_remaining = content_length;
    }

    if bad_request {
        return refuse(gateway, conn, id, "400 Bad Request");
    }

    let Some(host) = head.host() else {
        return refuse(gateway, conn, id, "400 Bad Request");
    };

    // forwarding-loop protection
    if hops >= gateway.max_hops {
        log::warn!("hop limit exceeded: addr={address:?}, host={host:?}");
        return refuse(gateway, conn, id, "502 Bad Gateway");
    }

    // the bundled parser cannot frame chunked request bodies
    if chunked {
        return refuse(gateway, conn, id, "411 Length Required");
    }

    let Some(dealer) = gateway.service.assign_dealer(&session, acceptor, host) else {
        log::warn!("no dealer available: addr={address:?}, host={host:?}");
        return refuse(gateway, conn, id, "502 Bad Gateway");
    };

    let server_name = session
        .lock()
        .vhost
        .as_ref()
        .map(|it| it.name().to_string())
        .unwrap_or_else(|| host.to_string());

    let envelope = match build_envelope(head, address, &server_name, hops) {
        Ok(it) => it,
        Err(_) => return refuse(gateway, conn, id, "400 Bad Request"),
    };

    session.lock().request.envelope = Some(envelope.clone());
    gateway
        .bus
        .send(dealer.identity().clone(), Some(id), Command::Uwsgi, envelope);

    if upgrade {
        let Some(key) = ws_key else {
            return refuse(gateway, conn, id, "400 Bad Request");
        };

        gateway
            .exchanger
            .send(conn, websocket::accept_response(&key));
        session.lock().protocol = Protocol::WebSocket;

        log::info!("websocket upgrade: addr={address:?}, id={id}");
        return Outcome::Upgrade(websocket::WsState::new(id, dealer));
    }

    Outcome::Routed {
        id,
        dealer,
        remaining: content_length,
    }
}

/// The routing failed; answer the client ourselves and close the session
/// normally.
pub(crate) fn refuse(gateway: &Gateway, conn: ConnId, id: SessionId, status: &str) -> Outcome {
    gateway.service.close_session(id);
    gateway.exchanger.send(conn, error_response(status));
    gateway.exchanger.shutdown(conn);
    Outcome::Drain
}

pub(crate) fn error_response(status: &str) -> Bytes {
    Bytes::from(format!(
        "HTTP/1.1 {status}\r\nServer: {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        crate::SOFTWARE,
    ))
}

/// Serialize the request head into the key/value envelope the dealers
/// consume. The hop counter is re-emitted incremented.
pub(crate) fn build_envelope(
    head: &Head,
    address: SocketAddr,
    server_name: &str,
    hops: u32,
) -> Result<Bytes, codec::Error> {
    let (path_info, query) = match head.path.split_once('?') {
        Some((path, query)) => (path, query),
        None => (head.path.as_str(), ""),
    };

    let mut envelope = RequestEnvelope::default();
    envelope.push("REQUEST_METHOD", head.method.as_bytes())?;
    envelope.push("REQUEST_URI", head.path.as_bytes())?;
    envelope.push("PATH_INFO", path_info.as_bytes())?;
    envelope.push("QUERY_STRING", query.as_bytes())?;
    envelope.push(
        "SERVER_PROTOCOL",
        if head.minor == 1 {
            b"HTTP/1.1".as_slice()
        } else {
            b"HTTP/1.0".as_slice()
        },
    )?;
    envelope.push("SERVER_NAME", server_name.as_bytes())?;
    envelope.push("REMOTE_ADDR", address.ip().to_string().as_bytes())?;
    envelope.push("REMOTE_PORT", address.port().to_string().as_bytes())?;

    for (name, value) in &head.headers {
        if name.eq_ignore_ascii_case("x-gateway-hops") {
            continue;
        }

        if name.eq_ignore_ascii_case("content-length") {
            envelope.push("CONTENT_LENGTH", value.as_bytes())?;
        } else if name.eq_ignore_ascii_case("content-type") {
            envelope.push("CONTENT_TYPE", value.as_bytes())?;
        } else {
            let key = format!(
                "HTTP_{}",
                name.to_ascii_uppercase().replace('-', "_")
            );
            envelope.push(&key, value.as_bytes())?;
        }
    }

    envelope.push("HTTP_X_GATEWAY_HOPS", (hops + 1).to_string().as_bytes())?;
    envelope.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head() -> Head {
        Head {
            method: "GET".to_string(),
            path: "/search?q=1".to_string(),
            minor: 1,
            headers: vec![
                ("Host".to_string(), "a.example:8080".to_string()),
                ("Accept".to_string(), "*/*".to_string()),
                ("X-Gateway-Hops".to_string(), "2".to_string()),
            ],
        }
    }

    #[test]
    fn host_strips_the_port() {
        assert_eq!(head().host(), Some("a.example"));
    }

    #[test]
    fn envelope_carries_cgi_style_keys() {
        let address = "127.0.0.1:51000".parse().unwrap();
        let envelope = build_envelope(&head(), address, "a.example", 2).unwrap();
        let pairs = codec::envelope::pairs(&envelope).unwrap();

        let get = |key: &str| {
            pairs
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| std::str::from_utf8(v).unwrap().to_string())
        };

        assert_eq!(get("REQUEST_METHOD").as_deref(), Some("GET"));
        assert_eq!(get("PATH_INFO").as_deref(), Some("/search"));
        assert_eq!(get("QUERY_STRING").as_deref(), Some("q=1"));
        assert_eq!(get("SERVER_NAME").as_deref(), Some("a.example"));
        assert_eq!(get("HTTP_ACCEPT").as_deref(), Some("*/*"));

        // the hop counter is rewritten, not forwarded
        assert_eq!(get("HTTP_X_GATEWAY_HOPS").as_deref(), Some("3"));
        assert_eq!(pairs.iter().filter(|(k, _)| k == "HTTP_X_GATEWAY_HOPS").count(), 1);
    }
}
