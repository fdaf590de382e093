pub mod pinger;

use std::sync::Arc;

use ahash::AHashMap;
use anyhow::Result;
use bytes::{Bytes, BytesMut};
use codec::{Command, Decoder, Frame, SessionId};
use parking_lot::RwLock;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
    sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
};

use crate::{Gateway, config::Config, proto};

/// Create the egress channel feeding the router socket.
pub fn channel() -> (BusSender, UnboundedReceiver<Frame>) {
    let (tx, rx) = unbounded_channel();
    (BusSender(tx), rx)
}

/// Handle for enqueueing outbound envelopes.
///
/// Sends never block and never fail from the caller's point of view; actual
/// delivery (or the lack of a connected peer) is handled by the egress pump.
#[derive(Clone)]
pub struct BusSender(UnboundedSender<Frame>);

impl BusSender {
    pub fn send(&self, identity: Bytes, session: Option<SessionId>, command: Command, payload: Bytes) {
        let _ = self.0.send(Frame {
            identity,
            session,
            command,
            payload,
        });
    }
}

type Peers = Arc<RwLock<AHashMap<Bytes, UnboundedSender<Bytes>>>>;

/// Bind the dealer-facing router socket and start the bridge.
///
/// Dealers connect here; the identity frame of their traffic registers them
/// for outbound addressing. One envelope is always one buffer on the wire,
/// so multi-frame sends cannot interleave.
pub async fn start(
    config: &Config,
    gateway: Gateway,
    mut egress: UnboundedReceiver<Frame>,
) -> Result<()> {
    let listener = TcpListener::bind(config.bus).await?;
    let local_addr = listener.local_addr()?;
    let peers: Peers = Default::default();

    // Egress pump: resolve the target peer by identity and hand the encoded
    // envelope to its writer.
    {
        let peers = peers.clone();
        let gateway = gateway.clone();

        tokio::spawn(async move {
            while let Some(frame) = egress.recv().await {
                let mut buf = BytesMut::new();
                frame.encode(&mut buf);

                let delivered = peers
                    .read()
                    .get(&frame.identity)
                    .map(|it| it.send(buf.freeze()).is_ok())
                    .unwrap_or(false);

                if delivered {
                    gateway.statistics.frames_out.add(1);
                    log::trace!(
                        "bus send: dealer={:?}, command={}",
                        frame.identity,
                        frame.command.as_str()
                    );
                } else {
                    gateway.statistics.send_failures.add(1);
                    log::warn!(
                        "bus send failed, no connected peer: dealer={:?}, command={}",
                        frame.identity,
                        frame.command.as_str()
                    );

                    // A failed send is a protocol error on the affected
                    // session; the bus itself stays up. An undeliverable
                    // `end` needs no close, that session is already on its
                    // way out.
                    if frame.command != Command::End {
                        if let Some(id) = frame.session {
                            gateway.service.close_session(id);
                        }
                    }
                }
            }
        });
    }

    tokio::spawn(async move {
        while let Ok((mut socket, address)) = listener.accept().await {
            log::info!("bus peer connect: addr={address:?}, interface={local_addr:?}");

            if let Err(e) = socket.set_nodelay(true) {
                log::error!("bus peer set nodelay failed!: addr={address}, err={e}");
            }

            let gateway = gateway.clone();
            let peers = peers.clone();

            tokio::spawn(async move {
                let (writer, mut outbox) = unbounded_channel::<Bytes>();
                let mut identity: Option<Bytes> = None;
                let mut buf = BytesMut::with_capacity(8192);

                'a: loop {
                    tokio::select! {
                        result = socket.read_buf(&mut buf) => {
                            match result {
                                Ok(0) | Err(_) => break,
                                Ok(_) => {}
                            }

                            loop {
                                let size = match Decoder::message_size(&buf) {
                                    Ok(size) => size,
                                    Err(codec::Error::Incomplete) => break,
                                    Err(e) => {
                                        log::warn!("bus peer framing error: addr={address:?}, err={e}");
                                        break 'a;
                                    }
                                };

                                let chunk = buf.split_to(size);
                                let frame = match Decoder::decode(&chunk) {
                                    Ok(frame) => frame,
                                    Err(e) => {
                                        log::warn!("bus peer envelope error: addr={address:?}, err={e}");
                                        break 'a;
                                    }
                                };

                                gateway.statistics.frames_in.add(1);

                                // First traffic from a peer (or an identity
                                // change) registers it for outbound sends.
                                if identity.as_ref() != Some(&frame.identity) {
                                    peers.write().insert(frame.identity.clone(), writer.clone());
                                    identity = Some(frame.identity.clone());
                                }

                                handle(&gateway, &writer, frame);
                            }
                        }
                        Some(bytes) = outbox.recv() => {
                            if socket.write_all(&bytes).await.is_err() {
                                break;
                            }
                        }
                    }
                }

                // Unregister, unless a reconnected peer already took the
                // identity over.
                if let Some(identity) = identity {
                    let mut peers = peers.write();
                    if peers
                        .get(&identity)
                        .map(|it| it.same_channel(&writer))
                        .unwrap_or(false)
                    {
                        peers.remove(&identity);
                    }
                }

                log::info!("bus peer disconnect: addr={address:?}");
            });
        }

        log::error!("bus listener close: interface={local_addr:?}");
    });

    log::info!("bus router listening: listen={}", config.bus);

    Ok(())
}

fn handle(gateway: &Gateway, writer: &UnboundedSender<Bytes>, frame: Frame) {
    // Every inbound frame refreshes the dealer's liveness, whatever it
    // carries; this is also what brings a demoted dealer back.
    if gateway.service.touch_dealer(&frame.identity).is_none() {
        log::warn!("bus frame from unknown dealer: identity={:?}", frame.identity);
        return;
    }

    match frame.command {
        Command::Pong => {}
        Command::Ping => {
            let pong = Frame {
                identity: frame.identity,
                session: None,
                command: Command::Pong,
                payload: Bytes::new(),
            };

            let _ = writer.send(pong.to_bytes());
        }
        _ => proto::deliver(gateway, frame),
    }
}
