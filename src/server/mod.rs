mod tls;

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use ahash::AHashMap;
use anyhow::{Result, anyhow};
use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use service::ConnId;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpListener,
    sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
};

use crate::{
    Gateway,
    config::Config,
    proto::{self, Dispatch, spdy},
};

/// One entry on a connection's write queue.
///
/// A `Bytes` value owns or borrows its storage by itself, so there is no
/// separate ownership flag to get wrong; `Shutdown` closes the socket once
/// everything queued before it has been flushed.
pub enum WriteItem {
    Data(Bytes),
    Shutdown,
}

struct ConnectionHandle {
    sender: UnboundedSender<WriteItem>,
    spdy: Arc<Mutex<Option<spdy::Context>>>,
}

/// Registry of live connections.
///
/// Protocol hooks and the bus bridge address a connection by id and enqueue
/// bytes here; the connection's own task is the only writer to the socket,
/// so per-connection byte order is the queue order.
#[derive(Default, Clone)]
pub struct Exchanger(Arc<RwLock<AHashMap<ConnId, ConnectionHandle>>>);

impl Exchanger {
    pub fn register(&self, id: ConnId) -> UnboundedReceiver<WriteItem> {
        let (sender, receiver) = unbounded_channel();

        self.0.write().insert(
            id,
            ConnectionHandle {
                sender,
                spdy: Default::default(),
            },
        );

        receiver
    }

    pub fn send(&self, id: ConnId, bytes: Bytes) -> bool {
        self.0
            .read()
            .get(&id)
            .map(|it| it.sender.send(WriteItem::Data(bytes)).is_ok())
            .unwrap_or(false)
    }

    /// Close the connection after flushing everything already queued.
    pub fn shutdown(&self, id: ConnId) {
        if let Some(handle) = self.0.read().get(&id) {
            let _ = handle.sender.send(WriteItem::Shutdown);
        }
    }

    pub fn remove(&self, id: ConnId) {
        self.0.write().remove(&id);
    }

    /// The connection's framed-multiplexing compression state, created on
    /// first use.
    pub fn spdy(&self, id: ConnId) -> Option<Arc<Mutex<Option<spdy::Context>>>> {
        self.0.read().get(&id).map(|it| it.spdy.clone())
    }
}

// Connection ids are never reused within a process, so a stale id in a
// late bus frame can only miss, never hit a new client.
static CONN_IDS: AtomicU64 = AtomicU64::new(1);

fn next_conn_id() -> ConnId {
    CONN_IDS.fetch_add(1, Ordering::Relaxed)
}

/// Bind every configured acceptor and start serving.
pub async fn start(config: &Config, gateway: &Gateway) -> Result<()> {
    for bind in &config.bind {
        let acceptor = gateway
            .service
            .acceptor(&bind.name())
            .ok_or_else(|| anyhow!("unknown acceptor: {:?}", bind.name()))?;

        let listener = TcpListener::bind(bind.listen).await?;

        log::info!(
            "acceptor {:?} listening: listen={}, tls={}, shared={}",
            bind.name(),
            bind.listen,
            bind.is_tls(),
            bind.shared,
        );
        for vhost in acceptor.vhosts() {
            log::info!("  vhost: {}", vhost.name());
        }

        if bind.is_tls() {
            let tls = tls::acceptor(config, bind, &acceptor.vhosts())?;
            tokio::spawn(tls::listener(listener, tls, gateway.clone(), acceptor));
        } else {
            tokio::spawn(plain_listener(listener, gateway.clone(), acceptor));
        }
    }

    Ok(())
}

async fn plain_listener(
    listener: TcpListener,
    gateway: Gateway,
    acceptor: service::vhost::Acceptor,
) {
    let local_addr = match listener.local_addr() {
        Ok(it) => it,
        Err(_) => return,
    };

    while let Ok((socket, address)) = listener.accept().await {
        // any received byte should reach its dealer as soon as possible
        if let Err(e) = socket.set_nodelay(true) {
            log::error!("socket set nodelay failed!: addr={address}, err={e}");
        }

        let conn = next_conn_id();
        log::info!("socket accept: addr={address:?}, interface={local_addr:?}, conn={conn}");

        tokio::spawn(drive(gateway.clone(), acceptor.clone(), conn, address, socket));
    }

    log::error!("acceptor close: interface={local_addr:?}");
}

/// Drive one client connection to completion.
///
/// The select loop is the connection's whole life: bytes read go to the
/// current protocol function, queued write items flush in order, and any
/// error or EOF falls through to the teardown, which closes every attached
/// session (persistent ones detach instead).
pub(crate) async fn drive<S>(
    gateway: Gateway,
    acceptor: service::vhost::Acceptor,
    conn: ConnId,
    address: SocketAddr,
    mut stream: S,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut receiver = gateway.exchanger.register(conn);
    gateway.statistics.connections.inc();

    let mut state = proto::ConnState::new(gateway.clone(), acceptor, conn, address);
    let mut buf = BytesMut::with_capacity(8192);

    loop {
        tokio::select! {
            result = stream.read_buf(&mut buf) => {
                match result {
                    Ok(0) | Err(_) => break,
                    Ok(size) => {
                        log::trace!("socket receive: size={size}, addr={address:?}");

                        if let Dispatch::Close = state.on_bytes(&mut buf) {
                            break;
                        }
                    }
                }
            }
            item = receiver.recv() => {
                match item {
                    Some(WriteItem::Data(bytes)) => {
                        if stream.write_all(&bytes).await.is_err() {
                            break;
                        }

                        log::trace!("socket send: size={}, addr={address:?}", bytes.len());
                    }
                    Some(WriteItem::Shutdown) => {
                        let _ = stream.shutdown().await;
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    gateway.exchanger.remove(conn);

    // closes the sessions in list order: non-persistent ones emit their
    // `end` frame and are freed, persistent ones are merely detached
    gateway.service.close_connection(conn);
    gateway.statistics.connections.dec();

    log::info!("socket disconnect: addr={address:?}, conn={conn}");
}
