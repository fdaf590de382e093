//! ## Session/dealer orchestration core
//!
//! Everything the gateway knows that is not I/O lives here: the session
//! table, the per-connection session lists, the dealer pool with its load
//! and liveness accounting, virtual-host routing, and group membership.
//!
//! The crate performs no I/O of its own. Operations that require a frame to
//! be sent on the bus (the `end` frame on close, liveness probes) either
//! return the frames to the caller or report them through the
//! [`ServiceHandler`] trait, so the whole core can be driven and verified in
//! memory.

pub mod dealer;
pub mod session;
pub mod vhost;

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use ahash::AHashMap;
use bytes::Bytes;
use codec::SessionId;
use parking_lot::Mutex;
use rand::Rng;

use self::{
    dealer::Dealer,
    session::{Session, SessionTable, Timer},
    vhost::{Acceptor, Vhost},
};

/// Identifies a client connection for the lifetime of the process.
pub type ConnId = u64;

/// Callbacks for effects the core cannot perform itself.
///
/// The gateway's observer implements this to forward `end` frames onto the
/// bus and to keep logs and statistics; tests implement it to capture the
/// event stream.
pub trait ServiceHandler: Send + Sync {
    /// A session that had incremented a dealer's load is definitively
    /// closing; exactly one `end` frame must reach that dealer.
    #[allow(unused_variables)]
    fn on_end(&self, dealer: &Dealer, id: SessionId) {}

    #[allow(unused_variables)]
    fn on_session_open(&self, id: SessionId) {}

    /// The session was removed from the table and freed.
    #[allow(unused_variables)]
    fn on_session_close(&self, id: SessionId) {}

    /// A dealer went silent for too long and was demoted.
    #[allow(unused_variables)]
    fn on_dealer_off(&self, dealer: &Dealer) {}

    /// Traffic arrived from a demoted dealer; it is available again.
    #[allow(unused_variables)]
    fn on_dealer_available(&self, dealer: &Dealer) {}
}

#[derive(Debug, Clone)]
pub struct AcceptorConfig {
    pub name: String,
    /// Shared acceptors pick up every virtual host that declares no
    /// explicit binding.
    pub shared: bool,
}

#[derive(Debug, Clone)]
pub struct VhostConfig {
    pub name: String,
    /// Dealer names, in routing preference order.
    pub dealers: Vec<String>,
    /// Names of the acceptors this vhost explicitly binds to; empty means
    /// "all shared acceptors".
    pub acceptors: Vec<String>,
}

pub struct ServiceOptions<T> {
    /// Session table bucket count, rounded up to a power of two.
    pub sht_size: usize,
    /// Liveness probe interval in seconds.
    pub ping_freq: u64,
    /// Idle deadline for persistent sessions, in seconds.
    pub session_timeout: u64,
    pub acceptors: Vec<AcceptorConfig>,
    pub vhosts: Vec<VhostConfig>,
    pub handler: T,
}

/// Result of a delivery-timer tick for a persistent session.
pub struct PushPoll {
    /// The dequeued message, or `None` for an empty-frame heartbeat.
    pub message: Option<Bytes>,
    /// Where to deliver, if the session currently has a connection.
    pub connection: Option<ConnId>,
}

/// The orchestration core.
///
/// # Example
///
/// ```
/// use gateway_server_service::*;
///
/// #[derive(Clone)]
/// struct Handler;
///
/// impl ServiceHandler for Handler {}
///
/// let service = Service::new(ServiceOptions {
///     sht_size: 64,
///     ping_freq: 3,
///     session_timeout: 30,
///     acceptors: vec![AcceptorConfig {
///         name: "main".to_string(),
///         shared: true,
///     }],
///     vhosts: vec![VhostConfig {
///         name: "a.example".to_string(),
///         dealers: vec!["worker-1".to_string()],
///         acceptors: vec![],
///     }],
///     handler: Handler,
/// });
///
/// service.fixup();
///
/// let acceptor = service.acceptor("main").unwrap();
/// let session = service.open_session(1);
///
/// let dealer = service
///     .assign_dealer(&session, &acceptor, "A.EXAMPLE")
///     .unwrap();
///
/// assert_eq!(dealer.name(), "worker-1");
/// assert_eq!(dealer.load(), 1);
///
/// service.close_session(session.id());
/// assert_eq!(dealer.load(), 0);
/// assert_eq!(service.active_sessions(), 0);
/// ```
pub struct Service<T> {
    table: SessionTable,
    dealers: Vec<Dealer>,
    vhosts: Vec<Vhost>,
    acceptors: Vec<Acceptor>,
    /// Vhost → explicit acceptor names, the fixup input.
    bindings: Vec<(Vhost, Vec<String>)>,
    connections: Mutex<AHashMap<ConnId, Vec<SessionId>>>,
    groups: Mutex<AHashMap<String, Vec<SessionId>>>,
    timer: Timer,
    active: AtomicUsize,
    ping_freq: u64,
    session_timeout: u64,
    handler: T,
}

impl<T> Service<T>
where
    T: ServiceHandler + 'static,
{
    pub fn new(options: ServiceOptions<T>) -> Arc<Self> {
        // The dealer pool is the union of every vhost's dealer list, in
        // first-appearance order, and is fixed for the process lifetime.
        let mut dealers: Vec<Dealer> = Vec::new();
        for vhost in &options.vhosts {
            for name in &vhost.dealers {
                if !dealers.iter().any(|it| it.name() == name) {
                    dealers.push(Dealer::new(name, 0));
                }
            }
        }

        let vhosts: Vec<Vhost> = options
            .vhosts
            .iter()
            .map(|cfg| {
                Vhost::new(
                    &cfg.name,
                    cfg.dealers
                        .iter()
                        .filter_map(|name| dealers.iter().find(|it| it.name() == name).cloned())
                        .collect(),
                )
            })
            .collect();

        let bindings = vhosts
            .iter()
            .cloned()
            .zip(options.vhosts.iter().map(|cfg| cfg.acceptors.clone()))
            .collect();

        let this = Arc::new(Self {
            table: SessionTable::new(options.sht_size),
            acceptors: options
                .acceptors
                .iter()
                .map(|cfg| Acceptor::new(&cfg.name, cfg.shared))
                .collect(),
            dealers,
            vhosts,
            bindings,
            connections: Mutex::new(AHashMap::new()),
            groups: Mutex::new(AHashMap::new()),
            timer: Timer::default(),
            active: AtomicUsize::new(0),
            ping_freq: options.ping_freq.max(1),
            session_timeout: options.session_timeout.max(1),
            handler: options.handler,
        });

        // Background tick: advances the clock once per second and evicts
        // idle persistent sessions. Stops when the last service handle is
        // dropped.
        let this_ = Arc::downgrade(&this);
        thread::spawn(move || {
            while let Some(this) = this_.upgrade() {
                let now = this.timer.add();
                this.evict_expired(now);

                drop(this);
                thread::sleep(Duration::from_secs(1));
            }
        });

        this
    }

    pub fn timer(&self) -> &Timer {
        &self.timer
    }

    pub fn active_sessions(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.table
    }

    pub fn dealers(&self) -> &[Dealer] {
        &self.dealers
    }

    pub fn vhosts(&self) -> &[Vhost] {
        &self.vhosts
    }

    pub fn acceptors(&self) -> &[Acceptor] {
        &self.acceptors
    }

    pub fn acceptor(&self, name: &str) -> Option<Acceptor> {
        self.acceptors.iter().find(|it| it.name() == name).cloned()
    }

    pub fn dealer(&self, identity: &[u8]) -> Option<Dealer> {
        self.dealers
            .iter()
            .find(|it| it.identity().as_ref() == identity)
            .cloned()
    }

    /// Bind virtual hosts to acceptors: explicit bindings first, then every
    /// unbound vhost joins every shared acceptor. Idempotent; running it
    /// twice never produces duplicates.
    pub fn fixup(&self) {
        for (vhost, names) in &self.bindings {
            for name in names {
                if let Some(acceptor) = self.acceptor(name) {
                    acceptor.push_vhost(vhost);
                }
            }
        }

        for (vhost, names) in &self.bindings {
            if names.is_empty() {
                for acceptor in self.acceptors.iter().filter(|it| it.shared()) {
                    acceptor.push_vhost(vhost);
                }
            }
        }
    }

    /// Allocate a session attached to `connection`, keyed by a fresh random
    /// id, and register it in the table and the connection's session list.
    pub fn open_session(&self, connection: ConnId) -> Arc<Session> {
        let mut rng = rand::rng();
        let id = SessionId(rng.random(), rng.random());

        let session = Arc::new(Session::new(
            id,
            connection,
            self.timer.get() + self.session_timeout,
        ));

        self.table.insert(session.clone());
        self.connections
            .lock()
            .entry(connection)
            .or_default()
            .push(id);

        self.active.fetch_add(1, Ordering::Relaxed);
        self.handler.on_session_open(id);
        session
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.table.get(&id)
    }

    /// Close a session.
    ///
    /// Idempotent. Non-persistent sessions leave the table, leave their
    /// groups, decrement their dealer's load and emit exactly one `end`
    /// frame (unless stealth), and are freed. Persistent sessions are only
    /// detached from their connection and stay in the table.
    pub fn close_session(&self, id: SessionId) {
        let Some(session) = self.table.get(&id) else {
            return;
        };

        let (persistent, connection, dealer, stealth, groups) = {
            let mut inner = session.lock();
            if inner.closed {
                return;
            }

            let persistent = inner.persistent;
            if !persistent {
                inner.closed = true;
            }

            inner.request.reset();
            inner.push_queue.clear();

            let connection = inner.connection.take();
            let (dealer, groups) = if persistent {
                (None, Vec::new())
            } else {
                inner.sio_queue.clear();
                inner.timer_armed = false;
                (inner.dealer.take(), std::mem::take(&mut inner.groups))
            };

            (persistent, connection, dealer, inner.stealth, groups)
        };

        if !persistent {
            self.table.remove(&id);
        }

        for group in &groups {
            self.leave_group(group, id);
        }

        if let Some(dealer) = dealer {
            if !stealth {
                dealer.dec_load();
                self.handler.on_end(&dealer, id);
            }
        }

        if let Some(connection) = connection {
            if let Some(list) = self.connections.lock().get_mut(&connection) {
                list.retain(|it| *it != id);
            }
        }

        if !persistent {
            self.active.fetch_sub(1, Ordering::Relaxed);
            self.handler.on_session_close(id);
        }
    }

    /// Close every session attached to a connection, in insertion order.
    ///
    /// The list is snapshotted first: closing a session unlinks it from the
    /// very list being traversed.
    pub fn close_connection(&self, connection: ConnId) {
        let ids = self
            .connections
            .lock()
            .get(&connection)
            .cloned()
            .unwrap_or_default();

        for id in ids {
            self.close_session(id);
        }

        self.connections.lock().remove(&connection);
    }

    /// Re-attach a persistent session to a new connection and refresh its
    /// eviction deadline.
    pub fn attach_session(&self, id: SessionId, connection: ConnId) -> Option<Arc<Session>> {
        let session = self.table.get(&id)?;

        let previous = {
            let mut inner = session.lock();
            inner.expires = self.timer.get() + self.session_timeout;
            inner.connection.replace(connection)
        };

        let mut connections = self.connections.lock();
        if let Some(previous) = previous {
            if let Some(list) = connections.get_mut(&previous) {
                list.retain(|it| *it != id);
            }
        }

        connections.entry(connection).or_default().push(id);
        Some(session)
    }

    /// Upstream activity: push the session's eviction deadline out.
    pub fn touch_session(&self, id: SessionId) {
        if let Some(session) = self.table.get(&id) {
            session.lock().expires = self.timer.get() + self.session_timeout;
        }
    }

    /// Route a session to a dealer by the request's host name.
    ///
    /// Looks the host name up among the acceptor's virtual hosts, picks the
    /// least-loaded available dealer, and increments its load. Returns
    /// `None` when the host does not match or the vhost has no available
    /// dealer; the caller turns that into a user-visible error.
    pub fn assign_dealer(
        &self,
        session: &Session,
        acceptor: &Acceptor,
        host: &str,
    ) -> Option<Dealer> {
        let mut inner = session.lock();
        if let Some(dealer) = &inner.dealer {
            return Some(dealer.clone());
        }

        let vhost = acceptor.find_vhost(host)?;
        let dealer = vhost.least_loaded()?;

        dealer.inc_load();
        inner.dealer = Some(dealer.clone());
        inner.vhost = Some(vhost);
        Some(dealer)
    }

    /// Record an inbound frame from a dealer: refresh its last-seen tick
    /// and revive it if it had been demoted.
    pub fn touch_dealer(&self, identity: &[u8]) -> Option<Dealer> {
        let dealer = self.dealer(identity)?;

        dealer.touch(self.timer.get());
        if !dealer.is_available() {
            dealer.set_available(true);
            self.handler.on_dealer_available(&dealer);
        }

        Some(dealer)
    }

    /// One pinger tick: returns the identities to probe, demoting dealers
    /// that have been silent past three probe intervals.
    pub fn ping_sweep(&self) -> Vec<Bytes> {
        let now = self.timer.get();
        let mut probes = Vec::new();

        for dealer in &self.dealers {
            let delta = now.saturating_sub(dealer.last_seen());
            if delta > self.ping_freq {
                if delta > self.ping_freq * 3 && dealer.is_available() {
                    dealer.set_available(false);
                    self.handler.on_dealer_off(dealer);
                }

                probes.push(dealer.identity().clone());
            }
        }

        probes
    }

    pub fn join_group(&self, group: &str, id: SessionId) {
        let Some(session) = self.table.get(&id) else {
            return;
        };

        {
            let mut inner = session.lock();
            if inner.groups.iter().any(|it| it == group) {
                return;
            }

            inner.groups.push(group.to_string());
        }

        self.groups
            .lock()
            .entry(group.to_string())
            .or_default()
            .push(id);
    }

    pub fn leave_group(&self, group: &str, id: SessionId) {
        if let Some(session) = self.table.get(&id) {
            session.lock().groups.retain(|it| it != group);
        }

        let mut groups = self.groups.lock();
        if let Some(members) = groups.get_mut(group) {
            members.retain(|it| *it != id);
            if members.is_empty() {
                groups.remove(group);
            }
        }
    }

    pub fn group_members(&self, group: &str) -> Vec<SessionId> {
        self.groups.lock().get(group).cloned().unwrap_or_default()
    }

    /// Queue an outbound long-poll message and refresh the session's
    /// eviction deadline.
    ///
    /// Returns whether the session currently has a connection to deliver
    /// to, or `None` when it is gone entirely.
    pub fn queue_push(&self, id: SessionId, message: Bytes) -> Option<bool> {
        let session = self.table.get(&id)?;

        let mut inner = session.lock();
        inner.sio_queue.push_back(message);
        inner.expires = self.timer.get() + self.session_timeout;
        Some(inner.connection.is_some())
    }

    /// Arm the session's single-shot delivery timer.
    ///
    /// Returns true when the caller should start the timer; false when it
    /// is already pending or the session is gone. The timer is re-armed by
    /// upstream activity only, never by its own expiry.
    pub fn arm_timer(&self, id: SessionId) -> bool {
        match self.table.get(&id) {
            Some(session) => {
                let mut inner = session.lock();
                if inner.timer_armed {
                    false
                } else {
                    inner.timer_armed = true;
                    true
                }
            }
            None => false,
        }
    }

    /// The delivery timer fired: dequeue at most one pending message.
    ///
    /// `None` means the session is gone and the tick must be dropped; a
    /// poll with no queued message delivers an empty heartbeat frame.
    pub fn poll_push(&self, id: SessionId) -> Option<PushPoll> {
        let session = self.table.get(&id)?;
        let mut inner = session.lock();

        inner.timer_armed = false;
        Some(PushPoll {
            message: inner.sio_queue.pop_front(),
            connection: inner.connection,
        })
    }

    /// Definitively remove persistent sessions that have been idle past
    /// their deadline. Eviction accounts like a non-persistent close: the
    /// dealer load is decremented and one `end` frame is emitted.
    fn evict_expired(&self, now: u64) {
        let mut expired = Vec::new();

        self.table.scan(|session| {
            let inner = session.lock();
            if inner.persistent && !inner.closed && inner.expires <= now {
                expired.push(session.id());
            }
        });

        for id in expired {
            if let Some(session) = self.table.get(&id) {
                session.lock().persistent = false;
            }

            self.close_session(id);
        }
    }
}
