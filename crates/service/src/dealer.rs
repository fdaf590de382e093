use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
};

use bytes::Bytes;

struct DealerInner {
    name: String,
    identity: Bytes,
    load: AtomicUsize,
    last_seen: AtomicU64,
    available: AtomicBool,
}

/// A named backend peer on the message bus.
///
/// The handle is cheap to clone; all mutable state is atomic, so load
/// accounting and liveness never contend with the session table locks.
/// `load` counts the live sessions currently routed to the dealer that have
/// not yet emitted their `end` frame.
#[derive(Clone)]
pub struct Dealer(Arc<DealerInner>);

impl Dealer {
    pub(crate) fn new(name: &str, last_seen: u64) -> Self {
        Self(Arc::new(DealerInner {
            name: name.to_string(),
            identity: Bytes::from(name.as_bytes().to_vec()),
            load: AtomicUsize::new(0),
            last_seen: AtomicU64::new(last_seen),
            available: AtomicBool::new(true),
        }))
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// The opaque routing prefix used to address this dealer on the bus.
    pub fn identity(&self) -> &Bytes {
        &self.0.identity
    }

    pub fn load(&self) -> usize {
        self.0.load.load(Ordering::Relaxed)
    }

    pub fn is_available(&self) -> bool {
        self.0.available.load(Ordering::Relaxed)
    }

    pub fn set_available(&self, available: bool) {
        self.0.available.store(available, Ordering::Relaxed);
    }

    pub fn last_seen(&self) -> u64 {
        self.0.last_seen.load(Ordering::Relaxed)
    }

    pub(crate) fn touch(&self, tick: u64) {
        self.0.last_seen.store(tick, Ordering::Relaxed);
    }

    pub(crate) fn inc_load(&self) {
        self.0.load.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dec_load(&self) {
        self.0.load.fetch_sub(1, Ordering::Relaxed);
    }
}

impl PartialEq for Dealer {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Dealer {}

impl std::fmt::Debug for Dealer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dealer")
            .field("name", &self.0.name)
            .field("load", &self.load())
            .field("available", &self.is_available())
            .finish()
    }
}
