use std::{
    ops::Deref,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

/// Monotonic counter.
#[derive(Default)]
pub struct Count(AtomicUsize);

impl Count {
    pub fn add(&self, value: usize) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

/// Up/down counter for live object counts.
#[derive(Default)]
pub struct Gauge(AtomicUsize);

impl Gauge {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

pub struct Counts {
    /// Live client connections.
    pub connections: Gauge,
    /// Envelopes received from dealers.
    pub frames_in: Count,
    /// Envelopes sent to dealers.
    pub frames_out: Count,
    /// Inbound envelopes addressed to a session no longer in the table.
    pub frames_dropped: Count,
    /// Envelopes that could not be delivered to any connected dealer peer.
    pub send_failures: Count,
}

impl Default for Counts {
    fn default() -> Self {
        Self {
            connections: Gauge::default(),
            frames_in: Count::default(),
            frames_out: Count::default(),
            frames_dropped: Count::default(),
            send_failures: Count::default(),
        }
    }
}

/// Process-wide traffic counters, shared by every worker task.
///
/// # Example
///
/// ```
/// use gateway_server::statistics::Statistics;
///
/// let statistics = Statistics::default();
///
/// statistics.frames_in.add(1);
/// assert_eq!(statistics.frames_in.get(), 1);
///
/// statistics.connections.inc();
/// statistics.connections.dec();
/// assert_eq!(statistics.connections.get(), 0);
/// ```
#[derive(Default, Clone)]
pub struct Statistics(Arc<Counts>);

impl Deref for Statistics {
    type Target = Counts;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}
