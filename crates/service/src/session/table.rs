use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use codec::SessionId;
use parking_lot::RwLock;

use super::Session;

/// The process-wide session index.
///
/// A fixed bucket array sized once at startup (rounded up to a power of
/// two), with separate chaining per bucket. The bucket is selected from the
/// first 64-bit word of the session id, which is also the word sent first on
/// the wire.
pub struct SessionTable {
    mask: u64,
    buckets: Box<[RwLock<Vec<Arc<Session>>>]>,
    len: AtomicUsize,
}

impl SessionTable {
    pub fn new(size: usize) -> Self {
        let size = size.max(2).next_power_of_two();

        Self {
            mask: (size - 1) as u64,
            buckets: (0..size).map(|_| RwLock::new(Vec::new())).collect(),
            len: AtomicUsize::new(0),
        }
    }

    pub fn size(&self) -> usize {
        self.buckets.len()
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn insert(&self, session: Arc<Session>) {
        let mut bucket = self.buckets[session.id().bucket(self.mask)].write();

        bucket.push(session);
        self.len.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.buckets[id.bucket(self.mask)]
            .read()
            .iter()
            .find(|it| it.id() == *id)
            .cloned()
    }

    pub fn remove(&self, id: &SessionId) -> Option<Arc<Session>> {
        let mut bucket = self.buckets[id.bucket(self.mask)].write();

        let index = bucket.iter().position(|it| it.id() == *id)?;
        self.len.fetch_sub(1, Ordering::Relaxed);
        Some(bucket.swap_remove(index))
    }

    /// Visit every session in the table.
    ///
    /// The per-bucket lock is held while its chain is visited, so `f` must
    /// not call back into the table.
    pub fn scan(&self, mut f: impl FnMut(&Arc<Session>)) {
        for bucket in self.buckets.iter() {
            for session in bucket.read().iter() {
                f(session);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collisions_stay_retrievable() {
        // more sessions than buckets, all landing somewhere in a 16-slot
        // table, every one of them must remain reachable
        let table = SessionTable::new(16);

        let ids: Vec<_> = (0..64u64).map(|i| SessionId(i, i.wrapping_mul(7))).collect();
        for id in &ids {
            table.insert(Arc::new(Session::new(*id, 1, 0)));
        }

        assert_eq!(table.len(), 64);
        for id in &ids {
            assert_eq!(table.get(id).unwrap().id(), *id);
        }

        assert!(table.remove(&ids[3]).is_some());
        assert!(table.get(&ids[3]).is_none());
        assert_eq!(table.len(), 63);
    }

    #[test]
    fn size_rounds_up_to_power_of_two() {
        assert_eq!(SessionTable::new(1000).size(), 1024);
        assert_eq!(SessionTable::new(65536).size(), 65536);
    }
}
