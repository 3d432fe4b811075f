//! Component A: the in-memory index of authoritative zone origins.
//!
//! The index itself only answers "which origin, if any, is
//! authoritative for this name" - the records live in the external
//! store (see `record_store`). It is rebuilt wholesale by the reload
//! controller and swapped in atomically, so in-flight queries always
//! see a internally-consistent snapshot.

use std::sync::{Arc, RwLock};

use dns_types::protocol::types::DomainName;
use dns_types::zones::types::Zones;

/// A `Zones` index that can be atomically swapped for a new snapshot
/// while queries are in flight.
///
/// Cloning a `ZoneIndex` is cheap and gives a handle to the same
/// underlying index - readers call `snapshot` once per query and work
/// from the `Arc<Zones>` they get back, so a concurrent reload can
/// never yield inconsistent results partway through handling a single
/// question.
#[derive(Debug, Clone)]
pub struct ZoneIndex {
    inner: Arc<RwLock<Arc<Zones>>>,
}

impl ZoneIndex {
    pub fn new(zones: Zones) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(zones))),
        }
    }

    /// Pin the current snapshot for use during a single query.
    ///
    /// # Panics
    ///
    /// If the lock has been poisoned.
    pub fn snapshot(&self) -> Arc<Zones> {
        self.inner
            .read()
            .expect("zone index lock poisoned")
            .clone()
    }

    /// Atomically replace the index with a freshly-built snapshot.
    ///
    /// # Panics
    ///
    /// If the lock has been poisoned.
    pub fn swap(&self, zones: Zones) {
        *self.inner.write().expect("zone index lock poisoned") = Arc::new(zones);
    }

    /// Find the most specific authoritative origin for `name`, if any.
    ///
    /// # Panics
    ///
    /// If the lock has been poisoned.
    pub fn find(&self, name: &DomainName) -> Option<DomainName> {
        self.snapshot().find(name).cloned()
    }
}

impl Default for ZoneIndex {
    fn default() -> Self {
        Self::new(Zones::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dns_types::protocol::types::test_util::domain;

    #[test]
    fn snapshot_reflects_latest_swap() {
        let index = ZoneIndex::new(Zones::from_origins([domain("example.com.")]));
        assert_eq!(Some(domain("example.com.")), index.find(&domain("www.example.com.")));

        index.swap(Zones::from_origins([domain("example.org.")]));
        assert_eq!(None, index.find(&domain("www.example.com.")));
        assert_eq!(Some(domain("example.org.")), index.find(&domain("example.org.")));
    }

    #[test]
    fn concurrent_readers_see_a_consistent_snapshot() {
        let index = ZoneIndex::new(Zones::from_origins([domain("a.test.")]));
        let pinned = index.snapshot();

        index.swap(Zones::from_origins([domain("b.test.")]));

        assert!(pinned.contains(&domain("a.test.")));
        assert!(index.snapshot().contains(&domain("b.test.")));
    }
}
