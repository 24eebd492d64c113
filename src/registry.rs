//! Process-wide mapping state: the active-mapping table and the router cache.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::adapter::Adapter;
use crate::mapping::{MappingKey, MappingRecord};
use crate::util::AbortOnDropHandle;

/// How a registered mapping is kept alive once its current lease runs out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Regime {
    /// Re-request with lifetime zero forever (indefinite PMP/PCP mappings).
    Perpetual,
    /// Re-request the un-granted remainder of the caller's lease.
    Finite {
        /// Seconds of the requested lease not covered by the current grant.
        remaining: u32,
    },
    /// The grant covers the whole request; evict when the lease elapses.
    Expire,
    /// Permanent static mapping (UPnP with lifetime zero); no timer.
    Static,
}

/// One row of the active-mapping table.
#[derive(Debug)]
pub(crate) struct ActiveEntry {
    /// The granted mapping.
    pub record: MappingRecord,
    /// The adapter that created the mapping and knows how to delete it.
    pub adapter: Arc<dyn Adapter>,
    /// Renewal plan for the current lease.
    pub regime: Regime,
    /// Armed renewal timer. Dropping the entry cancels it.
    pub timer: Option<AbortOnDropHandle<()>>,
}

/// Active mappings keyed by their external identity.
///
/// Only the service actor touches this, which serializes all writes; readers
/// get cloned snapshots.
#[derive(Debug, Default)]
pub(crate) struct Registry {
    active: HashMap<MappingKey, ActiveEntry>,
}

impl Registry {
    /// Registers `entry` under `key`, returning the entry it replaced, if any.
    pub fn insert(&mut self, key: MappingKey, entry: ActiveEntry) -> Option<ActiveEntry> {
        self.active.insert(key, entry)
    }

    pub fn remove(&mut self, key: &MappingKey) -> Option<ActiveEntry> {
        self.active.remove(key)
    }

    pub fn get(&self, key: &MappingKey) -> Option<&ActiveEntry> {
        self.active.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = MappingKey> + '_ {
        self.active.keys().copied()
    }

    pub fn snapshot(&self) -> Vec<MappingRecord> {
        self.active.values().map(|entry| entry.record.clone()).collect()
    }

    pub fn drain(&mut self) -> Vec<ActiveEntry> {
        self.active.drain().map(|(_, entry)| entry).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.active.len()
    }
}

/// Gateways that have answered before, most recent first.
///
/// Members are promoted to the front of the matched wave on every dispatch, so
/// after the first success the LAN is no longer sprayed with candidates.
#[derive(Debug, Clone, Default)]
pub(crate) struct RouterCache {
    inner: Arc<Mutex<Vec<Ipv4Addr>>>,
}

impl RouterCache {
    pub fn snapshot(&self) -> Vec<Ipv4Addr> {
        self.inner.lock().clone()
    }

    /// Records `ip` as a responding gateway, moving it to the front.
    pub fn promote(&self, ip: Ipv4Addr) {
        let mut routers = self.inner.lock();
        routers.retain(|known| *known != ip);
        routers.insert(0, ip);
    }

    #[cfg(test)]
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.inner.lock().contains(&ip)
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU16;

    use super::*;
    use crate::mapping::Protocol;
    use crate::test_utils::StubAdapter;

    fn record(external_ip: Ipv4Addr, external_port: u16) -> MappingRecord {
        MappingRecord {
            protocol: Protocol::NatPmp,
            internal_port: NonZeroU16::new(4000).unwrap(),
            external_port,
            internal_ip: Ipv4Addr::new(192, 168, 1, 20),
            external_ip: Some(external_ip),
            router_ip: Ipv4Addr::new(192, 168, 1, 1),
            lifetime: 7200,
            requested_lifetime: 7200,
            nonce: None,
            error_info: None,
        }
    }

    fn entry(external_ip: Ipv4Addr, external_port: u16) -> ActiveEntry {
        ActiveEntry {
            record: record(external_ip, external_port),
            adapter: Arc::new(StubAdapter::failing(Protocol::NatPmp)),
            regime: Regime::Expire,
            timer: None,
        }
    }

    #[test]
    fn external_identity_is_unique() {
        let mut registry = Registry::default();
        let ip = Ipv4Addr::new(1, 2, 3, 4);
        let key = MappingKey {
            external_ip: ip,
            external_port: 4000,
        };

        assert!(registry.insert(key, entry(ip, 4000)).is_none());
        // same identity replaces rather than duplicating
        assert!(registry.insert(key, entry(ip, 4000)).is_some());
        assert_eq!(registry.len(), 1);

        // same port behind another external address coexists
        let other = MappingKey {
            external_ip: Ipv4Addr::new(5, 6, 7, 8),
            external_port: 4000,
        };
        assert!(registry
            .insert(other, entry(other.external_ip, 4000))
            .is_none());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn remove_clears_the_row() {
        let mut registry = Registry::default();
        let ip = Ipv4Addr::new(1, 2, 3, 4);
        let key = MappingKey {
            external_ip: ip,
            external_port: 4000,
        };
        registry.insert(key, entry(ip, 4000));

        assert!(registry.remove(&key).is_some());
        assert!(registry.remove(&key).is_none());
        assert!(registry.snapshot().is_empty());
    }

    #[test]
    fn cache_promotes_to_front() {
        let cache = RouterCache::default();
        cache.promote(Ipv4Addr::new(192, 168, 1, 1));
        cache.promote(Ipv4Addr::new(10, 0, 0, 1));
        cache.promote(Ipv4Addr::new(192, 168, 1, 1));

        assert_eq!(
            cache.snapshot(),
            vec![Ipv4Addr::new(192, 168, 1, 1), Ipv4Addr::new(10, 0, 0, 1)]
        );
    }
}
