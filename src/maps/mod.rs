//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! The map registry (design §4.1): typed CRUD over the six kernel-resident
//! forwarding maps plus the interface-index and error-counter bookkeeping
//! maps. All map operations are issued only from the coordinator's executor.

pub mod kernel;
pub mod keys;
pub mod mem;

use std::fmt;

use crate::error::{Error, MapOp};
pub use keys::{
    DevMapKey, DevMapValue, Downstream6Key, ErrorReasonKey, LimitKey,
    LimitValue, StatsKey, StatsValue, Tether4Key, Tether4Value, Tether6Value,
    Upstream6Key,
};

/// Identifies one of the eight kernel maps, for logging and error-counter
/// attribution.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MapName {
    Downstream4,
    Upstream4,
    Downstream6,
    Upstream6,
    Stats,
    Limit,
    DevIndex,
    ErrorCounter,
}

impl fmt::Display for MapName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MapName::Downstream4 => "tether_downstream4",
            MapName::Upstream4 => "tether_upstream4",
            MapName::Downstream6 => "tether_downstream6",
            MapName::Upstream6 => "tether_upstream6",
            MapName::Stats => "tether_stats",
            MapName::Limit => "tether_limit",
            MapName::DevIndex => "tether_dev_index",
            MapName::ErrorCounter => "tether_error_counter",
        };
        f.write_str(name)
    }
}

/// Capability set over a single kernel map, uniform across all eight maps
/// (design §9: "a single capability set instead of deep inheritance").
///
/// Implementations: [`kernel::BpfMap`] backed by real `aya` BPF maps, and
/// [`mem::MemMap`], an in-memory stand-in injected by tests.
pub trait KernelMap<K, V>: fmt::Debug + Send {
    fn insert(&mut self, key: K, value: V) -> Result<(), Error>;
    fn update(&mut self, key: K, value: V) -> Result<(), Error>;
    fn delete(&mut self, key: &K) -> Result<(), Error>;
    fn get(&self, key: &K) -> Option<V>;
    fn for_each(&self, f: &mut dyn FnMut(&K, &V));
    fn clear(&mut self);
    fn len(&self) -> usize;
}

/// A [`KernelMap`] that silently discards every mutation and never holds any
/// entry. Installed for every map slot when the registry is degraded (design
/// §4.1): "every mutating call becomes a no-op".
#[derive(Debug, Default)]
pub struct NullMap;

impl<K: fmt::Debug + Send, V: fmt::Debug + Send> KernelMap<K, V> for NullMap {
    fn insert(&mut self, _key: K, _value: V) -> Result<(), Error> {
        Ok(())
    }

    fn update(&mut self, _key: K, _value: V) -> Result<(), Error> {
        Ok(())
    }

    fn delete(&mut self, _key: &K) -> Result<(), Error> {
        Ok(())
    }

    fn get(&self, _key: &K) -> Option<V> {
        None
    }

    fn for_each(&self, _f: &mut dyn FnMut(&K, &V)) {}

    fn clear(&mut self) {}

    fn len(&self) -> usize {
        0
    }
}

type BoxMap<K, V> = Box<dyn KernelMap<K, V>>;

/// The full registry of kernel maps owned by the coordinator.
#[derive(Debug)]
pub struct Maps {
    degraded: bool,
    pub downstream4: BoxMap<Tether4Key, Tether4Value>,
    pub upstream4: BoxMap<Tether4Key, Tether4Value>,
    pub downstream6: BoxMap<Downstream6Key, Tether6Value>,
    pub upstream6: BoxMap<Upstream6Key, Tether6Value>,
    pub stats: BoxMap<StatsKey, StatsValue>,
    pub limit: BoxMap<LimitKey, LimitValue>,
    pub dev_index: BoxMap<DevMapKey, DevMapValue>,
    pub error_counter: BoxMap<ErrorReasonKey, u64>,
}

// ===== impl Maps =====

impl Maps {
    /// Builds a registry backed entirely by [`NullMap`]s: the permanent
    /// degraded mode entered when one or more kernel maps can't be opened
    /// (design §4.1).
    pub fn degraded() -> Maps {
        Maps {
            degraded: true,
            downstream4: Box::new(NullMap),
            upstream4: Box::new(NullMap),
            downstream6: Box::new(NullMap),
            upstream6: Box::new(NullMap),
            stats: Box::new(NullMap),
            limit: Box::new(NullMap),
            dev_index: Box::new(NullMap),
            error_counter: Box::new(NullMap),
        }
    }

    /// Builds a registry backed by in-memory maps, for tests.
    pub fn in_memory() -> Maps {
        Maps {
            degraded: false,
            downstream4: Box::new(mem::MemMap::new()),
            upstream4: Box::new(mem::MemMap::new()),
            downstream6: Box::new(mem::MemMap::new()),
            upstream6: Box::new(mem::MemMap::new()),
            stats: Box::new(mem::MemMap::new()),
            limit: Box::new(mem::MemMap::new()),
            dev_index: Box::new(mem::MemMap::new()),
            error_counter: Box::new(mem::MemMap::new()),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Clears every map. Called once on startup (design §4.1).
    pub fn clear_all(&mut self) {
        self.downstream4.clear();
        self.upstream4.clear();
        self.downstream6.clear();
        self.upstream6.clear();
        self.stats.clear();
        self.limit.clear();
        self.dev_index.clear();
        self.error_counter.clear();
    }

    /// Bumps the error-counter map entry for `reason`, ignoring the (rare)
    /// failure of the bump itself.
    pub fn record_error(&mut self, reason: ErrorReasonKey) {
        let count = self.error_counter.get(&reason).unwrap_or(0);
        let _ = self.error_counter.update(reason, count + 1);
    }

    /// Idempotently records that `ifindex` is now referenced by at least one
    /// rule (invariant I4).
    pub fn dev_index_ensure(&mut self, ifindex: u32) {
        let key = DevMapKey { ifindex };
        if self.dev_index.get(&key).is_none() {
            let _ = self.dev_index.insert(key, DevMapValue { present: 1 });
        }
    }

    pub fn dev_index_remove(&mut self, ifindex: u32) {
        let _ = self.dev_index.delete(&DevMapKey { ifindex });
    }

    /// Seeds a limit-map entry (unlimited, unless one is already present)
    /// and a zeroed stats-map entry for `upstream_index` (design §4.7: "if
    /// this is the first rule on this upstream...").
    pub fn seed_upstream_accounting(&mut self, upstream_index: u32) {
        let limit_key = LimitKey {
            ifindex: upstream_index,
        };
        if self.limit.get(&limit_key).is_none() {
            let _ = self.limit.insert(limit_key, LimitValue::UNLIMITED);
        }
        let stats_key = StatsKey {
            ifindex: upstream_index,
        };
        if self.stats.get(&stats_key).is_none() {
            let _ = self.stats.insert(stats_key, StatsValue::default());
        }
    }

    /// Reads and clears the accounting entries for `upstream_index`,
    /// returning the final stats snapshot for the caller to fold into a
    /// persistent per-interface counter (design §4.7: "read-and-clear the
    /// stats entry").
    pub fn clear_upstream_accounting(&mut self, upstream_index: u32) -> StatsValue {
        let stats_key = StatsKey {
            ifindex: upstream_index,
        };
        let value = self.stats.get(&stats_key).unwrap_or_default();
        let _ = self.stats.delete(&stats_key);
        let _ = self
            .limit
            .delete(&LimitKey {
                ifindex: upstream_index,
            });
        value
    }
}

pub(crate) fn map_op_error(
    name: MapName,
    op: MapOp,
    reason: impl fmt::Display,
) -> Error {
    Error::MapOperationFailed(name, op, reason.to_string())
}
