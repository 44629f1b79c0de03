//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! [`KernelMap`] implementation backed by real BPF maps, opened through
//! `aya`. The datapath program pins each of the eight maps under
//! `/sys/fs/bpf/<name>` on load; this module attaches to those pins rather
//! than loading the datapath program itself (out of scope, design §1).

use std::hash::Hash;
use std::path::{Path, PathBuf};

use aya::maps::{HashMap as AyaHashMap, MapData, MapError};
use aya::Pod;
use tracing::warn;

use crate::error::Error;
use crate::maps::{
    DevMapKey, DevMapValue, Downstream6Key, ErrorReasonKey, KernelMap,
    LimitKey, LimitValue, MapName, Maps, StatsKey, StatsValue, Tether4Key,
    Tether4Value, Tether6Value, Upstream6Key, map_op_error,
};
use crate::error::MapOp;

/// A kernel map opened through `aya`, identified by `name` for logging and
/// error-counter attribution.
#[derive(Debug)]
pub struct BpfMap<K: Pod, V: Pod> {
    name: MapName,
    inner: AyaHashMap<MapData, K, V>,
}

impl<K, V> BpfMap<K, V>
where
    K: Pod + Eq + Hash,
    V: Pod,
{
    fn open(name: MapName, pin_base: &Path) -> Result<Self, Error> {
        let pin_path = pin_base.join(name.to_string());
        let map_data = MapData::from_pin(&pin_path)
            .map_err(|_| Error::MapUnavailable(name))?;
        let inner = AyaHashMap::try_from(map_data)
            .map_err(|_| Error::MapUnavailable(name))?;
        Ok(BpfMap { name, inner })
    }
}

impl<K, V> KernelMap<K, V> for BpfMap<K, V>
where
    K: Pod + Eq + Hash + std::fmt::Debug + Send,
    V: Pod + std::fmt::Debug + Send,
{
    fn insert(&mut self, key: K, value: V) -> Result<(), Error> {
        self.inner
            .insert(key, value, 0)
            .map_err(|error| map_op_error(self.name, MapOp::Insert, error))
    }

    fn update(&mut self, key: K, value: V) -> Result<(), Error> {
        self.inner
            .insert(key, value, 0)
            .map_err(|error| map_op_error(self.name, MapOp::Update, error))
    }

    fn delete(&mut self, key: &K) -> Result<(), Error> {
        match self.inner.remove(key) {
            Ok(()) => Ok(()),
            // Deleting an absent key is not an error: the caller may be
            // repairing state that never made it into the map.
            Err(MapError::KeyNotFound) => Ok(()),
            Err(error) => Err(map_op_error(self.name, MapOp::Delete, error)),
        }
    }

    fn get(&self, key: &K) -> Option<V> {
        self.inner.get(key, 0).ok()
    }

    fn for_each(&self, f: &mut dyn FnMut(&K, &V)) {
        for item in self.inner.iter().flatten() {
            let (key, value) = item;
            f(&key, &value);
        }
    }

    fn clear(&mut self) {
        let keys: Vec<K> = self.inner.keys().flatten().collect();
        for key in keys {
            if let Err(error) = self.inner.remove(&key) {
                warn!(map = %self.name, %error, "failed to clear map entry");
            }
        }
    }

    fn len(&self) -> usize {
        self.inner.keys().flatten().count()
    }
}

/// Attempts to open every kernel map pinned under `pin_base`, returning a
/// fully populated [`Maps`] registry, or a degraded one (design §4.1) if any
/// single map is unavailable.
pub fn open(pin_base: impl AsRef<Path>) -> Maps {
    let pin_base: PathBuf = pin_base.as_ref().to_path_buf();

    let downstream4 = BpfMap::<Tether4Key, Tether4Value>::open(
        MapName::Downstream4,
        &pin_base,
    );
    let upstream4 =
        BpfMap::<Tether4Key, Tether4Value>::open(MapName::Upstream4, &pin_base);
    let downstream6 = BpfMap::<Downstream6Key, Tether6Value>::open(
        MapName::Downstream6,
        &pin_base,
    );
    let upstream6 =
        BpfMap::<Upstream6Key, Tether6Value>::open(MapName::Upstream6, &pin_base);
    let stats = BpfMap::<StatsKey, StatsValue>::open(MapName::Stats, &pin_base);
    let limit = BpfMap::<LimitKey, LimitValue>::open(MapName::Limit, &pin_base);
    let dev_index =
        BpfMap::<DevMapKey, DevMapValue>::open(MapName::DevIndex, &pin_base);
    let error_counter =
        BpfMap::<ErrorReasonKey, u64>::open(MapName::ErrorCounter, &pin_base);

    match (
        downstream4,
        upstream4,
        downstream6,
        upstream6,
        stats,
        limit,
        dev_index,
        error_counter,
    ) {
        (
            Ok(downstream4),
            Ok(upstream4),
            Ok(downstream6),
            Ok(upstream6),
            Ok(stats),
            Ok(limit),
            Ok(dev_index),
            Ok(error_counter),
        ) => {
            let mut maps = Maps {
                degraded: false,
                downstream4: Box::new(downstream4),
                upstream4: Box::new(upstream4),
                downstream6: Box::new(downstream6),
                upstream6: Box::new(upstream6),
                stats: Box::new(stats),
                limit: Box::new(limit),
                dev_index: Box::new(dev_index),
                error_counter: Box::new(error_counter),
            };
            maps.clear_all();
            maps
        }
        result => {
            // Report every map that failed to open before falling back.
            for failure in [
                result.0.err(),
                result.1.err(),
                result.2.err(),
                result.3.err(),
                result.4.err(),
                result.5.err(),
                result.6.err(),
                result.7.err(),
            ]
            .into_iter()
            .flatten()
            {
                failure.log();
            }
            Maps::degraded()
        }
    }
}
