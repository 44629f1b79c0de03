//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! In-memory [`KernelMap`] implementation injected by tests in place of a
//! real kernel map (design §9).

use std::collections::HashMap;
use std::hash::Hash;

use crate::error::Error;
use crate::maps::KernelMap;

#[derive(Debug, Default)]
pub struct MemMap<K, V> {
    entries: HashMap<K, V>,
}

impl<K: Eq + Hash, V> MemMap<K, V> {
    pub fn new() -> Self {
        MemMap {
            entries: HashMap::new(),
        }
    }
}

impl<K, V> KernelMap<K, V> for MemMap<K, V>
where
    K: Clone + Eq + Hash + std::fmt::Debug + Send,
    V: Clone + std::fmt::Debug + Send,
{
    fn insert(&mut self, key: K, value: V) -> Result<(), Error> {
        self.entries.insert(key, value);
        Ok(())
    }

    fn update(&mut self, key: K, value: V) -> Result<(), Error> {
        self.entries.insert(key, value);
        Ok(())
    }

    fn delete(&mut self, key: &K) -> Result<(), Error> {
        self.entries.remove(key);
        Ok(())
    }

    fn get(&self, key: &K) -> Option<V> {
        self.entries.get(key).cloned()
    }

    fn for_each(&self, f: &mut dyn FnMut(&K, &V)) {
        for (k, v) in self.entries.iter() {
            f(k, v);
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}
