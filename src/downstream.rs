//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! Downstream registry: tracks which interfaces are currently registered as
//! tethering downstreams via `add_ip_server`/`remove_ip_server`. Membership
//! here, not the client table, is what the neighbor consumer checks before
//! admitting an event, and what the coordinator walks when an upstream
//! change must be fanned out to every downstream's IPv6 rule store.

use generational_arena::{Arena, Index};
use std::collections::HashMap;

#[derive(Debug)]
struct DownstreamEntry {
    ifindex: u32,
}

#[derive(Debug, Default)]
pub struct DownstreamRegistry {
    arena: Arena<DownstreamEntry>,
    by_ifindex: HashMap<u32, Index>,
}

// ===== impl DownstreamRegistry =====

impl DownstreamRegistry {
    pub fn new() -> Self {
        DownstreamRegistry::default()
    }

    /// Registers `ifindex` as a downstream. Returns `true` if this was the
    /// first registration overall (the coordinator must start the
    /// conntrack monitor), `false` if already registered or if other
    /// downstreams remain registered.
    pub fn add(&mut self, ifindex: u32) -> bool {
        if self.by_ifindex.contains_key(&ifindex) {
            return false;
        }
        let was_empty = self.arena.is_empty();
        let index = self.arena.insert(DownstreamEntry { ifindex });
        self.by_ifindex.insert(ifindex, index);
        was_empty
    }

    /// Removes `ifindex`. Returns `Some(true)` if this was the last
    /// registered downstream (the coordinator must stop the conntrack
    /// monitor and tear down timers), `Some(false)` if others
    /// remain, `None` if `ifindex` was not registered.
    pub fn remove(&mut self, ifindex: u32) -> Option<bool> {
        let index = self.by_ifindex.remove(&ifindex)?;
        self.arena.remove(index);
        Some(self.arena.is_empty())
    }

    pub fn contains(&self, ifindex: u32) -> bool {
        self.by_ifindex.contains_key(&ifindex)
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.arena.iter().map(|(_, entry)| entry.ifindex)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn first_add_and_last_remove_are_reported() {
        let mut registry = DownstreamRegistry::new();
        assert!(registry.add(2001));
        assert!(!registry.add(2002));
        assert_eq!(registry.len(), 2);

        assert_eq!(registry.remove(2001), Some(false));
        assert_eq!(registry.remove(2002), Some(true));
        assert!(registry.is_empty());
    }

    #[test]
    fn duplicate_add_is_a_no_op() {
        let mut registry = DownstreamRegistry::new();
        registry.add(2001);
        assert!(!registry.add(2001));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn remove_unknown_returns_none() {
        let mut registry = DownstreamRegistry::new();
        assert_eq!(registry.remove(9999), None);
    }
}
