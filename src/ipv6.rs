//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! IPv6 rule store. Per downstream, this holds the current
//! upstream (index + set of /64 prefixes) and an address→rule table. The
//! store is the authoritative in-memory model; kernel maps only ever
//! reflect the subset of it that is currently eligible for offload.
//! When the downstream has no active upstream, rules are retained
//! here with `upstream_index = NO_UPSTREAM` but never written to a map.

use std::collections::{HashMap, HashSet};
use std::net::Ipv6Addr;

use crate::mac_addr::MacAddr;

pub const NO_UPSTREAM: u32 = 0;

/// One reachable IPv6 neighbor behind a downstream.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DownstreamRule {
    pub upstream_index: u32,
    pub downstream_index: u32,
    pub neighbor: Ipv6Addr,
    pub downstream_mac: MacAddr,
    pub client_mac: MacAddr,
}

#[derive(Debug, Default)]
struct DownstreamState {
    upstream_index: u32,
    prefixes: HashSet<[u8; 8]>,
    rules: HashMap<Ipv6Addr, DownstreamRule>,
}

impl DownstreamState {
    fn is_active(&self) -> bool {
        self.upstream_index != NO_UPSTREAM && !self.prefixes.is_empty()
    }
}

/// The ordered set of map operations an upstream change produces. The
/// coordinator must apply them in this order: remove obsolete downstream6
/// entries, remove obsolete upstream6 entries, add new upstream6 entries,
/// re-add downstream6 entries.
#[derive(Debug, Default)]
pub struct UpstreamUpdatePlan {
    pub remove_downstream6: Vec<DownstreamRule>,
    pub remove_upstream6_prefixes: Vec<[u8; 8]>,
    pub add_upstream6_prefixes: Vec<[u8; 8]>,
    pub add_downstream6: Vec<DownstreamRule>,
}

#[derive(Debug, Default)]
pub struct Ipv6Store {
    downstreams: HashMap<u32, DownstreamState>,
}

// ===== impl Ipv6Store =====

impl Ipv6Store {
    pub fn new() -> Self {
        Ipv6Store::default()
    }

    /// Applies a new upstream index/prefix set for `downstream`, returning
    /// the plan of map writes the coordinator must perform.
    pub fn update_upstream(
        &mut self,
        downstream: u32,
        new_upstream: u32,
        new_prefixes: &HashSet<[u8; 8]>,
    ) -> UpstreamUpdatePlan {
        let state = self.downstreams.entry(downstream).or_default();
        let upstream_changed = state.upstream_index != new_upstream;
        let removed_prefixes: Vec<[u8; 8]> = state
            .prefixes
            .difference(new_prefixes)
            .copied()
            .collect();
        let added_prefixes: Vec<[u8; 8]> = new_prefixes
            .difference(&state.prefixes)
            .copied()
            .collect();

        let mut plan = UpstreamUpdatePlan::default();

        if upstream_changed {
            // The outer (oif) address embedded in every downstream6 entry
            // is the upstream index, so every existing entry is stale and
            // must be withdrawn before the new upstream applies.
            plan.remove_downstream6 = state.rules.values().copied().collect();
            plan.remove_upstream6_prefixes =
                state.prefixes.iter().copied().collect();
        } else {
            plan.remove_upstream6_prefixes = removed_prefixes;
        }

        state.upstream_index = new_upstream;
        state.prefixes = new_prefixes.clone();

        if state.is_active() {
            plan.add_upstream6_prefixes = if upstream_changed {
                new_prefixes.iter().copied().collect()
            } else {
                added_prefixes
            };

            if upstream_changed {
                for rule in state.rules.values_mut() {
                    rule.upstream_index = new_upstream;
                }
                plan.add_downstream6 = state.rules.values().copied().collect();
            }
        } else {
            // New upstream is NO_UPSTREAM or has no prefixes: rules are
            // retained in memory but not re-emitted.
            for rule in state.rules.values_mut() {
                rule.upstream_index = NO_UPSTREAM;
            }
        }

        plan
    }

    /// Equivalent to `update_upstream(downstream, NO_UPSTREAM, {})` followed
    /// by dropping every in-memory rule for this downstream.
    pub fn clear_all(&mut self, downstream: u32) -> UpstreamUpdatePlan {
        let plan = self.update_upstream(downstream, NO_UPSTREAM, &HashSet::new());
        self.downstreams.remove(&downstream);
        plan
    }

    /// Upserts a rule for a newly admitted or refreshed neighbor. Returns
    /// `Some(rule)` when the rule is currently eligible to be written to the
    /// downstream6 map (an active upstream exists), `None` when it must only
    /// be remembered in memory.
    pub fn rule_upsert(
        &mut self,
        downstream: u32,
        neighbor: Ipv6Addr,
        downstream_mac: MacAddr,
        client_mac: MacAddr,
    ) -> Option<DownstreamRule> {
        let state = self.downstreams.entry(downstream).or_default();
        let rule = DownstreamRule {
            upstream_index: state.upstream_index,
            downstream_index: downstream,
            neighbor,
            downstream_mac,
            client_mac,
        };
        state.rules.insert(neighbor, rule);
        state.is_active().then_some(rule)
    }

    /// Removes the rule for `neighbor`. The caller should attempt the
    /// corresponding map deletion unconditionally; deleting an absent key is
    /// a no-op, since the store, not the map, is authoritative.
    pub fn rule_remove(
        &mut self,
        downstream: u32,
        neighbor: Ipv6Addr,
    ) -> Option<DownstreamRule> {
        let state = self.downstreams.get_mut(&downstream)?;
        state.rules.remove(&neighbor)
    }

    pub fn current_upstream(&self, downstream: u32) -> u32 {
        self.downstreams
            .get(&downstream)
            .map(|state| state.upstream_index)
            .unwrap_or(NO_UPSTREAM)
    }

    /// Whether any downstream still has `ifindex` as its current upstream,
    /// or `ifindex` is itself a tracked downstream with at least one rule.
    /// Used alongside [`crate::ipv4::Ipv4Store::references_ifindex`] to
    /// decide whether the dev-index map entry for `ifindex` can be dropped.
    pub fn references_ifindex(&self, ifindex: u32) -> bool {
        self.downstreams.iter().any(|(downstream, state)| {
            state.upstream_index == ifindex || (*downstream == ifindex && !state.rules.is_empty())
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn prefixes(values: &[[u8; 8]]) -> HashSet<[u8; 8]> {
        values.iter().copied().collect()
    }

    #[test]
    fn neighbor_before_upstream_is_retained_but_not_written() {
        let mut store = Ipv6Store::new();
        let write = store.rule_upsert(
            2001,
            "2001:db8:0:1234::1".parse().unwrap(),
            MacAddr::from([0xaa; 6]),
            MacAddr::from([0; 6]),
        );
        assert!(write.is_none());
    }

    #[test]
    fn upstream_assignment_re_emits_retained_rules() {
        let mut store = Ipv6Store::new();
        store.rule_upsert(
            2001,
            "2001:db8:0:1234::1".parse().unwrap(),
            MacAddr::from([0xaa; 6]),
            MacAddr::from([0; 6]),
        );

        let prefix = [0x20, 0x01, 0x0d, 0xb8, 0, 0, 0x12, 0x34];
        let plan = store.update_upstream(2001, 1001, &prefixes(&[prefix]));

        assert_eq!(plan.add_upstream6_prefixes, vec![prefix]);
        assert_eq!(plan.add_downstream6.len(), 1);
        assert_eq!(plan.add_downstream6[0].upstream_index, 1001);
        assert!(plan.remove_downstream6.is_empty());
    }

    #[test]
    fn losing_upstream_drains_maps_but_keeps_memory() {
        let mut store = Ipv6Store::new();
        let prefix = [0x20, 0x01, 0x0d, 0xb8, 0, 0, 0x12, 0x34];
        store.rule_upsert(
            2001,
            "2001:db8:0:1234::1".parse().unwrap(),
            MacAddr::from([0xaa; 6]),
            MacAddr::from([0; 6]),
        );
        store.update_upstream(2001, 1001, &prefixes(&[prefix]));

        let plan = store.update_upstream(2001, NO_UPSTREAM, &HashSet::new());
        assert_eq!(plan.remove_downstream6.len(), 1);
        assert_eq!(plan.remove_upstream6_prefixes, vec![prefix]);
        assert!(plan.add_upstream6_prefixes.is_empty());
        assert!(plan.add_downstream6.is_empty());
        assert_eq!(store.current_upstream(2001), NO_UPSTREAM);

        // Restoring the same upstream/prefix re-emits the retained rule.
        let plan = store.update_upstream(2001, 1001, &prefixes(&[prefix]));
        assert_eq!(plan.add_downstream6.len(), 1);
    }

    #[test]
    fn prefix_only_change_does_not_touch_downstream_entries() {
        let mut store = Ipv6Store::new();
        let p1 = [1; 8];
        let p2 = [2; 8];
        store.update_upstream(2001, 1001, &prefixes(&[p1]));
        store.rule_upsert(
            2001,
            "2001:db8::1".parse().unwrap(),
            MacAddr::from([0xaa; 6]),
            MacAddr::from([0; 6]),
        );

        let plan = store.update_upstream(2001, 1001, &prefixes(&[p2]));
        assert_eq!(plan.remove_upstream6_prefixes, vec![p1]);
        assert_eq!(plan.add_upstream6_prefixes, vec![p2]);
        assert!(plan.remove_downstream6.is_empty());
        assert!(plan.add_downstream6.is_empty());
    }
}
