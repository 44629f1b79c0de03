//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! IPv4 rule store: one forward/reverse rule pair per
//! offloaded flow, keyed by the conntrack-derived 5-tuple plus the
//! downstream that owns it.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use crate::mac_addr::MacAddr;
use crate::maps::{Tether4Key, Tether4Value};

/// The logical identity of a flow, independent of its current map
/// encoding: keyed by (downstream_index, downstream_mac, proto,
/// client_ipv4, remote_ipv4, client_port, remote_port).
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Ipv4RuleKey {
    pub downstream_index: u32,
    pub downstream_mac: MacAddr,
    pub proto: u16,
    pub client_ipv4: Ipv4Addr,
    pub remote_ipv4: Ipv4Addr,
    pub client_port: u16,
    pub remote_port: u16,
}

/// Inputs needed to derive both halves of a flow's rule pair. `nat_ipv4`/
/// `nat_port` are the address/port the remote peer observes post-NAT,
/// taken from the conntrack reply tuple.
#[derive(Clone, Copy, Debug)]
pub struct Ipv4FlowParams {
    pub downstream_index: u32,
    pub downstream_mac: MacAddr,
    pub client_mac: MacAddr,
    pub client_ipv4: Ipv4Addr,
    pub client_port: u16,
    pub nat_ipv4: Ipv4Addr,
    pub nat_port: u16,
    pub remote_ipv4: Ipv4Addr,
    pub remote_port: u16,
    pub proto: u16,
    pub upstream_index: u32,
    pub upstream_mac: MacAddr,
    pub upstream_neighbor_mac: MacAddr,
    pub eth_proto: u16,
    pub pmtu: u16,
}

impl Ipv4FlowParams {
    pub fn logical_key(&self) -> Ipv4RuleKey {
        Ipv4RuleKey {
            downstream_index: self.downstream_index,
            downstream_mac: self.downstream_mac,
            proto: self.proto,
            client_ipv4: self.client_ipv4,
            remote_ipv4: self.remote_ipv4,
            client_port: self.client_port,
            remote_port: self.remote_port,
        }
    }

    /// Builds the (upstream key, upstream value, downstream key, downstream
    /// value) quartet the coordinator writes to the two kernel maps.
    pub fn build_pair(&self) -> Ipv4RulePair {
        let upstream_key = Tether4Key::new(
            self.downstream_index,
            self.downstream_mac,
            self.proto,
            self.client_ipv4,
            self.remote_ipv4,
            self.client_port,
            self.remote_port,
        );
        let upstream_value = Tether4Value::new(
            self.upstream_index,
            self.upstream_neighbor_mac,
            self.upstream_mac,
            self.eth_proto,
            self.pmtu,
            self.nat_ipv4,
            self.remote_ipv4,
            self.nat_port,
            self.remote_port,
        );
        let downstream_key = Tether4Key::new(
            self.upstream_index,
            self.upstream_mac,
            self.proto,
            self.remote_ipv4,
            self.nat_ipv4,
            self.remote_port,
            self.nat_port,
        );
        let downstream_value = Tether4Value::new(
            self.downstream_index,
            self.client_mac,
            self.downstream_mac,
            self.eth_proto,
            self.pmtu,
            self.remote_ipv4,
            self.client_ipv4,
            self.remote_port,
            self.client_port,
        );
        Ipv4RulePair {
            upstream_key,
            upstream_value,
            downstream_key,
            downstream_value,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Ipv4RulePair {
    pub upstream_key: Tether4Key,
    pub upstream_value: Tether4Value,
    pub downstream_key: Tether4Key,
    pub downstream_value: Tether4Value,
}

#[derive(Clone, Copy, Debug)]
struct StoredRule {
    upstream_index: u32,
    downstream_index: u32,
    client_ipv4: Ipv4Addr,
    pair: Ipv4RulePair,
}

#[derive(Debug, Default)]
pub struct Ipv4Store {
    rules: HashMap<Ipv4RuleKey, StoredRule>,
}

// ===== impl Ipv4Store =====

impl Ipv4Store {
    pub fn new() -> Self {
        Ipv4Store::default()
    }

    pub fn insert(&mut self, key: Ipv4RuleKey, params: &Ipv4FlowParams) -> Ipv4RulePair {
        let pair = params.build_pair();
        self.rules.insert(
            key,
            StoredRule {
                upstream_index: params.upstream_index,
                downstream_index: params.downstream_index,
                client_ipv4: params.client_ipv4,
                pair,
            },
        );
        pair
    }

    pub fn remove(&mut self, key: &Ipv4RuleKey) -> Option<Ipv4RulePair> {
        self.rules.remove(key).map(|stored| stored.pair)
    }

    /// Removes every rule belonging to `client_ipv4` on `downstream`,
    /// called when that client's removal cascades into its IPv4 rules.
    pub fn remove_by_client(
        &mut self,
        downstream: u32,
        client_ipv4: Ipv4Addr,
    ) -> Vec<Ipv4RulePair> {
        let victims: Vec<Ipv4RuleKey> = self
            .rules
            .iter()
            .filter(|(_, rule)| {
                rule.downstream_index == downstream && rule.client_ipv4 == client_ipv4
            })
            .map(|(key, _)| *key)
            .collect();

        victims
            .into_iter()
            .filter_map(|key| self.rules.remove(&key))
            .map(|stored| stored.pair)
            .collect()
    }

    /// Removes every rule attached to `upstream_index`, called on an xlat
    /// downgrade or a full upstream loss.
    pub fn remove_all_on_upstream(&mut self, upstream_index: u32) -> Vec<Ipv4RulePair> {
        let victims: Vec<Ipv4RuleKey> = self
            .rules
            .iter()
            .filter(|(_, rule)| rule.upstream_index == upstream_index)
            .map(|(key, _)| *key)
            .collect();

        victims
            .into_iter()
            .filter_map(|key| self.rules.remove(&key))
            .map(|stored| stored.pair)
            .collect()
    }

    pub fn count_on_upstream(&self, upstream_index: u32) -> usize {
        self.rules
            .values()
            .filter(|rule| rule.upstream_index == upstream_index)
            .count()
    }

    /// Whether any stored rule still references `ifindex`, as either its
    /// upstream or downstream leg. Used to decide whether the dev-index
    /// bookkeeping map can drop its entry for `ifindex`.
    pub fn references_ifindex(&self, ifindex: u32) -> bool {
        self.rules
            .values()
            .any(|rule| rule.upstream_index == ifindex || rule.downstream_index == ifindex)
    }

    /// The active-session count: equal to the number of unique upstream4
    /// entries.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn params() -> Ipv4FlowParams {
        Ipv4FlowParams {
            downstream_index: 2001,
            downstream_mac: MacAddr::from([0xaa; 6]),
            client_mac: MacAddr::from([0x02, 0, 0, 0, 0, 1]),
            client_ipv4: Ipv4Addr::new(192, 168, 80, 12),
            client_port: 55001,
            nat_ipv4: Ipv4Addr::new(203, 0, 113, 9),
            nat_port: 62449,
            remote_ipv4: Ipv4Addr::new(140, 112, 8, 116),
            remote_port: 443,
            proto: libc::IPPROTO_TCP as u16,
            upstream_index: 1001,
            upstream_mac: MacAddr::from([0xbb; 6]),
            upstream_neighbor_mac: MacAddr::from([0xcc; 6]),
            eth_proto: libc::ETH_P_IP as u16,
            pmtu: 1500,
        }
    }

    #[test]
    fn build_pair_swaps_tuple_and_preserves_pmtu() {
        let params = params();
        let pair = params.build_pair();

        assert_eq!(pair.upstream_value.oif, 1001);
        assert_eq!(pair.downstream_value.oif, 2001);
        assert_eq!(pair.upstream_key.iif, pair.downstream_value.oif);
        assert_eq!(pair.downstream_key.iif, pair.upstream_value.oif);
        assert_eq!(pair.upstream_value.pmtu, pair.downstream_value.pmtu);
        assert_eq!(pair.upstream_key.src4, pair.downstream_key.dst4);
        assert_eq!(pair.upstream_key.dst4, pair.downstream_key.src4);
    }

    #[test]
    fn remove_by_client_evicts_only_matching_rules() {
        let mut store = Ipv4Store::new();
        let params = params();
        store.insert(params.logical_key(), &params);

        let mut other = params;
        other.client_ipv4 = Ipv4Addr::new(192, 168, 80, 13);
        store.insert(other.logical_key(), &other);

        let removed = store.remove_by_client(2001, Ipv4Addr::new(192, 168, 80, 12));
        assert_eq!(removed.len(), 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn remove_all_on_upstream_drains_only_that_upstream() {
        let mut store = Ipv4Store::new();
        let params = params();
        store.insert(params.logical_key(), &params);

        let mut other = params;
        other.remote_port = 8443;
        other.upstream_index = 1002;
        store.insert(other.logical_key(), &other);

        let removed = store.remove_all_on_upstream(1001);
        assert_eq!(removed.len(), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.count_on_upstream(1002), 1);
    }
}
