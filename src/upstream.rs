//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! Upstream manager. Tracks the single current upstream network and
//! classifies it for offload eligibility; the coordinator drives
//! `update_upstream` on every downstream's [`crate::ipv6::Ipv6Store`]
//! whenever the classification changes.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use crate::iface_index::InterfaceParams;
use crate::mac_addr::MacAddr;

pub const NO_UPSTREAM: u32 = 0;

/// How the upstream link reaches the rest of the network; informational,
/// used only to decide whether an Ethernet framing mismatch with a
/// raw-IP downstream should block IPv4 offload.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransportKind {
    Cellular,
    Wifi,
    Ethernet,
    Other,
}

/// The current upstream network, or the `NO_UPSTREAM` sentinel.
#[derive(Clone, Debug, PartialEq)]
pub struct UpstreamInfo {
    pub index: u32,
    pub iface: InterfaceParams,
    pub ipv4_address: Option<Ipv4Addr>,
    /// The MAC address of the next-hop gateway on this upstream, used as
    /// the outer destination MAC for IPv4/IPv6 rules forwarded onto it.
    pub gateway_mac: MacAddr,
    pub transport: TransportKind,
    pub prefixes: std::collections::HashSet<[u8; 8]>,
    pub has_ipv4: bool,
    pub has_ipv6: bool,
    pub is_xlat: bool,
    pub is_virtual: bool,
}

impl UpstreamInfo {
    /// Offload eligibility for IPv4 flows: IPv4 capable, not virtual, not
    /// 464xlat, and if the upstream carries an
    /// Ethernet header the downstream must too (the datapath can't splice
    /// an Ethernet frame onto a raw-IP egress path or vice versa).
    pub fn supports_ipv4(&self, downstream_has_ethernet: bool) -> bool {
        self.has_ipv4
            && !self.is_virtual
            && !self.is_xlat
            && (!self.iface.has_ethernet || downstream_has_ethernet)
    }

    /// Offload eligibility for IPv6 flows. 464xlat upstreams are IPv6-only
    /// by construction and remain eligible for IPv6 offload.
    pub fn supports_ipv6(&self) -> bool {
        self.has_ipv6 && !self.is_virtual
    }
}

impl Default for UpstreamInfo {
    /// The `NO_UPSTREAM` sentinel: no interface currently assigned.
    fn default() -> Self {
        UpstreamInfo {
            index: NO_UPSTREAM,
            iface: InterfaceParams::new(
                String::new(),
                NO_UPSTREAM,
                Default::default(),
                0,
            ),
            ipv4_address: None,
            gateway_mac: MacAddr::ZERO,
            transport: TransportKind::Other,
            prefixes: Default::default(),
            has_ipv4: false,
            has_ipv6: false,
            is_xlat: false,
            is_virtual: false,
        }
    }
}

/// The outcome of applying a new upstream state, describing what changed so
/// the coordinator can react (clearing IPv4 rules on an ineligible
/// transition).
#[derive(Debug)]
pub struct UpstreamChangeOutcome {
    pub previous_index: u32,
    pub lost_ipv4_support: bool,
}

#[derive(Debug, Default)]
pub struct UpstreamManager {
    current: UpstreamInfo,
    /// Historical upstream IPv4 addresses seen while IPv4 support was up,
    /// kept only while the current upstream still has IPv4.
    ipv4_upstream_indices: HashMap<Ipv4Addr, u32>,
}

// ===== impl UpstreamManager =====

impl UpstreamManager {
    pub fn new() -> Self {
        UpstreamManager::default()
    }

    pub fn current(&self) -> &UpstreamInfo {
        &self.current
    }

    /// Applies a new upstream state (or `None` for "no upstream"),
    /// returning what changed.
    pub fn set(&mut self, new_state: Option<UpstreamInfo>) -> UpstreamChangeOutcome {
        let previous = std::mem::replace(&mut self.current, new_state.unwrap_or_default());
        // "Offload-capable" here ignores the per-downstream Ethernet-framing
        // check in `supports_ipv4` (not meaningful at this global level) but
        // must still account for is_xlat: a downgrade to a translated
        // upstream drops IPv4 offload even if `has_ipv4` is still set.
        let was_capable = previous.has_ipv4 && !previous.is_virtual && !previous.is_xlat;
        let still_capable =
            self.current.has_ipv4 && !self.current.is_virtual && !self.current.is_xlat;
        let lost_ipv4_support = was_capable && !still_capable;

        if self.current.has_ipv4 {
            if let Some(addr) = self.current.ipv4_address {
                self.ipv4_upstream_indices.insert(addr, self.current.index);
            }
        } else {
            self.ipv4_upstream_indices.clear();
        }

        UpstreamChangeOutcome {
            previous_index: previous.index,
            lost_ipv4_support,
        }
    }

    pub fn resolve_by_ipv4(&self, addr: Ipv4Addr) -> Option<u32> {
        self.ipv4_upstream_indices.get(&addr).copied()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mac_addr::MacAddr;

    fn ethernet_upstream(has_ipv4: bool, is_xlat: bool) -> UpstreamInfo {
        UpstreamInfo {
            index: 1001,
            iface: InterfaceParams::new(
                "rmnet0".to_owned(),
                1001,
                MacAddr::from([0xbb; 6]),
                1500,
            ),
            ipv4_address: Some(Ipv4Addr::new(203, 0, 113, 9)),
            gateway_mac: MacAddr::from([0xcc; 6]),
            transport: TransportKind::Cellular,
            prefixes: Default::default(),
            has_ipv4,
            has_ipv6: true,
            is_xlat,
            is_virtual: false,
        }
    }

    #[test]
    fn xlat_upstream_blocks_ipv4_but_not_ipv6() {
        let upstream = ethernet_upstream(true, true);
        assert!(!upstream.supports_ipv4(true));
        assert!(upstream.supports_ipv6());
    }

    #[test]
    fn ethernet_upstream_requires_ethernet_downstream() {
        let upstream = ethernet_upstream(true, false);
        assert!(upstream.supports_ipv4(true));
        assert!(!upstream.supports_ipv4(false));
    }

    #[test]
    fn losing_ipv4_clears_address_index_and_is_flagged() {
        let mut manager = UpstreamManager::new();
        manager.set(Some(ethernet_upstream(true, false)));
        assert_eq!(
            manager.resolve_by_ipv4(Ipv4Addr::new(203, 0, 113, 9)),
            Some(1001)
        );

        let outcome = manager.set(Some(ethernet_upstream(false, false)));
        assert!(outcome.lost_ipv4_support);
        assert_eq!(manager.resolve_by_ipv4(Ipv4Addr::new(203, 0, 113, 9)), None);
    }

    #[test]
    fn xlat_downgrade_is_reported_as_lost_ipv4_support_even_with_has_ipv4_set() {
        let mut manager = UpstreamManager::new();
        manager.set(Some(ethernet_upstream(true, false)));
        let outcome = manager.set(Some(ethernet_upstream(true, true)));
        assert!(outcome.lost_ipv4_support);
    }

    #[test]
    fn default_manager_is_no_upstream() {
        let manager = UpstreamManager::new();
        assert_eq!(manager.current().index, NO_UPSTREAM);
        assert!(!manager.current().has_ipv4);
    }
}
