//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! Neighbor event consumer. Drives the client table for IPv4 neighbors and
//! the IPv6 rule store for IPv6 neighbors, writing the downstream6 map
//! directly for the latter.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::client::{ClientInfo, ClientTable};
use crate::iface_index::IfaceIndex;
use crate::ipv6::{DownstreamRule, Ipv6Store};
use crate::mac_addr::MacAddr;
use crate::maps::{Downstream6Key, Maps, Tether6Value};

/// Neighbor-cache transition kind, matching `RTM_NEWNEIGH`/`RTM_DELNEIGH`
/// plus the synthetic `NUD_FAILED` notification.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NeighborOp {
    New,
    Del,
    Failed,
}

/// The subset of Linux NUD states the coordinator treats as "reachable
/// enough to offload" plus the rest, bucketed: REACHABLE, STALE, PROBE,
/// DELAY, and PERMANENT all admit offload.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NudState {
    Reachable,
    Stale,
    Probe,
    Delay,
    Permanent,
    Failed,
    Other,
}

impl NudState {
    fn admits_offload(self) -> bool {
        matches!(
            self,
            NudState::Reachable
                | NudState::Stale
                | NudState::Probe
                | NudState::Delay
                | NudState::Permanent
        )
    }
}

#[derive(Clone, Debug)]
pub struct NeighborEvent {
    pub op: NeighborOp,
    pub iface_index: u32,
    pub address: IpAddr,
    pub nud_state: NudState,
    pub mac: Option<MacAddr>,
}

/// What the coordinator must additionally do after [`handle`] returns;
/// `ClientWithdrawn` requires cascading into the IPv4 rule store, which
/// this module does not own.
#[derive(Debug, Eq, PartialEq)]
pub enum NeighborAction {
    Ignored,
    ClientAdmitted,
    ClientWithdrawn { downstream: u32, client_ipv4: Ipv4Addr },
    Ipv6RuleWritten,
    Ipv6RuleRetained,
    Ipv6RuleWithdrawn,
    Ipv6RuleAbsent,
}

fn is_admissible_ipv6(addr: Ipv6Addr) -> bool {
    !addr.is_multicast() && !is_ipv6_link_local(addr)
}

fn is_ipv6_link_local(addr: Ipv6Addr) -> bool {
    addr.segments()[0] & 0xffc0 == 0xfe80
}

/// Processes one neighbor event against the client table and IPv6 rule
/// store, writing the downstream6 map inline for IPv6 neighbors. Events on
/// interfaces not registered as downstreams are ignored.
pub fn handle(
    event: &NeighborEvent,
    downstreams: &HashSet<u32>,
    iface_index: &IfaceIndex,
    clients: &mut ClientTable,
    ipv6: &mut Ipv6Store,
    maps: &mut Maps,
) -> NeighborAction {
    if !downstreams.contains(&event.iface_index) {
        return NeighborAction::Ignored;
    }

    match event.address {
        IpAddr::V4(addr) => handle_ipv4(event, addr, iface_index, clients),
        IpAddr::V6(addr) => handle_ipv6(event, addr, iface_index, ipv6, maps),
    }
}

fn handle_ipv4(
    event: &NeighborEvent,
    addr: Ipv4Addr,
    iface_index: &IfaceIndex,
    clients: &mut ClientTable,
) -> NeighborAction {
    if !ClientTable::is_admissible(addr) {
        return NeighborAction::Ignored;
    }

    match event.op {
        NeighborOp::New => {
            let Some(mac) = event.mac else {
                return NeighborAction::Ignored;
            };
            if !event.nud_state.admits_offload() {
                return NeighborAction::Ignored;
            }
            let downstream_mac = iface_index
                .by_index(event.iface_index)
                .map(|params| params.mac)
                .unwrap_or_default();
            let admitted = clients.client_add(ClientInfo {
                downstream_index: event.iface_index,
                downstream_mac,
                client_ipv4: addr,
                client_mac: mac,
            });
            if admitted {
                NeighborAction::ClientAdmitted
            } else {
                NeighborAction::Ignored
            }
        }
        NeighborOp::Del | NeighborOp::Failed => {
            if clients.client_remove(event.iface_index, addr).is_some() {
                NeighborAction::ClientWithdrawn {
                    downstream: event.iface_index,
                    client_ipv4: addr,
                }
            } else {
                NeighborAction::Ignored
            }
        }
    }
}

fn handle_ipv6(
    event: &NeighborEvent,
    addr: Ipv6Addr,
    iface_index: &IfaceIndex,
    ipv6: &mut Ipv6Store,
    maps: &mut Maps,
) -> NeighborAction {
    if !is_admissible_ipv6(addr) {
        return NeighborAction::Ignored;
    }

    match event.op {
        NeighborOp::New => {
            let Some(mac) = event.mac else {
                return NeighborAction::Ignored;
            };
            if !event.nud_state.admits_offload() {
                return NeighborAction::Ignored;
            }
            let downstream_mac = iface_index
                .by_index(event.iface_index)
                .map(|params| params.mac)
                .unwrap_or_default();

            match ipv6.rule_upsert(event.iface_index, addr, downstream_mac, mac) {
                Some(rule) => {
                    write_downstream6(maps, &rule);
                    NeighborAction::Ipv6RuleWritten
                }
                None => NeighborAction::Ipv6RuleRetained,
            }
        }
        NeighborOp::Del | NeighborOp::Failed => {
            match ipv6.rule_remove(event.iface_index, addr) {
                Some(rule) => {
                    delete_downstream6(maps, &rule);
                    NeighborAction::Ipv6RuleWithdrawn
                }
                None => NeighborAction::Ipv6RuleAbsent,
            }
        }
    }
}

pub(crate) fn write_downstream6(maps: &mut Maps, rule: &DownstreamRule) {
    let key = Downstream6Key::new(rule.upstream_index, rule.downstream_mac, rule.neighbor);
    let value = Tether6Value {
        oif: rule.downstream_index,
        eth_dst: rule.client_mac.as_bytes(),
        eth_src: rule.downstream_mac.as_bytes(),
        eth_proto: libc::ETH_P_IPV6 as u16,
        pmtu: 1500,
    };
    let _ = maps.downstream6.insert(key, value);
}

fn delete_downstream6(maps: &mut Maps, rule: &DownstreamRule) {
    let key = Downstream6Key::new(rule.upstream_index, rule.downstream_mac, rule.neighbor);
    let _ = maps.downstream6.delete(&key);
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ipv6;

    fn downstream_set() -> HashSet<u32> {
        [2001].into_iter().collect()
    }

    #[test]
    fn event_on_unregistered_interface_is_ignored() {
        let mut clients = ClientTable::new();
        let mut ipv6_store = Ipv6Store::new();
        let mut maps = Maps::in_memory();
        let event = NeighborEvent {
            op: NeighborOp::New,
            iface_index: 9999,
            address: IpAddr::V4(Ipv4Addr::new(192, 168, 80, 12)),
            nud_state: NudState::Reachable,
            mac: Some(MacAddr::from([0x02, 0, 0, 0, 0, 1])),
        };
        let action = handle(
            &event,
            &downstream_set(),
            &IfaceIndex::new(),
            &mut clients,
            &mut ipv6_store,
            &mut maps,
        );
        assert_eq!(action, NeighborAction::Ignored);
    }

    #[test]
    fn new_ipv6_neighbor_with_no_upstream_is_retained_only() {
        let mut clients = ClientTable::new();
        let mut ipv6_store = Ipv6Store::new();
        let mut maps = Maps::in_memory();
        let event = NeighborEvent {
            op: NeighborOp::New,
            iface_index: 2001,
            address: IpAddr::V6("2001:db8:0:1234::1".parse().unwrap()),
            nud_state: NudState::Reachable,
            mac: Some(MacAddr::from([0x00, 0, 0, 0, 0, 0x0a])),
        };
        let action = handle(
            &event,
            &downstream_set(),
            &IfaceIndex::new(),
            &mut clients,
            &mut ipv6_store,
            &mut maps,
        );
        assert_eq!(action, NeighborAction::Ipv6RuleRetained);
        assert_eq!(maps.downstream6.len(), 0);
    }

    #[test]
    fn new_ipv6_neighbor_with_active_upstream_writes_map() {
        let mut clients = ClientTable::new();
        let mut ipv6_store = Ipv6Store::new();
        let mut maps = Maps::in_memory();
        let prefix = [0x20, 0x01, 0x0d, 0xb8, 0, 0, 0x12, 0x34];
        ipv6_store.update_upstream(2001, 1001, &[prefix].into_iter().collect());

        let event = NeighborEvent {
            op: NeighborOp::New,
            iface_index: 2001,
            address: IpAddr::V6("2001:db8:0:1234::1".parse().unwrap()),
            nud_state: NudState::Stale,
            mac: Some(MacAddr::from([0x00, 0, 0, 0, 0, 0x0a])),
        };
        let action = handle(
            &event,
            &downstream_set(),
            &IfaceIndex::new(),
            &mut clients,
            &mut ipv6_store,
            &mut maps,
        );
        assert_eq!(action, NeighborAction::Ipv6RuleWritten);
        assert_eq!(maps.downstream6.len(), 1);

        let del_event = NeighborEvent {
            op: NeighborOp::Del,
            ..event
        };
        let action = handle(
            &del_event,
            &downstream_set(),
            &IfaceIndex::new(),
            &mut clients,
            &mut ipv6_store,
            &mut maps,
        );
        assert_eq!(action, NeighborAction::Ipv6RuleWithdrawn);
        assert_eq!(maps.downstream6.len(), 0);
    }

    #[test]
    fn link_local_and_multicast_ipv6_are_ignored() {
        let mut clients = ClientTable::new();
        let mut ipv6_store = Ipv6Store::new();
        let mut maps = Maps::in_memory();
        for addr in ["fe80::1", "ff02::1"] {
            let event = NeighborEvent {
                op: NeighborOp::New,
                iface_index: 2001,
                address: IpAddr::V6(addr.parse().unwrap()),
                nud_state: NudState::Reachable,
                mac: Some(MacAddr::from([0x00, 0, 0, 0, 0, 0x0a])),
            };
            let action = handle(
                &event,
                &downstream_set(),
                &IfaceIndex::new(),
                &mut clients,
                &mut ipv6_store,
                &mut maps,
            );
            assert_eq!(action, NeighborAction::Ignored);
        }
        let _ = ipv6::NO_UPSTREAM;
    }

    #[test]
    fn ipv4_client_removal_reports_withdrawal_for_coordinator_cascade() {
        let mut clients = ClientTable::new();
        let mut ipv6_store = Ipv6Store::new();
        let mut maps = Maps::in_memory();
        let new_event = NeighborEvent {
            op: NeighborOp::New,
            iface_index: 2001,
            address: IpAddr::V4(Ipv4Addr::new(192, 168, 80, 12)),
            nud_state: NudState::Reachable,
            mac: Some(MacAddr::from([0x02, 0, 0, 0, 0, 1])),
        };
        handle(
            &new_event,
            &downstream_set(),
            &IfaceIndex::new(),
            &mut clients,
            &mut ipv6_store,
            &mut maps,
        );

        let del_event = NeighborEvent {
            op: NeighborOp::Failed,
            ..new_event
        };
        let action = handle(
            &del_event,
            &downstream_set(),
            &IfaceIndex::new(),
            &mut clients,
            &mut ipv6_store,
            &mut maps,
        );
        assert_eq!(
            action,
            NeighborAction::ClientWithdrawn {
                downstream: 2001,
                client_ipv4: Ipv4Addr::new(192, 168, 80, 12),
            }
        );
    }
}
