//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! Conntrack event consumer. Filters new flows down to the ones eligible
//! for offload, derives the upstream/downstream [`crate::ipv4::Ipv4RulePair`]
//! from an admitted NAT flow, and maintains the per-upstream accounting
//! entries and dev-index bookkeeping around it.

use std::net::Ipv4Addr;

use bitflags::bitflags;
use libc::{IPPROTO_TCP, IPPROTO_UDP};

use crate::client::ClientTable;
use crate::config::Config;
use crate::ipv4::{Ipv4FlowParams, Ipv4RuleKey, Ipv4Store};
use crate::mac_addr::MacAddr;
use crate::maps::{Maps, StatsValue};
use crate::upstream::UpstreamManager;

bitflags! {
    /// The subset of the conntrack entry's status bitmask the coordinator
    /// cares about.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct ConntrackStatus: u32 {
        const ESTABLISHED = 0x01;
        const SEEN_REPLY  = 0x02;
        const ASSURED     = 0x04;
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConntrackMsgKind {
    New,
    Delete,
}

/// One half of a conntrack 5-tuple, as decoded from either the original or
/// reply direction NLA group.
#[derive(Clone, Copy, Debug)]
pub struct ConntrackTuple {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub proto: u16,
    pub src_port: u16,
    pub dst_port: u16,
}

#[derive(Clone, Copy, Debug)]
pub struct ConntrackEvent {
    pub kind: ConntrackMsgKind,
    pub original: ConntrackTuple,
    pub reply: ConntrackTuple,
    pub status: ConntrackStatus,
    pub timeout_secs: u32,
}

/// What [`handle`] did, so the coordinator can drive the bookkeeping that
/// lives outside this module (dev-index, quota/stats, session metrics).
#[derive(Debug, Eq, PartialEq)]
pub enum ConntrackAction {
    /// Dropped by one of the eligibility filters; no map or store mutation
    /// occurred.
    NotEligible,
    Offloaded {
        upstream_index: u32,
        downstream_index: u32,
        first_rule_on_upstream: bool,
    },
    Withdrawn {
        upstream_index: u32,
        downstream_index: u32,
        /// `Some` iff this was the last rule on `upstream_index`, carrying
        /// the final read-and-cleared stats snapshot the coordinator must
        /// fold into the persistent per-interface counter (design §4.7).
        final_upstream_snapshot: Option<StatsValue>,
    },
    /// A DELETE arrived for a flow this store never admitted (e.g. it was
    /// filtered at NEW time, or already withdrawn by a client removal).
    NotFound,
}

/// Inputs resolved by the coordinator ahead of calling [`handle`]: the
/// fields that only it knows how to look up (interface parameters, the
/// downstream's recorded MAC, path MTU).
pub struct OffloadContext {
    pub downstream_index: u32,
    pub downstream_mac: MacAddr,
    pub client_mac: MacAddr,
    pub upstream_mac: MacAddr,
    pub upstream_neighbor_mac: MacAddr,
    pub pmtu: u16,
}

/// The IPv4 minimum link MTU (RFC 791); path MTU is floored here so a
/// pathologically small upstream MTU can never produce an unusable rule.
pub const IPV4_MIN_MTU: u16 = 68;

fn logical_key(ctx: &OffloadContext, tuple: &ConntrackTuple) -> Ipv4RuleKey {
    Ipv4RuleKey {
        downstream_index: ctx.downstream_index,
        downstream_mac: ctx.downstream_mac,
        proto: tuple.proto,
        client_ipv4: tuple.src,
        remote_ipv4: tuple.dst,
        client_port: tuple.src_port,
        remote_port: tuple.dst_port,
    }
}

/// TCP destination ports configured as non-offloadable are never offloaded;
/// every UDP port and every other TCP port is eligible.
fn port_is_offloadable(config: &Config, proto: u16, dst_port: u16) -> bool {
    if proto == IPPROTO_TCP as u16 {
        !config.non_offload_tcp_ports.contains(&dst_port)
    } else {
        proto == IPPROTO_UDP as u16
    }
}

/// Processes one conntrack event against the IPv4 rule store, applying the
/// eligibility filters and writing the upstream4/downstream4 map entries
/// inline.
#[allow(clippy::too_many_arguments)]
pub fn handle(
    event: &ConntrackEvent,
    config: &Config,
    clients: &ClientTable,
    upstream: &UpstreamManager,
    ipv4: &mut Ipv4Store,
    maps: &mut Maps,
    resolve_ctx: impl FnOnce(u32, Ipv4Addr) -> Option<OffloadContext>,
) -> ConntrackAction {
    let current = upstream.current();

    match event.kind {
        ConntrackMsgKind::New => {
            // The ORIGINAL source must be a known client.
            let Some(client) = clients.find_by_address(event.original.src) else {
                return ConntrackAction::NotEligible;
            };
            // The upstream must currently support IPv4 offload for this
            // downstream's framing.
            let downstream_has_ethernet = client.downstream_mac != MacAddr::ZERO;
            if !current.supports_ipv4(downstream_has_ethernet) {
                return ConntrackAction::NotEligible;
            }
            if !port_is_offloadable(config, event.original.proto, event.original.dst_port) {
                return ConntrackAction::NotEligible;
            }
            if !event.status.contains(ConntrackStatus::ESTABLISHED) || event.timeout_secs == 0 {
                return ConntrackAction::NotEligible;
            }

            let Some(ctx) = resolve_ctx(client.downstream_index, event.original.src) else {
                return ConntrackAction::NotEligible;
            };

            let key = logical_key(&ctx, &event.original);
            let pmtu = ctx.pmtu.max(IPV4_MIN_MTU);
            let params = Ipv4FlowParams {
                downstream_index: ctx.downstream_index,
                downstream_mac: ctx.downstream_mac,
                client_mac: ctx.client_mac,
                client_ipv4: event.original.src,
                client_port: event.original.src_port,
                nat_ipv4: event.reply.dst,
                nat_port: event.reply.dst_port,
                remote_ipv4: event.original.dst,
                remote_port: event.original.dst_port,
                proto: event.original.proto,
                upstream_index: current.index,
                upstream_mac: ctx.upstream_mac,
                upstream_neighbor_mac: ctx.upstream_neighbor_mac,
                eth_proto: libc::ETH_P_IP as u16,
                pmtu,
            };

            let first_rule_on_upstream = ipv4.count_on_upstream(current.index) == 0;
            if first_rule_on_upstream {
                maps.seed_upstream_accounting(current.index);
            }
            maps.dev_index_ensure(current.index);
            maps.dev_index_ensure(ctx.downstream_index);

            let pair = ipv4.insert(key, &params);
            let _ = maps.upstream4.insert(pair.upstream_key, pair.upstream_value);
            let _ = maps
                .downstream4
                .insert(pair.downstream_key, pair.downstream_value);

            ConntrackAction::Offloaded {
                upstream_index: current.index,
                downstream_index: ctx.downstream_index,
                first_rule_on_upstream,
            }
        }
        ConntrackMsgKind::Delete => {
            let Some(client) = clients.find_by_address(event.original.src) else {
                return ConntrackAction::NotFound;
            };
            let key = Ipv4RuleKey {
                downstream_index: client.downstream_index,
                downstream_mac: client.downstream_mac,
                proto: event.original.proto,
                client_ipv4: event.original.src,
                remote_ipv4: event.original.dst,
                client_port: event.original.src_port,
                remote_port: event.original.dst_port,
            };
            let Some(pair) = ipv4.remove(&key) else {
                return ConntrackAction::NotFound;
            };
            let upstream_index = pair.upstream_value.oif;
            let _ = maps.upstream4.delete(&pair.upstream_key);
            let _ = maps.downstream4.delete(&pair.downstream_key);

            let final_upstream_snapshot = (ipv4.count_on_upstream(upstream_index) == 0)
                .then(|| maps.clear_upstream_accounting(upstream_index));

            ConntrackAction::Withdrawn {
                upstream_index,
                downstream_index: client.downstream_index,
                final_upstream_snapshot,
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::client::ClientInfo;
    use crate::iface_index::InterfaceParams;
    use crate::upstream::{TransportKind, UpstreamInfo};

    fn client() -> ClientInfo {
        ClientInfo {
            downstream_index: 2001,
            downstream_mac: MacAddr::from([0xaa; 6]),
            client_ipv4: Ipv4Addr::new(192, 168, 80, 12),
            client_mac: MacAddr::from([0x02, 0, 0, 0, 0, 1]),
        }
    }

    fn ready_upstream() -> UpstreamManager {
        let mut manager = UpstreamManager::new();
        manager.set(Some(UpstreamInfo {
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
            has_ipv4: true,
            has_ipv6: false,
            is_xlat: false,
            is_virtual: false,
        }));
        manager
    }

    fn new_event(dst_port: u16) -> ConntrackEvent {
        ConntrackEvent {
            kind: ConntrackMsgKind::New,
            original: ConntrackTuple {
                src: Ipv4Addr::new(192, 168, 80, 12),
                dst: Ipv4Addr::new(140, 112, 8, 116),
                proto: IPPROTO_TCP as u16,
                src_port: 55001,
                dst_port,
            },
            reply: ConntrackTuple {
                src: Ipv4Addr::new(140, 112, 8, 116),
                dst: Ipv4Addr::new(203, 0, 113, 9),
                proto: IPPROTO_TCP as u16,
                src_port: dst_port,
                dst_port: 62449,
            },
            status: ConntrackStatus::ESTABLISHED | ConntrackStatus::ASSURED,
            timeout_secs: 300,
        }
    }

    fn resolve_ctx(_downstream: u32, _client_ipv4: Ipv4Addr) -> Option<OffloadContext> {
        Some(OffloadContext {
            downstream_index: 2001,
            downstream_mac: MacAddr::from([0xaa; 6]),
            client_mac: MacAddr::from([0x02, 0, 0, 0, 0, 1]),
            upstream_mac: MacAddr::from([0xbb; 6]),
            upstream_neighbor_mac: MacAddr::from([0xcc; 6]),
            pmtu: 1500,
        })
    }

    #[test]
    fn new_flow_seeds_accounting_and_writes_both_maps() {
        let mut clients = ClientTable::new();
        clients.client_add(client());
        let upstream = ready_upstream();
        let mut ipv4 = Ipv4Store::new();
        let mut maps = Maps::in_memory();
        let config = Config::default();

        let action = handle(
            &new_event(443),
            &config,
            &clients,
            &upstream,
            &mut ipv4,
            &mut maps,
            resolve_ctx,
        );
        assert_eq!(
            action,
            ConntrackAction::Offloaded {
                upstream_index: 1001,
                downstream_index: 2001,
                first_rule_on_upstream: true,
            }
        );
        assert_eq!(maps.upstream4.len(), 1);
        assert_eq!(maps.downstream4.len(), 1);
        assert_eq!(maps.limit.len(), 1);
        assert_eq!(maps.stats.len(), 1);
    }

    #[test]
    fn non_offload_port_is_dropped_both_directions() {
        let mut clients = ClientTable::new();
        clients.client_add(client());
        let upstream = ready_upstream();
        let mut ipv4 = Ipv4Store::new();
        let mut maps = Maps::in_memory();
        let mut config = Config::default();
        config.non_offload_tcp_ports = vec![22];

        let action = handle(
            &new_event(22),
            &config,
            &clients,
            &upstream,
            &mut ipv4,
            &mut maps,
            resolve_ctx,
        );
        assert_eq!(action, ConntrackAction::NotEligible);
        assert_eq!(maps.upstream4.len(), 0);
    }

    #[test]
    fn unknown_client_is_dropped_by_f2() {
        let clients = ClientTable::new();
        let upstream = ready_upstream();
        let mut ipv4 = Ipv4Store::new();
        let mut maps = Maps::in_memory();
        let config = Config::default();

        let action = handle(
            &new_event(443),
            &config,
            &clients,
            &upstream,
            &mut ipv4,
            &mut maps,
            resolve_ctx,
        );
        assert_eq!(action, ConntrackAction::NotEligible);
    }

    #[test]
    fn delete_removes_both_entries_and_clears_accounting_when_last() {
        let mut clients = ClientTable::new();
        clients.client_add(client());
        let upstream = ready_upstream();
        let mut ipv4 = Ipv4Store::new();
        let mut maps = Maps::in_memory();
        let config = Config::default();

        handle(
            &new_event(443),
            &config,
            &clients,
            &upstream,
            &mut ipv4,
            &mut maps,
            resolve_ctx,
        );

        let mut del_event = new_event(443);
        del_event.kind = ConntrackMsgKind::Delete;
        let action = handle(
            &del_event,
            &config,
            &clients,
            &upstream,
            &mut ipv4,
            &mut maps,
            resolve_ctx,
        );
        assert_eq!(
            action,
            ConntrackAction::Withdrawn {
                upstream_index: 1001,
                downstream_index: 2001,
                final_upstream_snapshot: Some(StatsValue::default()),
            }
        );
        assert_eq!(maps.upstream4.len(), 0);
        assert_eq!(maps.downstream4.len(), 0);
        assert_eq!(maps.limit.len(), 0);
        assert_eq!(maps.stats.len(), 0);
    }

    #[test]
    fn established_flag_missing_blocks_new_flow() {
        let mut clients = ClientTable::new();
        clients.client_add(client());
        let upstream = ready_upstream();
        let mut ipv4 = Ipv4Store::new();
        let mut maps = Maps::in_memory();
        let config = Config::default();

        let mut event = new_event(443);
        event.status = ConntrackStatus::SEEN_REPLY;
        let action = handle(
            &event,
            &config,
            &clients,
            &upstream,
            &mut ipv4,
            &mut maps,
            resolve_ctx,
        );
        assert_eq!(action, ConntrackAction::NotEligible);
    }
}
