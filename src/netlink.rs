//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! Neighbor-cache transport. Watches `RTNLGRP_NEIGH`/`RTNLGRP_IPV6_NEIGH` on
//! a raw rtnetlink socket and decodes `RTM_NEWNEIGH`/`RTM_DELNEIGH` into
//! [`crate::neighbor::NeighborEvent`], so the coordinator never has to know
//! about netlink wire details directly.

#![allow(clippy::single_match)]

use capctl::caps::CapState;
use futures::channel::mpsc::UnboundedReceiver;
use futures::TryStreamExt;
use netlink_packet_core::{NetlinkMessage, NetlinkPayload};
use netlink_packet_route::constants::{RTNLGRP_IPV6_NEIGH, RTNLGRP_NEIGH};
use netlink_packet_route::neighbour::nlas::Nla as NeighbourNla;
use netlink_packet_route::neighbour::NeighbourMessage;
use netlink_packet_route::rtnl::RtnlMessage;
use netlink_sys::{AsyncSocket, SocketAddr};
use rtnetlink::{new_connection, Handle};
use tracing::{error, trace};

use crate::mac_addr::MacAddr;
use crate::neighbor::{NeighborEvent, NeighborOp, NudState};

pub type NeighborMonitor =
    UnboundedReceiver<(NetlinkMessage<RtnlMessage>, SocketAddr)>;

// Linux's NUD_* neighbor-cache state bits (include/uapi/linux/neighbour.h).
const NUD_INCOMPLETE: u16 = 0x01;
const NUD_REACHABLE: u16 = 0x02;
const NUD_STALE: u16 = 0x04;
const NUD_DELAY: u16 = 0x08;
const NUD_PROBE: u16 = 0x10;
const NUD_FAILED: u16 = 0x20;
const NUD_NOARP: u16 = 0x40;
const NUD_PERMANENT: u16 = 0x80;

fn nud_state_from_bits(state: u16) -> NudState {
    match state {
        s if s & NUD_REACHABLE != 0 => NudState::Reachable,
        s if s & NUD_STALE != 0 => NudState::Stale,
        s if s & NUD_PROBE != 0 => NudState::Probe,
        s if s & NUD_DELAY != 0 => NudState::Delay,
        s if s & (NUD_PERMANENT | NUD_NOARP) != 0 => NudState::Permanent,
        s if s & (NUD_FAILED | NUD_INCOMPLETE) != 0 => NudState::Failed,
        _ => NudState::Other,
    }
}

/// Decodes one `RTM_NEWNEIGH`/`RTM_DELNEIGH` message into a
/// [`NeighborEvent`], or `None` for anything this coordinator doesn't act
/// on (a different address family, a neighbor with no resolvable address).
fn decode_neigh_msg(op: NeighborOp, msg: NeighbourMessage) -> Option<NeighborEvent> {
    let iface_index = msg.header.ifindex;
    let nud_state = nud_state_from_bits(msg.header.state);

    let mut address = None;
    let mut mac = None;
    for nla in msg.nlas.into_iter() {
        match nla {
            NeighbourNla::Destination(bytes) => {
                address = parse_ip(&bytes);
            }
            NeighbourNla::LinkLocalAddress(bytes) => {
                if bytes.len() == MacAddr::LENGTH {
                    let mut raw = [0u8; 6];
                    raw.copy_from_slice(&bytes);
                    mac = Some(MacAddr::from(raw));
                }
            }
            _ => (),
        }
    }

    let address = address?;
    let op = if op == NeighborOp::Del && nud_state == NudState::Failed {
        NeighborOp::Failed
    } else {
        op
    };

    Some(NeighborEvent {
        op,
        iface_index,
        address,
        nud_state,
        mac,
    })
}

fn parse_ip(bytes: &[u8]) -> Option<std::net::IpAddr> {
    match bytes.len() {
        4 => {
            let mut raw = [0u8; 4];
            raw.copy_from_slice(bytes);
            Some(std::net::Ipv4Addr::from(raw).into())
        }
        16 => {
            let mut raw = [0u8; 16];
            raw.copy_from_slice(bytes);
            Some(std::net::Ipv6Addr::from(raw).into())
        }
        _ => None,
    }
}

/// Decodes one message off the monitor stream, if it's a neighbor-cache
/// transition this coordinator cares about.
pub fn decode(msg: NetlinkMessage<RtnlMessage>) -> Option<NeighborEvent> {
    let NetlinkPayload::InnerMessage(msg) = msg.payload else {
        return None;
    };
    match msg {
        RtnlMessage::NewNeighbour(msg) => decode_neigh_msg(NeighborOp::New, msg),
        RtnlMessage::DelNeighbour(msg) => decode_neigh_msg(NeighborOp::Del, msg),
        _ => None,
    }
}

/// Opens a request handle plus a multicast monitor bound to
/// `RTNLGRP_NEIGH`/`RTNLGRP_IPV6_NEIGH`, mirroring the two-socket split
/// (a privileged request handle, a monitor with no elevated capabilities
/// of its own) used for link/address netlink traffic elsewhere in the
/// workspace.
pub async fn init() -> (Handle, NeighborMonitor) {
    let (conn, handle, _) =
        new_connection().expect("failed to create netlink socket");

    std::thread::spawn(|| {
        let mut caps = CapState::get_current().unwrap();
        caps.effective = caps.permitted;
        if let Err(error) = caps.set_current() {
            error!(%error, "failed to raise capabilities for netlink request socket");
        }
        futures::executor::block_on(conn)
    });

    let (mut conn, _, monitor) =
        new_connection().expect("failed to create netlink socket");
    let groups = [RTNLGRP_NEIGH, RTNLGRP_IPV6_NEIGH]
        .iter()
        .map(|group| 1 << (group - 1))
        .fold(0, std::ops::BitOr::bitor);
    let addr = SocketAddr::new(0, groups);
    conn.socket_mut()
        .socket_mut()
        .bind(&addr)
        .expect("failed to bind neighbor monitor socket");
    tokio::spawn(conn);

    (handle, monitor)
}

/// Dumps the current neighbor table on startup, so neighbors that were
/// already resolved before this process started are not missed (mirrors
/// the initial link/address dump done for interface state elsewhere in
/// the workspace).
pub async fn dump(handle: &Handle) -> Vec<NeighborEvent> {
    let mut events = Vec::new();
    let mut neighbours = handle.neighbours().get().execute();
    loop {
        match neighbours.try_next().await {
            Ok(Some(msg)) => {
                trace!(?msg, "received initial neighbor dump entry");
                if let Some(event) = decode_neigh_msg(NeighborOp::New, msg) {
                    events.push(event);
                }
            }
            Ok(None) => break,
            Err(error) => {
                error!(%error, "failed to dump neighbor table");
                break;
            }
        }
    }
    events
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn nud_bits_map_to_offload_classes() {
        assert_eq!(nud_state_from_bits(NUD_REACHABLE), NudState::Reachable);
        assert_eq!(nud_state_from_bits(NUD_STALE), NudState::Stale);
        assert_eq!(nud_state_from_bits(NUD_PERMANENT), NudState::Permanent);
        assert_eq!(nud_state_from_bits(NUD_FAILED), NudState::Failed);
        assert_eq!(nud_state_from_bits(0), NudState::Other);
    }

    #[test]
    fn parse_ip_rejects_malformed_lengths() {
        assert!(parse_ip(&[1, 2, 3]).is_none());
        assert!(parse_ip(&[192, 168, 1, 1]).is_some());
    }
}
