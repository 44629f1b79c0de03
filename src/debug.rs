//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::IpAddr;

use tracing::{debug, debug_span};

use crate::mac_addr::MacAddr;

// Coordinator debug messages.
#[derive(Debug)]
pub enum Debug<'a> {
    DownstreamAdd(u32),
    DownstreamRemove(u32),
    UpstreamChanged(u32),
    NeighborAdmitted(u32, &'a IpAddr, &'a MacAddr),
    NeighborDropped(u32, &'a IpAddr),
    FlowOffloaded(u32, u32),
    FlowWithdrawn(u32, u32),
    DegradedMode,
}

// ===== impl Debug =====

impl<'a> Debug<'a> {
    // Logs the debug message using the tracing API.
    pub(crate) fn log(&self) {
        match self {
            Debug::DownstreamAdd(index) | Debug::DownstreamRemove(index) => {
                debug!(ifindex = index, "{}", self);
            }
            Debug::UpstreamChanged(index) => {
                debug!(ifindex = index, "{}", self);
            }
            Debug::NeighborAdmitted(downstream, addr, mac) => {
                debug_span!("neighbor").in_scope(|| {
                    debug!(downstream, %addr, %mac, "{}", self);
                });
            }
            Debug::NeighborDropped(downstream, addr) => {
                debug_span!("neighbor").in_scope(|| {
                    debug!(downstream, %addr, "{}", self);
                });
            }
            Debug::FlowOffloaded(upstream, downstream)
            | Debug::FlowWithdrawn(upstream, downstream) => {
                debug_span!("conntrack").in_scope(|| {
                    debug!(upstream, downstream, "{}", self);
                });
            }
            Debug::DegradedMode => {
                debug!("{}", self);
            }
        }
    }
}

impl<'a> std::fmt::Display for Debug<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Debug::DownstreamAdd(..) => write!(f, "downstream registered"),
            Debug::DownstreamRemove(..) => write!(f, "downstream removed"),
            Debug::UpstreamChanged(..) => write!(f, "upstream changed"),
            Debug::NeighborAdmitted(..) => write!(f, "neighbor admitted"),
            Debug::NeighborDropped(..) => write!(f, "neighbor dropped"),
            Debug::FlowOffloaded(..) => write!(f, "flow offloaded"),
            Debug::FlowWithdrawn(..) => write!(f, "flow withdrawn"),
            Debug::DegradedMode => {
                write!(f, "entering degraded mode, offload disabled")
            }
        }
    }
}
