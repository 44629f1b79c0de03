//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! Tethering offload coordinator: keeps a set of kernel BPF maps in sync
//! with the interfaces, neighbors and conntrack flows that make up the
//! currently eligible subset of tethered traffic, so that subset can be
//! forwarded by a datapath program without involving this process again.
//!
//! [`coordinator`] holds the actual state machine and is usable on its own
//! against an in-memory [`maps::Maps::in_memory`] registry (see its test
//! module for runnable scenarios). [`instance`] wires a [`coordinator::Coordinator`]
//! to the real kernel maps, the real datapath attachments and the netlink
//! transports that feed it neighbor and conntrack events, and is what the
//! `holo-tether` binary actually runs.

pub mod client;
pub mod config;
pub mod conntrack;
pub mod coordinator;
pub mod datapath;
pub mod debug;
pub mod downstream;
pub mod error;
pub mod iface_index;
pub mod instance;
pub mod ipv4;
pub mod ipv6;
pub mod mac_addr;
pub mod maps;
pub mod neighbor;
pub mod netfilter;
pub mod netlink;
pub mod stats;
pub mod task;
pub mod upstream;
