//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! Bidirectional interface-name/index cache. Entries are never
//! removed while the coordinator is running: kernel map references to an
//! ifindex can outlive the userspace bookkeeping for it, so dropping an
//! entry here would only make future lookups fail without freeing anything.

use std::collections::HashMap;

use crate::mac_addr::MacAddr;

/// Immutable per-interface parameters, resolved from the OS the first time
/// the interface is referenced.
#[derive(Clone, Debug, PartialEq)]
pub struct InterfaceParams {
    pub name: String,
    pub index: u32,
    pub mac: MacAddr,
    pub mtu: u32,
    pub has_ethernet: bool,
}

impl InterfaceParams {
    pub fn new(name: String, index: u32, mac: MacAddr, mtu: u32) -> Self {
        InterfaceParams {
            name,
            index,
            has_ethernet: !mac.is_zero(),
            mac,
            mtu,
        }
    }
}

#[derive(Debug, Default)]
pub struct IfaceIndex {
    by_index: HashMap<u32, InterfaceParams>,
    by_name: HashMap<String, u32>,
}

// ===== impl IfaceIndex =====

impl IfaceIndex {
    pub fn new() -> Self {
        IfaceIndex::default()
    }

    /// Idempotently records `params`. A second call for the same index
    /// overwrites the stored parameters (the MAC/MTU may change across a
    /// link flap) without disturbing anything keyed by the index.
    pub fn add(&mut self, params: InterfaceParams) {
        self.by_name.insert(params.name.clone(), params.index);
        self.by_index.insert(params.index, params);
    }

    pub fn by_index(&self, index: u32) -> Option<&InterfaceParams> {
        self.by_index.get(&index)
    }

    pub fn by_name(&self, name: &str) -> Option<&InterfaceParams> {
        self.by_name.get(name).and_then(|index| self.by_index(*index))
    }

    pub fn has_ethernet(&self, index: u32) -> bool {
        self.by_index(index)
            .map(|params| params.has_ethernet)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn add_is_idempotent_and_bidirectional() {
        let mut index = IfaceIndex::new();
        index.add(InterfaceParams::new(
            "rmnet0".to_owned(),
            1001,
            MacAddr::ZERO,
            1500,
        ));
        index.add(InterfaceParams::new(
            "rmnet0".to_owned(),
            1001,
            MacAddr::ZERO,
            1500,
        ));

        assert_eq!(index.by_index(1001).unwrap().name, "rmnet0");
        assert_eq!(index.by_name("rmnet0").unwrap().index, 1001);
        assert!(!index.has_ethernet(1001));
    }

    #[test]
    fn ethernet_interfaces_are_flagged_by_nonzero_mac() {
        let mut index = IfaceIndex::new();
        index.add(InterfaceParams::new(
            "wlan1".to_owned(),
            2001,
            MacAddr::from([0xaa; 6]),
            1500,
        ));
        assert!(index.has_ethernet(2001));
    }

    #[test]
    fn unknown_interfaces_resolve_to_none() {
        let index = IfaceIndex::new();
        assert!(index.by_index(1).is_none());
        assert!(index.by_name("eth0").is_none());
    }
}
