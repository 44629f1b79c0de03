//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! Per-downstream client table: IPv4 client address to
//! (MAC, downstream index, downstream MAC). Created on the first valid IPv4
//! neighbor event for a downstream; destroyed on delete/fail or when the
//! owning downstream is removed.
//!
//! This module tracks membership only. Eviction of the IPv4 forwarding
//! rules tied to a removed client is the coordinator's job (it owns both
//! this table and the IPv4 rule store), keeping "the rule is in memory"
//! separate from "the rule is in the map".

use std::collections::HashMap;
use std::net::Ipv4Addr;

use crate::mac_addr::MacAddr;

/// A tethered client reachable from one downstream interface.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ClientInfo {
    pub downstream_index: u32,
    pub downstream_mac: MacAddr,
    pub client_ipv4: Ipv4Addr,
    pub client_mac: MacAddr,
}

#[derive(Debug, Default)]
pub struct ClientTable {
    // downstream index -> (client ipv4 -> info)
    downstreams: HashMap<u32, HashMap<Ipv4Addr, ClientInfo>>,
}

// ===== impl ClientTable =====

impl ClientTable {
    pub fn new() -> Self {
        ClientTable::default()
    }

    /// Returns whether `addr` is eligible to be admitted as a client
    /// address: link-local (169.254/16) and multicast (224.0.0.0/4)
    /// addresses are never admitted.
    pub fn is_admissible(addr: Ipv4Addr) -> bool {
        !addr.is_link_local() && !addr.is_multicast()
    }

    /// Inserts or replaces the client entry. Returns `false` without
    /// modifying anything if `client.client_ipv4` is not admissible.
    pub fn client_add(&mut self, client: ClientInfo) -> bool {
        if !Self::is_admissible(client.client_ipv4) {
            return false;
        }
        self.downstreams
            .entry(client.downstream_index)
            .or_default()
            .insert(client.client_ipv4, client);
        true
    }

    /// Removes a single client. Returns the removed entry, if any; the
    /// downstream's entry in the table is dropped entirely once its last
    /// client is removed.
    pub fn client_remove(
        &mut self,
        downstream: u32,
        client_ipv4: Ipv4Addr,
    ) -> Option<ClientInfo> {
        let clients = self.downstreams.get_mut(&downstream)?;
        let removed = clients.remove(&client_ipv4);
        if clients.is_empty() {
            self.downstreams.remove(&downstream);
        }
        removed
    }

    /// Removes every client on `downstream`, returning them for the caller
    /// to withdraw any associated IPv4 rules.
    pub fn client_clear(&mut self, downstream: u32) -> Vec<ClientInfo> {
        self.downstreams
            .remove(&downstream)
            .map(|clients| clients.into_values().collect())
            .unwrap_or_default()
    }

    pub fn lookup(
        &self,
        downstream: u32,
        client_ipv4: Ipv4Addr,
    ) -> Option<&ClientInfo> {
        self.downstreams.get(&downstream)?.get(&client_ipv4)
    }

    /// Finds the client owning `client_ipv4` on any downstream, used by the
    /// conntrack consumer which only knows the address.
    pub fn find_by_address(&self, client_ipv4: Ipv4Addr) -> Option<&ClientInfo> {
        self.downstreams
            .values()
            .find_map(|clients| clients.get(&client_ipv4))
    }

    pub fn clients_on(&self, downstream: u32) -> impl Iterator<Item = &ClientInfo> {
        self.downstreams.get(&downstream).into_iter().flatten().map(|(_, v)| v)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn client(downstream: u32, ip: [u8; 4]) -> ClientInfo {
        ClientInfo {
            downstream_index: downstream,
            downstream_mac: MacAddr::from([0xaa; 6]),
            client_ipv4: Ipv4Addr::from(ip),
            client_mac: MacAddr::from([0x02, 0, 0, 0, 0, 1]),
        }
    }

    #[test]
    fn link_local_and_multicast_are_rejected() {
        let mut table = ClientTable::new();
        assert!(!table.client_add(client(2001, [169, 254, 1, 1])));
        assert!(!table.client_add(client(2001, [224, 0, 0, 1])));
        assert!(table.client_add(client(2001, [192, 168, 80, 12])));
    }

    #[test]
    fn removing_last_client_drops_downstream_entry() {
        let mut table = ClientTable::new();
        table.client_add(client(2001, [192, 168, 80, 12]));
        assert!(table
            .client_remove(2001, Ipv4Addr::new(192, 168, 80, 12))
            .is_some());
        assert_eq!(table.clients_on(2001).count(), 0);
        assert!(table.lookup(2001, Ipv4Addr::new(192, 168, 80, 12)).is_none());
    }

    #[test]
    fn find_by_address_searches_across_downstreams() {
        let mut table = ClientTable::new();
        table.client_add(client(2001, [192, 168, 80, 12]));
        table.client_add(client(2002, [192, 168, 90, 5]));
        let found = table
            .find_by_address(Ipv4Addr::new(192, 168, 90, 5))
            .unwrap();
        assert_eq!(found.downstream_index, 2002);
    }

    #[test]
    fn client_clear_returns_all_entries_and_empties_downstream() {
        let mut table = ClientTable::new();
        table.client_add(client(2001, [192, 168, 80, 12]));
        table.client_add(client(2001, [192, 168, 80, 13]));
        let cleared = table.client_clear(2001);
        assert_eq!(cleared.len(), 2);
        assert_eq!(table.clients_on(2001).count(), 0);
    }
}
