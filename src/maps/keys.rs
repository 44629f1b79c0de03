//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! Bit-exact key/value layouts for the six kernel-resident forwarding maps,
//! plus the two bookkeeping maps (interface-index, error-counter).
//!
//! These types are shared verbatim between userspace (this crate) and the
//! datapath program attached to the downstream/upstream interfaces, so their
//! `#[repr(C)]` layout must match byte-for-byte. Each struct carries a
//! compile-time size assertion; padding fields are explicit rather than
//! relying on the compiler to insert them identically on both sides.

use std::net::Ipv4Addr;

use crate::mac_addr::MacAddr;

/// A 5-tuple plus ingress interface/MAC: the primary key for an IPv4
/// offloaded flow.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct Tether4Key {
    pub iif: u32,
    pub dst_mac: [u8; 6],
    pub pad: u16,
    pub proto: u16,
    pub src4: [u8; 4],
    pub dst4: [u8; 4],
    pub src_port: u16,
    pub dst_port: u16,
}

const _: () = assert!(std::mem::size_of::<Tether4Key>() == 26);

/// The forwarding instructions the datapath applies to packets matching a
/// [`Tether4Key`].
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Tether4Value {
    pub oif: u32,
    pub eth_dst: [u8; 6],
    pub eth_src: [u8; 6],
    pub eth_proto: u16,
    pub pmtu: u16,
    pub src46: [u8; 16],
    pub dst46: [u8; 16],
    pub src_port: u16,
    pub dst_port: u16,
    pub last_used: u64,
}

const _: () = assert!(std::mem::size_of::<Tether4Value>() == 64);

/// Key for an upstream-direction IPv6 rule: one per (downstream, prefix).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct Upstream6Key {
    pub iif: u32,
    pub dst_mac: [u8; 6],
    pub pad: [u8; 6],
    pub prefix64: [u8; 8],
}

const _: () = assert!(std::mem::size_of::<Upstream6Key>() == 24);

/// Value shared by upstream6 and downstream6 entries.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Tether6Value {
    pub oif: u32,
    pub eth_dst: [u8; 6],
    pub eth_src: [u8; 6],
    pub eth_proto: u16,
    pub pmtu: u16,
}

const _: () = assert!(std::mem::size_of::<Tether6Value>() == 20);

/// Key for a downstream-direction IPv6 rule: one per reachable neighbor.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct Downstream6Key {
    pub iif: u32,
    pub dst_mac: [u8; 6],
    pub pad: u16,
    pub neighbor6: [u8; 16],
}

const _: () = assert!(std::mem::size_of::<Downstream6Key>() == 28);

/// Per-interface byte/packet counters, updated by the datapath and only ever
/// read or read-and-cleared by userspace.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct StatsKey {
    pub ifindex: u32,
}

const _: () = assert!(std::mem::size_of::<StatsKey>() == 4);

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct StatsValue {
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub rx_errors: u64,
    pub tx_packets: u64,
    pub tx_bytes: u64,
    pub tx_errors: u64,
}

const _: () = assert!(std::mem::size_of::<StatsValue>() == 48);

impl StatsValue {
    pub fn total_bytes(&self) -> u64 {
        self.rx_bytes.saturating_add(self.tx_bytes)
    }

    /// Returns the element-wise delta `self - previous`, saturating at zero
    /// per field (the datapath counters are monotonic until cleared).
    pub fn delta_since(&self, previous: &StatsValue) -> StatsValue {
        StatsValue {
            rx_packets: self.rx_packets.saturating_sub(previous.rx_packets),
            rx_bytes: self.rx_bytes.saturating_sub(previous.rx_bytes),
            rx_errors: self.rx_errors.saturating_sub(previous.rx_errors),
            tx_packets: self.tx_packets.saturating_sub(previous.tx_packets),
            tx_bytes: self.tx_bytes.saturating_sub(previous.tx_bytes),
            tx_errors: self.tx_errors.saturating_sub(previous.tx_errors),
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct LimitKey {
    pub ifindex: u32,
}

const _: () = assert!(std::mem::size_of::<LimitKey>() == 4);

#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LimitValue {
    pub quota_bytes: u64,
}

impl LimitValue {
    pub const UNLIMITED: LimitValue = LimitValue {
        quota_bytes: u64::MAX,
    };
}

impl Default for LimitValue {
    fn default() -> LimitValue {
        LimitValue::UNLIMITED
    }
}

const _: () = assert!(std::mem::size_of::<LimitValue>() == 8);

/// Key for the interface-index bookkeeping map: present iff at least one
/// rule currently references the interface (invariant I4).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct DevMapKey {
    pub ifindex: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DevMapValue {
    pub present: u8,
}

/// Key for the error-counter map: a structured reason code rather than a
/// free-form string, so the kernel-side representation stays fixed-size.
#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ErrorReasonKey {
    pub reason: u32,
}

// ===== helper conversions =====

impl Tether4Key {
    pub fn new(
        iif: u32,
        dst_mac: MacAddr,
        proto: u16,
        src: Ipv4Addr,
        dst: Ipv4Addr,
        src_port: u16,
        dst_port: u16,
    ) -> Self {
        Tether4Key {
            iif,
            dst_mac: dst_mac.as_bytes(),
            pad: 0,
            proto,
            src4: src.octets(),
            dst4: dst.octets(),
            src_port,
            dst_port,
        }
    }

    pub fn src_addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.src4)
    }

    pub fn dst_addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.dst4)
    }
}

fn ipv4_mapped(addr: Ipv4Addr) -> [u8; 16] {
    let mut mapped = [0u8; 16];
    mapped[10] = 0xff;
    mapped[11] = 0xff;
    mapped[12..16].copy_from_slice(&addr.octets());
    mapped
}

impl Tether4Value {
    pub fn new(
        oif: u32,
        eth_dst: MacAddr,
        eth_src: MacAddr,
        eth_proto: u16,
        pmtu: u16,
        src: Ipv4Addr,
        dst: Ipv4Addr,
        src_port: u16,
        dst_port: u16,
    ) -> Self {
        Tether4Value {
            oif,
            eth_dst: eth_dst.as_bytes(),
            eth_src: eth_src.as_bytes(),
            eth_proto,
            pmtu,
            src46: ipv4_mapped(src),
            dst46: ipv4_mapped(dst),
            src_port,
            dst_port,
            last_used: 0,
        }
    }
}

impl Upstream6Key {
    pub fn new(iif: u32, dst_mac: MacAddr, prefix64: [u8; 8]) -> Self {
        Upstream6Key {
            iif,
            dst_mac: dst_mac.as_bytes(),
            pad: [0; 6],
            prefix64,
        }
    }
}

impl Downstream6Key {
    pub fn new(iif: u32, dst_mac: MacAddr, neighbor6: std::net::Ipv6Addr) -> Self {
        Downstream6Key {
            iif,
            dst_mac: dst_mac.as_bytes(),
            pad: 0,
            neighbor6: neighbor6.octets(),
        }
    }
}

// Every type below is `#[repr(C)]`, has no uninitialized padding (padding
// fields are explicit), and is valid for any bit pattern the kernel may
// place in the backing map, which is what `aya::Pod` requires.
#[allow(unsafe_code)]
mod pod {
    use super::{
        DevMapKey, DevMapValue, Downstream6Key, ErrorReasonKey, LimitKey,
        LimitValue, StatsKey, StatsValue, Tether4Key, Tether4Value,
        Tether6Value, Upstream6Key,
    };

    unsafe impl aya::Pod for Tether4Key {}
    unsafe impl aya::Pod for Tether4Value {}
    unsafe impl aya::Pod for Upstream6Key {}
    unsafe impl aya::Pod for Tether6Value {}
    unsafe impl aya::Pod for Downstream6Key {}
    unsafe impl aya::Pod for StatsKey {}
    unsafe impl aya::Pod for StatsValue {}
    unsafe impl aya::Pod for LimitKey {}
    unsafe impl aya::Pod for LimitValue {}
    unsafe impl aya::Pod for DevMapKey {}
    unsafe impl aya::Pod for DevMapValue {}
    unsafe impl aya::Pod for ErrorReasonKey {}
}

#[cfg(test)]
mod test {
    use std::net::{Ipv4Addr, Ipv6Addr};

    use super::*;

    #[test]
    fn tether4_key_swap_matches_downstream_direction() {
        let mac_down = MacAddr::from([0x02, 0, 0, 0, 0, 1]);
        let upstream_key = Tether4Key::new(
            2001,
            mac_down,
            libc::IPPROTO_TCP as u16,
            Ipv4Addr::new(192, 168, 80, 12),
            Ipv4Addr::new(140, 112, 8, 116),
            55001,
            443,
        );
        let downstream_key = Tether4Key::new(
            1001,
            MacAddr::ZERO,
            libc::IPPROTO_TCP as u16,
            Ipv4Addr::new(140, 112, 8, 116),
            Ipv4Addr::new(192, 168, 80, 12),
            443,
            55001,
        );
        assert_eq!(upstream_key.src_addr(), downstream_key.dst_addr());
        assert_eq!(upstream_key.dst_addr(), downstream_key.src_addr());
    }

    #[test]
    fn tether4_value_embeds_ipv4_mapped_addresses() {
        let value = Tether4Value::new(
            1001,
            MacAddr::BROADCAST,
            MacAddr::ZERO,
            libc::ETH_P_IP as u16,
            1500,
            Ipv4Addr::new(192, 168, 80, 12),
            Ipv4Addr::new(140, 112, 8, 116),
            55001,
            443,
        );
        assert_eq!(value.src46[10..12], [0xff, 0xff]);
        assert_eq!(&value.src46[12..16], &[192, 168, 80, 12]);
        assert_eq!(value.last_used, 0);
    }

    #[test]
    fn downstream6_key_round_trips_address() {
        let addr: Ipv6Addr = "2001:db8:0:1234::1".parse().unwrap();
        let key = Downstream6Key::new(1001, MacAddr::ZERO, addr);
        assert_eq!(Ipv6Addr::from(key.neighbor6), addr);
    }

    #[test]
    fn stats_value_delta_saturates_on_reset_counters() {
        let previous = StatsValue {
            rx_bytes: 1_000,
            ..Default::default()
        };
        let current = StatsValue {
            rx_bytes: 200,
            ..Default::default()
        };
        // Counter reset (e.g. datapath reload) must not underflow.
        assert_eq!(current.delta_since(&previous).rx_bytes, 0);
    }

    #[test]
    fn limit_value_default_is_unlimited() {
        assert_eq!(LimitValue::default(), LimitValue::UNLIMITED);
    }
}
