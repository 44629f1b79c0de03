//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! Conntrack transport: a raw `NETLINK_NETFILTER` socket carrying ctnetlink
//! (`nfnetlink_conntrack`) messages. Netlink-packet-route has no typed
//! message for this subsystem, so NEW/DESTROY notifications and the
//! timeout-refresh updates this module sends are built and parsed by hand
//! from the raw NLA stream, the same way the rest of the workspace decodes
//! link/address attributes it does have typed support for.

use std::io;
use std::net::Ipv4Addr;

use bytes::BytesMut;
use libc::{IPPROTO_TCP, IPPROTO_UDP};
use netlink_sys::{AsyncSocket, SocketAddr, TokioSocket};
use tracing::{error, trace, warn};

use crate::coordinator::{ConntrackTimeoutSink, RefreshedFlow};
use crate::conntrack::{ConntrackEvent, ConntrackMsgKind, ConntrackStatus, ConntrackTuple};

// nfnetlink/ctnetlink constants (linux/netfilter/nfnetlink.h,
// linux/netfilter/nfnetlink_conntrack.h).
const NETLINK_NETFILTER: isize = 12;
const NFNL_SUBSYS_CTNETLINK: u16 = 1;
const IPCTNL_MSG_CT_NEW: u16 = 0;
const IPCTNL_MSG_CT_DELETE: u16 = 2;
const NLMSG_TYPE_NEW: u16 = (NFNL_SUBSYS_CTNETLINK << 8) | IPCTNL_MSG_CT_NEW;
const NLMSG_TYPE_DELETE: u16 = (NFNL_SUBSYS_CTNETLINK << 8) | IPCTNL_MSG_CT_DELETE;

const NFNLGRP_CONNTRACK_NEW: u32 = 1;
const NFNLGRP_CONNTRACK_UPDATE: u32 = 2;
const NFNLGRP_CONNTRACK_DESTROY: u32 = 3;

const CTA_TUPLE_ORIG: u16 = 1;
const CTA_TUPLE_REPLY: u16 = 2;
const CTA_STATUS: u16 = 3;
const CTA_TIMEOUT: u16 = 7;
const CTA_TUPLE_IP: u16 = 1;
const CTA_TUPLE_PROTO: u16 = 2;
const CTA_IP_V4_SRC: u16 = 1;
const CTA_IP_V4_DST: u16 = 2;
const CTA_PROTO_NUM: u16 = 1;
const CTA_PROTO_SRC_PORT: u16 = 2;
const CTA_PROTO_DST_PORT: u16 = 3;

const IPS_SEEN_REPLY: u32 = 1 << 1;
const IPS_ASSURED: u32 = 1 << 2;
const IPS_CONFIRMED: u32 = 1 << 3;

const NLM_F_REQUEST: u16 = 0x1;
const NLM_F_ACK: u16 = 0x4;

/// One raw NLA: `(attr_type, payload)`, with the nested-attribute bit
/// (`NLA_F_NESTED`, 0x8000) already masked out of `attr_type`.
struct RawNla<'a> {
    kind: u16,
    payload: &'a [u8],
}

/// Walks a buffer of back-to-back, 4-byte-aligned NLAs, matching the shape
/// `nlas.into_iter()` has elsewhere in the workspace but over bytes we have
/// no typed decoder for.
fn iter_nlas(buf: &[u8]) -> impl Iterator<Item = RawNla<'_>> {
    struct Iter<'a> {
        buf: &'a [u8],
    }
    impl<'a> Iterator for Iter<'a> {
        type Item = RawNla<'a>;
        fn next(&mut self) -> Option<RawNla<'a>> {
            if self.buf.len() < 4 {
                return None;
            }
            let len = u16::from_ne_bytes([self.buf[0], self.buf[1]]) as usize;
            let kind = u16::from_ne_bytes([self.buf[2], self.buf[3]]) & !0x8000;
            if len < 4 || len > self.buf.len() {
                return None;
            }
            let payload = &self.buf[4..len];
            let aligned = (len + 3) & !3;
            self.buf = &self.buf[aligned.min(self.buf.len())..];
            Some(RawNla { kind, payload })
        }
    }
    Iter { buf }
}

fn decode_tuple(buf: &[u8]) -> Option<ConntrackTuple> {
    let mut src = None;
    let mut dst = None;
    let mut proto = None;
    let mut src_port = None;
    let mut dst_port = None;

    for nla in iter_nlas(buf) {
        match nla.kind {
            CTA_TUPLE_IP => {
                for ip_nla in iter_nlas(nla.payload) {
                    match ip_nla.kind {
                        CTA_IP_V4_SRC if ip_nla.payload.len() == 4 => {
                            let mut raw = [0u8; 4];
                            raw.copy_from_slice(ip_nla.payload);
                            src = Some(Ipv4Addr::from(raw));
                        }
                        CTA_IP_V4_DST if ip_nla.payload.len() == 4 => {
                            let mut raw = [0u8; 4];
                            raw.copy_from_slice(ip_nla.payload);
                            dst = Some(Ipv4Addr::from(raw));
                        }
                        _ => {}
                    }
                }
            }
            CTA_TUPLE_PROTO => {
                for proto_nla in iter_nlas(nla.payload) {
                    match proto_nla.kind {
                        CTA_PROTO_NUM if !proto_nla.payload.is_empty() => {
                            proto = Some(proto_nla.payload[0] as u16);
                        }
                        CTA_PROTO_SRC_PORT if proto_nla.payload.len() == 2 => {
                            src_port = Some(u16::from_be_bytes([
                                proto_nla.payload[0],
                                proto_nla.payload[1],
                            ]));
                        }
                        CTA_PROTO_DST_PORT if proto_nla.payload.len() == 2 => {
                            dst_port = Some(u16::from_be_bytes([
                                proto_nla.payload[0],
                                proto_nla.payload[1],
                            ]));
                        }
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }

    Some(ConntrackTuple {
        src: src?,
        dst: dst?,
        proto: proto?,
        src_port: src_port.unwrap_or(0),
        dst_port: dst_port.unwrap_or(0),
    })
}

/// Decodes one ctnetlink message body (after the `nfgenmsg` header) into a
/// [`ConntrackEvent`], or `None` if either tuple is malformed or absent.
fn decode_body(kind: ConntrackMsgKind, buf: &[u8]) -> Option<ConntrackEvent> {
    let mut original = None;
    let mut reply = None;
    let mut status = ConntrackStatus::empty();
    let mut timeout_secs = 0u32;

    for nla in iter_nlas(buf) {
        match nla.kind {
            CTA_TUPLE_ORIG => original = decode_tuple(nla.payload),
            CTA_TUPLE_REPLY => reply = decode_tuple(nla.payload),
            CTA_STATUS if nla.payload.len() == 4 => {
                let bits = u32::from_be_bytes([
                    nla.payload[0],
                    nla.payload[1],
                    nla.payload[2],
                    nla.payload[3],
                ]);
                if bits & IPS_CONFIRMED != 0 {
                    status |= ConntrackStatus::ESTABLISHED;
                }
                if bits & IPS_SEEN_REPLY != 0 {
                    status |= ConntrackStatus::SEEN_REPLY;
                }
                if bits & IPS_ASSURED != 0 {
                    status |= ConntrackStatus::ASSURED;
                }
            }
            CTA_TIMEOUT if nla.payload.len() == 4 => {
                timeout_secs = u32::from_be_bytes([
                    nla.payload[0],
                    nla.payload[1],
                    nla.payload[2],
                    nla.payload[3],
                ]);
            }
            _ => {}
        }
    }

    Some(ConntrackEvent {
        kind,
        original: original?,
        reply: reply?,
        status,
        timeout_secs,
    })
}

/// Decodes one raw netlink message (`nlmsghdr` onward) read off the
/// conntrack monitor socket.
pub fn decode(buf: &[u8]) -> Option<ConntrackEvent> {
    if buf.len() < 16 {
        return None;
    }
    let msg_type = u16::from_ne_bytes([buf[4], buf[5]]);
    let kind = match msg_type {
        NLMSG_TYPE_NEW => ConntrackMsgKind::New,
        NLMSG_TYPE_DELETE => ConntrackMsgKind::Delete,
        _ => return None,
    };
    // nlmsghdr (16 bytes) + nfgenmsg (4 bytes: family, version, res_id).
    if buf.len() < 20 {
        return None;
    }
    decode_body(kind, &buf[20..])
}

fn push_nla(buf: &mut Vec<u8>, kind: u16, payload: &[u8]) {
    let len = 4 + payload.len();
    buf.extend_from_slice(&(len as u16).to_ne_bytes());
    buf.extend_from_slice(&kind.to_ne_bytes());
    buf.extend_from_slice(payload);
    let pad = (4 - (len % 4)) % 4;
    buf.extend(std::iter::repeat(0u8).take(pad));
}

fn push_nested_nla(buf: &mut Vec<u8>, kind: u16, build: impl FnOnce(&mut Vec<u8>)) {
    let start = buf.len();
    buf.extend_from_slice(&[0, 0]); // length patched below
    buf.extend_from_slice(&(kind | 0x8000).to_ne_bytes());
    build(buf);
    let len = (buf.len() - start) as u16;
    buf[start..start + 2].copy_from_slice(&len.to_ne_bytes());
    let pad = (4 - (buf.len() % 4)) % 4;
    buf.extend(std::iter::repeat(0u8).take(pad));
}

fn encode_timeout_refresh(seq: u32, flow: &RefreshedFlow) -> Vec<u8> {
    let mut body = Vec::new();
    push_nested_nla(&mut body, CTA_TUPLE_ORIG, |buf| {
        push_nested_nla(buf, CTA_TUPLE_IP, |buf| {
            push_nla(buf, CTA_IP_V4_SRC, &flow.src.octets());
            push_nla(buf, CTA_IP_V4_DST, &flow.dst.octets());
        });
        push_nested_nla(buf, CTA_TUPLE_PROTO, |buf| {
            push_nla(buf, CTA_PROTO_NUM, &[flow.proto as u8]);
            push_nla(buf, CTA_PROTO_SRC_PORT, &flow.src_port.to_be_bytes());
            push_nla(buf, CTA_PROTO_DST_PORT, &flow.dst_port.to_be_bytes());
        });
    });
    let timeout = if flow.proto as i32 == IPPROTO_TCP {
        crate::coordinator::TCP_ESTABLISHED_TIMEOUT_SECS
    } else if flow.proto as i32 == IPPROTO_UDP {
        crate::coordinator::UDP_STREAM_TIMEOUT_SECS
    } else {
        0
    };
    push_nla(&mut body, CTA_TIMEOUT, &timeout.to_be_bytes());

    let mut nfgenmsg = vec![libc::AF_INET as u8, 0, 0, 0];
    let mut payload = Vec::new();
    payload.append(&mut nfgenmsg);
    payload.extend_from_slice(&body);

    let total_len = 16 + payload.len();
    let mut msg = Vec::with_capacity(total_len);
    msg.extend_from_slice(&(total_len as u32).to_ne_bytes());
    msg.extend_from_slice(&NLMSG_TYPE_NEW.to_ne_bytes());
    msg.extend_from_slice(&(NLM_F_REQUEST | NLM_F_ACK).to_ne_bytes());
    msg.extend_from_slice(&seq.to_ne_bytes());
    msg.extend_from_slice(&0u32.to_ne_bytes()); // pid
    msg.extend_from_slice(&payload);
    msg
}

/// Raw conntrack monitor socket, bound to the NEW/UPDATE/DESTROY multicast
/// groups.
pub struct ConntrackMonitor {
    socket: TokioSocket,
}

impl ConntrackMonitor {
    pub fn bind() -> io::Result<Self> {
        let mut socket = TokioSocket::new(NETLINK_NETFILTER)?;
        let groups = (1u32 << (NFNLGRP_CONNTRACK_NEW - 1))
            | (1u32 << (NFNLGRP_CONNTRACK_UPDATE - 1))
            | (1u32 << (NFNLGRP_CONNTRACK_DESTROY - 1));
        socket.socket_mut().bind(&SocketAddr::new(0, groups))?;
        Ok(ConntrackMonitor { socket })
    }

    /// Waits for and decodes the next conntrack event, skipping messages
    /// this coordinator has no use for.
    pub async fn recv(&mut self) -> io::Result<ConntrackEvent> {
        loop {
            let mut buf = BytesMut::with_capacity(8192);
            self.socket.recv(&mut buf).await?;
            trace!(bytes = buf.len(), "received raw conntrack netlink message");
            if let Some(event) = decode(&buf) {
                return Ok(event);
            }
        }
    }
}

/// [`ConntrackTimeoutSink`] that issues the real `IPCTNL_MSG_CT_NEW`
/// timeout-refresh update over a dedicated request socket.
pub struct NetfilterTimeoutSink {
    socket: TokioSocket,
    seq: u32,
}

impl std::fmt::Debug for NetfilterTimeoutSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetfilterTimeoutSink").finish()
    }
}

impl NetfilterTimeoutSink {
    pub fn connect() -> io::Result<Self> {
        let mut socket = TokioSocket::new(NETLINK_NETFILTER)?;
        socket.socket_mut().bind(&SocketAddr::new(0, 0))?;
        Ok(NetfilterTimeoutSink { socket, seq: 0 })
    }
}

impl ConntrackTimeoutSink for NetfilterTimeoutSink {
    fn refresh_timeout(&mut self, flow: RefreshedFlow) {
        self.seq = self.seq.wrapping_add(1);
        let msg = encode_timeout_refresh(self.seq, &flow);
        if let Err(error) = self.socket.socket_mut().send(&msg, 0) {
            warn!(%error, "failed to refresh conntrack timeout");
        }
    }
}

pub(crate) fn log_bind_failure(error: &io::Error) {
    error!(%error, "failed to open conntrack netlink socket");
}
