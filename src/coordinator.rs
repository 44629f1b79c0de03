//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! The `BpfCoordinator` (design §1, §4): the single point that owns every
//! in-memory store and kernel map and dispatches the five event kinds
//! (`add_downstream`, `remove_downstream`, `upstream_changed`,
//! `neighbor_event`, `conntrack_event`) plus the three timer ticks (design
//! §4.10) against them. Every method here runs to completion before
//! returning, matching the single-threaded cooperative model of design §5:
//! the async wrapper in [`crate::task`]/`main.rs` is what actually
//! serializes concurrent callers onto one executor.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;

use tracing::warn;

use crate::client::{ClientInfo, ClientTable};
use crate::config::Config;
use crate::conntrack::{self, ConntrackAction, ConntrackEvent, OffloadContext};
use crate::datapath::{Datapath, NullDatapath, ProgramAttachments};
use crate::debug::Debug as CoordDebug;
use crate::downstream::DownstreamRegistry;
use crate::error::Error;
use crate::iface_index::{IfaceIndex, InterfaceParams};
use crate::ipv4::Ipv4Store;
use crate::ipv6::{Ipv6Store, UpstreamUpdatePlan};
use crate::mac_addr::MacAddr;
use crate::maps::{Maps, Tether4Key, Tether6Value, Upstream6Key};
use crate::neighbor::{self, NeighborAction, NeighborEvent};
use crate::stats::{NullStatsSink, QuotaStats, StatsSink};
use crate::upstream::{UpstreamInfo, UpstreamManager};

/// Outbound metrics sink (design §6: "Metrics sink").
pub trait MetricsSink: std::fmt::Debug + Send {
    fn report_active_sessions(&mut self, max_since_last_report: usize);
}

#[derive(Debug, Default)]
pub struct NullMetricsSink;

impl MetricsSink for NullMetricsSink {
    fn report_active_sessions(&mut self, _max_since_last_report: usize) {}
}

/// Outbound netlink conntrack-timeout-refresh sink (design §4.10, §6).
/// Implementations issue the actual `IPCTNL_MSG_CT_NEW` update; tests
/// record calls instead.
pub trait ConntrackTimeoutSink: std::fmt::Debug + Send {
    fn refresh_timeout(&mut self, flow: RefreshedFlow);
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RefreshedFlow {
    pub proto: u16,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
}

#[derive(Debug, Default)]
pub struct NullConntrackTimeoutSink;

impl ConntrackTimeoutSink for NullConntrackTimeoutSink {
    fn refresh_timeout(&mut self, _flow: RefreshedFlow) {}
}

/// TCP/UDP conntrack timeouts the refresh task re-applies (design §4.10).
pub const TCP_ESTABLISHED_TIMEOUT_SECS: u32 = 432_000;
pub const UDP_STREAM_TIMEOUT_SECS: u32 = 180;

pub struct Coordinator {
    config: Config,
    maps: Maps,
    iface_index: IfaceIndex,
    downstreams: DownstreamRegistry,
    clients: ClientTable,
    ipv6: Ipv6Store,
    ipv4: Ipv4Store,
    upstream: UpstreamManager,
    quota_stats: QuotaStats,
    attachments: ProgramAttachments,
    sessions_peak: usize,
    /// `last_used` observed for each upstream4 entry as of the previous
    /// conntrack timeout-refresh tick (design §4.10), so that tick can tell
    /// which flows the datapath has actually touched since.
    refresh_last_used: HashMap<Tether4Key, u64>,
    datapath: Box<dyn Datapath>,
    stats_sink: Box<dyn StatsSink>,
    metrics_sink: Box<dyn MetricsSink>,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("degraded", &self.maps.is_degraded())
            .field("downstreams", &self.downstreams.len())
            .field("active_sessions", &self.active_sessions())
            .finish()
    }
}

// ===== impl Coordinator =====

impl Coordinator {
    pub fn new(config: Config, maps: Maps) -> Self {
        Coordinator::with_collaborators(
            config,
            maps,
            Box::new(NullDatapath),
            Box::new(NullStatsSink),
            Box::new(NullMetricsSink),
        )
    }

    pub fn with_collaborators(
        config: Config,
        mut maps: Maps,
        datapath: Box<dyn Datapath>,
        stats_sink: Box<dyn StatsSink>,
        metrics_sink: Box<dyn MetricsSink>,
    ) -> Self {
        maps.clear_all();
        if maps.is_degraded() {
            CoordDebug::DegradedMode.log();
        }
        Coordinator {
            config,
            maps,
            iface_index: IfaceIndex::new(),
            downstreams: DownstreamRegistry::new(),
            clients: ClientTable::new(),
            ipv6: Ipv6Store::new(),
            ipv4: Ipv4Store::new(),
            upstream: UpstreamManager::new(),
            quota_stats: QuotaStats::new(),
            attachments: ProgramAttachments::new(),
            sessions_peak: 0,
            refresh_last_used: HashMap::new(),
            datapath,
            stats_sink,
            metrics_sink,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.maps.is_degraded()
    }

    pub fn has_downstreams(&self) -> bool {
        !self.downstreams.is_empty()
    }

    /// Invariant I6: the active-session count is defined as the number of
    /// unique entries in the upstream4 map, not the in-memory rule-store
    /// size — in degraded mode the map is always empty even though the
    /// in-memory store keeps tracking rules for dump purposes.
    pub fn active_sessions(&self) -> usize {
        self.maps.upstream4.len()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // ----- §6: add_ip_server / remove_ip_server -----

    /// Registers `params` as a downstream. Returns whether this was the
    /// first downstream overall, i.e. whether the caller must start the
    /// conntrack monitor (design §6).
    pub fn add_ip_server(&mut self, params: InterfaceParams) -> bool {
        let ifindex = params.index;
        self.iface_index.add(params);
        let first = self.downstreams.add(ifindex);
        CoordDebug::DownstreamAdd(ifindex).log();
        first
    }

    /// Unregisters `ifindex` as a downstream, withdrawing every client and
    /// rule attached to it. Returns whether this was the last downstream,
    /// i.e. whether the caller must stop the conntrack monitor and tear
    /// down the timers (design §5, §6).
    pub fn remove_ip_server(&mut self, ifindex: u32) -> bool {
        for client in self.clients.client_clear(ifindex) {
            self.withdraw_ipv4_rules_for_client(ifindex, client.client_ipv4);
        }
        let plan = self.ipv6.clear_all(ifindex);
        self.apply_ipv6_plan(ifindex, &plan);

        CoordDebug::DownstreamRemove(ifindex).log();
        self.downstreams.remove(ifindex).unwrap_or(true)
    }

    // ----- §4.3: client table -----

    pub fn client_add(&mut self, client: ClientInfo) -> bool {
        self.clients.client_add(client)
    }

    pub fn client_remove(&mut self, downstream: u32, client_ipv4: Ipv4Addr) {
        if self.clients.client_remove(downstream, client_ipv4).is_some() {
            self.withdraw_ipv4_rules_for_client(downstream, client_ipv4);
        }
    }

    pub fn client_clear(&mut self, downstream: u32) {
        for client in self.clients.client_clear(downstream) {
            self.withdraw_ipv4_rules_for_client(downstream, client.client_ipv4);
        }
    }

    fn withdraw_ipv4_rules_for_client(&mut self, downstream: u32, client_ipv4: Ipv4Addr) {
        for pair in self.ipv4.remove_by_client(downstream, client_ipv4) {
            let _ = self.maps.upstream4.delete(&pair.upstream_key);
            let _ = self.maps.downstream4.delete(&pair.downstream_key);
            let upstream_index = pair.upstream_value.oif;
            if self.ipv4.count_on_upstream(upstream_index) == 0 {
                let snapshot = self.maps.clear_upstream_accounting(upstream_index);
                self.quota_stats.account_and_forget(upstream_index, snapshot);
                self.gc_dev_index(upstream_index);
            }
            self.gc_dev_index(downstream);
        }
    }

    fn gc_dev_index(&mut self, ifindex: u32) {
        if !self.ipv4.references_ifindex(ifindex) && !self.ipv6.references_ifindex(ifindex) {
            self.maps.dev_index_remove(ifindex);
        }
    }

    // ----- §4.4/§4.8: IPv6 rule store and upstream manager -----

    /// `update_ipv6_upstream` (design §6): the per-downstream upstream
    /// entrypoint.
    pub fn update_ipv6_upstream(
        &mut self,
        downstream: u32,
        upstream_index: u32,
        prefixes: &HashSet<[u8; 8]>,
    ) {
        let plan = self.ipv6.update_upstream(downstream, upstream_index, prefixes);
        self.apply_ipv6_plan(downstream, &plan);
        CoordDebug::UpstreamChanged(upstream_index).log();
    }

    /// Applies an [`UpstreamUpdatePlan`] produced for `downstream` in the
    /// order design §4.4 requires: remove obsolete downstream6 entries,
    /// remove obsolete upstream6 entries, add new upstream6 entries, re-add
    /// downstream6 entries (invariant I5).
    fn apply_ipv6_plan(&mut self, downstream: u32, plan: &UpstreamUpdatePlan) {
        let downstream_mac = self
            .iface_index
            .by_index(downstream)
            .map(|params| params.mac)
            .unwrap_or_default();

        for rule in &plan.remove_downstream6 {
            neighbor::delete_downstream6(&mut self.maps, rule);
        }
        for prefix in &plan.remove_upstream6_prefixes {
            let key = Upstream6Key::new(downstream, downstream_mac, *prefix);
            let _ = self.maps.upstream6.delete(&key);
        }
        if !plan.add_upstream6_prefixes.is_empty() {
            let current = self.upstream.current().clone();
            for prefix in &plan.add_upstream6_prefixes {
                let key = Upstream6Key::new(downstream, downstream_mac, *prefix);
                let value = Tether6Value {
                    oif: current.index,
                    eth_dst: current.gateway_mac.as_bytes(),
                    eth_src: current.iface.mac.as_bytes(),
                    eth_proto: libc::ETH_P_IPV6 as u16,
                    pmtu: current.iface.mtu.min(u16::MAX as u32) as u16,
                };
                let _ = self.maps.upstream6.insert(key, value);
                self.maps.dev_index_ensure(current.index);
            }
        }
        for rule in &plan.add_downstream6 {
            neighbor::write_downstream6(&mut self.maps, rule);
            self.maps.dev_index_ensure(rule.downstream_index);
        }
    }

    /// `update_upstream_network_state` (design §6, §4.8): the global
    /// upstream-change entrypoint. `None` means the upstream was lost
    /// entirely.
    pub fn update_upstream_network_state(&mut self, state: Option<UpstreamInfo>) {
        let outcome = self.upstream.set(state);

        if outcome.lost_ipv4_support {
            self.drain_ipv4_on_upstream(outcome.previous_index);
        }

        let current = self.upstream.current().clone();
        let downstreams: Vec<u32> = self.downstreams.iter().collect();
        for downstream in downstreams {
            let plan = self.ipv6.update_upstream(downstream, current.index, &current.prefixes);
            self.apply_ipv6_plan(downstream, &plan);
        }
    }

    fn drain_ipv4_on_upstream(&mut self, upstream_index: u32) {
        let rules = self.ipv4.remove_all_on_upstream(upstream_index);
        if rules.is_empty() {
            return;
        }
        for pair in &rules {
            let _ = self.maps.upstream4.delete(&pair.upstream_key);
            let _ = self.maps.downstream4.delete(&pair.downstream_key);
            CoordDebug::FlowWithdrawn(pair.upstream_value.oif, pair.downstream_value.oif).log();
        }
        let snapshot = self.maps.clear_upstream_accounting(upstream_index);
        self.quota_stats.account_and_forget(upstream_index, snapshot);
        self.gc_dev_index(upstream_index);
    }

    // ----- §4.6: neighbor events -----

    pub fn neighbor_event(&mut self, event: &NeighborEvent) {
        let downstreams: HashSet<u32> = self.downstreams.iter().collect();
        let action = neighbor::handle(
            event,
            &downstreams,
            &self.iface_index,
            &mut self.clients,
            &mut self.ipv6,
            &mut self.maps,
        );
        match action {
            NeighborAction::ClientAdmitted => {
                CoordDebug::NeighborAdmitted(
                    event.iface_index,
                    &event.address,
                    &event.mac.unwrap_or_default(),
                )
                .log();
            }
            NeighborAction::ClientWithdrawn { downstream, client_ipv4 } => {
                self.withdraw_ipv4_rules_for_client(downstream, client_ipv4);
            }
            NeighborAction::Ipv6RuleWritten => {
                self.maps.dev_index_ensure(event.iface_index);
            }
            NeighborAction::Ignored => {
                CoordDebug::NeighborDropped(event.iface_index, &event.address).log();
            }
            _ => {}
        }
    }

    // ----- §4.7: conntrack events -----

    pub fn conntrack_event(&mut self, event: &ConntrackEvent) {
        let config = self.config.clone();
        let iface_index = &self.iface_index;
        let upstream = self.upstream.current().clone();
        let action = conntrack::handle(
            event,
            &config,
            &self.clients,
            &self.upstream,
            &mut self.ipv4,
            &mut self.maps,
            |downstream_index, _client_ipv4| resolve_offload_ctx(iface_index, downstream_index, &upstream),
        );

        match action {
            ConntrackAction::Offloaded {
                upstream_index,
                downstream_index,
                first_rule_on_upstream,
            } => {
                if first_rule_on_upstream {
                    self.quota_stats.apply_pending_limit(upstream_index, &mut self.maps);
                }
                self.sessions_peak = self.sessions_peak.max(self.active_sessions());
                CoordDebug::FlowOffloaded(upstream_index, downstream_index).log();
            }
            ConntrackAction::Withdrawn {
                upstream_index,
                downstream_index,
                final_upstream_snapshot,
            } => {
                if let Some(snapshot) = final_upstream_snapshot {
                    self.quota_stats.account_and_forget(upstream_index, snapshot);
                    self.gc_dev_index(upstream_index);
                }
                self.gc_dev_index(downstream_index);
                CoordDebug::FlowWithdrawn(upstream_index, downstream_index).log();
            }
            ConntrackAction::NotEligible | ConntrackAction::NotFound => {}
        }
    }

    // ----- §4.9: quota & stats -----

    pub fn set_data_limit(&mut self, iface_name: &str, bytes: i64) -> Result<(), Error> {
        if bytes < 0 {
            return Err(Error::InvariantViolation(format!(
                "negative data limit requested for {iface_name}"
            )));
        }
        let Some(params) = self.iface_index.by_name(iface_name) else {
            warn!(iface_name, "set_data_limit for unknown interface");
            return Ok(());
        };
        self.quota_stats.set_limit(params.index, bytes as u64, &mut self.maps);
        Ok(())
    }

    pub fn set_alert(&mut self, bytes: u64) {
        if self.quota_stats.set_alert(bytes) {
            self.stats_sink.notify_alert_reached();
        }
    }

    // ----- §4.10: timers -----

    /// Stats-poll tick. A no-op in degraded mode or with no downstreams
    /// (design §4.10); the async wrapper is expected not to even arm this
    /// timer in that case, but the check here makes the core safe to call
    /// unconditionally from tests.
    pub fn poll_stats(&mut self) {
        if self.maps.is_degraded() || self.downstreams.is_empty() {
            return;
        }
        let (per_iface, per_uid, alert) = self.quota_stats.poll(&self.maps);
        if !per_iface.is_empty() {
            self.stats_sink.notify_stats_updated(&per_iface, &per_uid);
        }
        if alert {
            self.stats_sink.notify_alert_reached();
        }
    }

    /// Conntrack timeout-refresh tick (design §4.10): re-arms the kernel's
    /// NAT GC timer for every live flow via `sink`. "Live" means the
    /// datapath has advanced `last_used` since the previous tick — the
    /// coordinator has no wall-clock visibility into how recently that
    /// happened, only whether it happened between two samples, so a flow
    /// that hasn't been touched since the last refresh (still seeded at
    /// zero, or unchanged) is left alone and allowed to expire out of the
    /// kernel's own conntrack GC.
    pub fn refresh_conntrack_timeouts(&mut self, sink: &mut dyn ConntrackTimeoutSink) {
        if self.maps.is_degraded() || self.downstreams.is_empty() {
            return;
        }
        let mut flows = Vec::new();
        self.maps.upstream4.for_each(&mut |key, value| {
            flows.push((*key, key.src_addr(), key.dst_addr(), value.last_used));
        });

        let mut seen = HashMap::with_capacity(flows.len());
        for (key, src, dst, last_used) in flows {
            let touched_since_last_tick =
                last_used != 0 && self.refresh_last_used.get(&key) != Some(&last_used);
            seen.insert(key, last_used);
            if !touched_since_last_tick {
                continue;
            }
            sink.refresh_timeout(RefreshedFlow {
                proto: key.proto,
                src,
                dst,
                src_port: key.src_port,
                dst_port: key.dst_port,
            });
        }
        self.refresh_last_used = seen;
    }

    /// Active-sessions metrics-upload tick (design §4.10, scenario S6):
    /// reports the peak observed since the previous upload, then resets
    /// the peak to the current count.
    pub fn upload_active_sessions(&mut self) {
        if self.maps.is_degraded() || self.downstreams.is_empty() {
            return;
        }
        let peak = self.sessions_peak.max(self.active_sessions());
        self.metrics_sink.report_active_sessions(peak);
        self.sessions_peak = self.active_sessions();
    }

    // ----- §6: attach_program / detach_program -----

    #[allow(clippy::too_many_arguments)]
    pub fn attach_program(
        &mut self,
        intf_in: (u32, &str, bool),
        intf_out: (u32, &str, bool),
    ) {
        let (in_index, in_name, in_virtual) = intf_in;
        let (out_index, out_name, out_virtual) = intf_out;
        let edge = self.attachments.attach(in_index, out_index, in_virtual, out_virtual);
        if edge.attach_upstream_direction_on_intf_in {
            match self.datapath.attach_upstream_direction(in_index, in_name) {
                Ok(()) => crate::datapath::log_attach_success("upstream-direction", in_name),
                Err(error) => crate::datapath::log_attach_failure("upstream-direction", in_name, &error),
            }
        }
        if edge.attach_downstream_direction_on_intf_out {
            match self.datapath.attach_downstream_direction(out_index, out_name) {
                Ok(()) => crate::datapath::log_attach_success("downstream-direction", out_name),
                Err(error) => crate::datapath::log_attach_failure("downstream-direction", out_name, &error),
            }
        }
    }

    pub fn detach_program(&mut self, intf_in: (u32, &str), intf_out: (u32, &str)) {
        let (in_index, in_name) = intf_in;
        let (out_index, out_name) = intf_out;
        let edge = self.attachments.detach(in_index, out_index);
        if edge.detach_upstream_direction_on_intf_in {
            let _ = self.datapath.detach_upstream_direction(in_index, in_name);
        }
        if edge.detach_downstream_direction_on_intf_out {
            let _ = self.datapath.detach_downstream_direction(out_index, out_name);
        }
    }
}

fn resolve_offload_ctx(
    iface_index: &IfaceIndex,
    downstream_index: u32,
    upstream: &UpstreamInfo,
) -> Option<OffloadContext> {
    let downstream_mac = iface_index.by_index(downstream_index)?.mac;
    Some(OffloadContext {
        downstream_index,
        downstream_mac,
        client_mac: MacAddr::ZERO,
        upstream_mac: upstream.iface.mac,
        upstream_neighbor_mac: upstream.gateway_mac,
        pmtu: upstream.iface.mtu.min(u16::MAX as u32) as u16,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::neighbor::{NeighborOp, NudState};
    use crate::upstream::TransportKind;

    fn downstream_params() -> InterfaceParams {
        InterfaceParams::new("rndis0".to_owned(), 2001, MacAddr::from([0xaa; 6]), 1500)
    }

    fn ready_upstream() -> UpstreamInfo {
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
            prefixes: [[0x20, 0x01, 0x0d, 0xb8, 0, 0, 0x12, 0x34]]
                .into_iter()
                .collect(),
            has_ipv4: true,
            has_ipv6: true,
            is_xlat: false,
            is_virtual: false,
        }
    }

    #[test]
    fn add_ip_server_reports_first_registration() {
        let mut coord = Coordinator::new(Config::default(), Maps::in_memory());
        assert!(coord.add_ip_server(downstream_params()));
        assert!(!coord.add_ip_server(downstream_params()));
    }

    #[test]
    fn scenario_s1_ipv6_neighbor_cycle() {
        let mut coord = Coordinator::new(Config::default(), Maps::in_memory());
        coord.add_ip_server(downstream_params());
        coord.update_upstream_network_state(Some(ready_upstream()));

        let event = NeighborEvent {
            op: NeighborOp::New,
            iface_index: 2001,
            address: "2001:db8:0:1234::1".parse::<std::net::Ipv6Addr>().unwrap().into(),
            nud_state: NudState::Reachable,
            mac: Some(MacAddr::from([0x00, 0, 0, 0, 0, 0x0a])),
        };
        coord.neighbor_event(&event);
        assert_eq!(coord.maps.upstream6.len(), 1);
        assert_eq!(coord.maps.downstream6.len(), 1);

        let del_event = NeighborEvent {
            op: NeighborOp::Del,
            ..event
        };
        coord.neighbor_event(&del_event);
        assert_eq!(coord.maps.downstream6.len(), 0);
        assert_eq!(coord.maps.upstream6.len(), 1);
    }

    #[derive(Debug, Clone, Default)]
    struct RecordingMetricsSink {
        reports: std::sync::Arc<std::sync::Mutex<Vec<usize>>>,
    }

    impl MetricsSink for RecordingMetricsSink {
        fn report_active_sessions(&mut self, max_since_last_report: usize) {
            self.reports.lock().unwrap().push(max_since_last_report);
        }
    }

    /// S6, exactly as specified: 5 NEW events on distinct 5-tuples, then 3
    /// DELETEs, *then* the first metrics upload (must report peak=5); a
    /// second upload with no intervening activity must report peak=2.
    #[test]
    fn scenario_s6_active_sessions_peak() {
        let sink = RecordingMetricsSink::default();
        let mut coord = Coordinator::with_collaborators(
            Config::default(),
            Maps::in_memory(),
            Box::new(NullDatapath),
            Box::new(NullStatsSink),
            Box::new(sink.clone()),
        );
        coord.add_ip_server(downstream_params());
        coord.update_upstream_network_state(Some(ready_upstream()));
        coord.client_add(ClientInfo {
            downstream_index: 2001,
            downstream_mac: MacAddr::from([0xaa; 6]),
            client_ipv4: Ipv4Addr::new(192, 168, 80, 12),
            client_mac: MacAddr::from([0x02, 0, 0, 0, 0, 1]),
        });

        for port in 0..5u16 {
            let event = ConntrackEvent {
                kind: crate::conntrack::ConntrackMsgKind::New,
                original: crate::conntrack::ConntrackTuple {
                    src: Ipv4Addr::new(192, 168, 80, 12),
                    dst: Ipv4Addr::new(140, 112, 8, 116),
                    proto: libc::IPPROTO_TCP as u16,
                    src_port: 50000 + port,
                    dst_port: 443,
                },
                reply: crate::conntrack::ConntrackTuple {
                    src: Ipv4Addr::new(140, 112, 8, 116),
                    dst: Ipv4Addr::new(203, 0, 113, 9),
                    proto: libc::IPPROTO_TCP as u16,
                    src_port: 443,
                    dst_port: 60000 + port,
                },
                status: crate::conntrack::ConntrackStatus::ESTABLISHED,
                timeout_secs: 300,
            };
            coord.conntrack_event(&event);
        }
        assert_eq!(coord.active_sessions(), 5);

        for port in 0..3u16 {
            let event = ConntrackEvent {
                kind: crate::conntrack::ConntrackMsgKind::Delete,
                original: crate::conntrack::ConntrackTuple {
                    src: Ipv4Addr::new(192, 168, 80, 12),
                    dst: Ipv4Addr::new(140, 112, 8, 116),
                    proto: libc::IPPROTO_TCP as u16,
                    src_port: 50000 + port,
                    dst_port: 443,
                },
                reply: crate::conntrack::ConntrackTuple {
                    src: Ipv4Addr::new(140, 112, 8, 116),
                    dst: Ipv4Addr::new(203, 0, 113, 9),
                    proto: libc::IPPROTO_TCP as u16,
                    src_port: 443,
                    dst_port: 60000 + port,
                },
                status: crate::conntrack::ConntrackStatus::ESTABLISHED,
                timeout_secs: 300,
            };
            coord.conntrack_event(&event);
        }
        assert_eq!(coord.active_sessions(), 2);

        coord.upload_active_sessions();
        assert_eq!(sink.reports.lock().unwrap().as_slice(), [5]);

        coord.upload_active_sessions();
        assert_eq!(sink.reports.lock().unwrap().as_slice(), [5, 2]);
    }

    #[test]
    fn remove_ip_server_drains_clients_and_rules() {
        let mut coord = Coordinator::new(Config::default(), Maps::in_memory());
        coord.add_ip_server(downstream_params());
        coord.client_add(ClientInfo {
            downstream_index: 2001,
            downstream_mac: MacAddr::from([0xaa; 6]),
            client_ipv4: Ipv4Addr::new(192, 168, 80, 12),
            client_mac: MacAddr::from([0x02, 0, 0, 0, 0, 1]),
        });
        assert!(coord.remove_ip_server(2001));
        assert!(!coord.downstreams.contains(2001));
    }

    #[derive(Debug, Default)]
    struct RecordingTimeoutSink {
        calls: Vec<RefreshedFlow>,
    }

    impl ConntrackTimeoutSink for RecordingTimeoutSink {
        fn refresh_timeout(&mut self, flow: RefreshedFlow) {
            self.calls.push(flow);
        }
    }

    #[test]
    fn refresh_conntrack_timeouts_skips_flows_idle_since_last_tick() {
        let mut coord = Coordinator::new(Config::default(), Maps::in_memory());
        coord.add_ip_server(downstream_params());
        coord.update_upstream_network_state(Some(ready_upstream()));
        coord.client_add(ClientInfo {
            downstream_index: 2001,
            downstream_mac: MacAddr::from([0xaa; 6]),
            client_ipv4: Ipv4Addr::new(192, 168, 80, 12),
            client_mac: MacAddr::from([0x02, 0, 0, 0, 0, 1]),
        });
        coord.conntrack_event(&crate::conntrack::ConntrackEvent {
            kind: crate::conntrack::ConntrackMsgKind::New,
            original: crate::conntrack::ConntrackTuple {
                src: Ipv4Addr::new(192, 168, 80, 12),
                dst: Ipv4Addr::new(140, 112, 8, 116),
                proto: libc::IPPROTO_TCP as u16,
                src_port: 55001,
                dst_port: 443,
            },
            reply: crate::conntrack::ConntrackTuple {
                src: Ipv4Addr::new(140, 112, 8, 116),
                dst: Ipv4Addr::new(203, 0, 113, 9),
                proto: libc::IPPROTO_TCP as u16,
                src_port: 443,
                dst_port: 62449,
            },
            status: crate::conntrack::ConntrackStatus::ESTABLISHED,
            timeout_secs: 300,
        });

        let mut flow_key = None;
        coord.maps.upstream4.for_each(&mut |key, _value| flow_key = Some(*key));
        let flow_key = flow_key.expect("one upstream4 entry after the NEW event");

        // `last_used` is still seeded at zero: the datapath hasn't touched
        // the flow yet, so the first tick must not refresh it.
        let mut sink = RecordingTimeoutSink::default();
        coord.refresh_conntrack_timeouts(&mut sink);
        assert!(sink.calls.is_empty());

        // The datapath advances `last_used`: the next tick sees the change
        // and refreshes.
        let value = coord.maps.upstream4.get(&flow_key).unwrap();
        let _ = coord.maps.upstream4.update(
            flow_key,
            crate::maps::Tether4Value { last_used: 42, ..value },
        );
        coord.refresh_conntrack_timeouts(&mut sink);
        assert_eq!(sink.calls.len(), 1);

        // No further activity: a third tick with an unchanged `last_used`
        // must not refresh it again.
        coord.refresh_conntrack_timeouts(&mut sink);
        assert_eq!(sink.calls.len(), 1);
    }
}
