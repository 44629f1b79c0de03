//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! Quota & stats engine. Seeds and removes per-interface
//! quotas, polls the stats map on a timer, diffs against the last snapshot,
//! and attributes the delta to both a per-interface view and a per-uid
//! view before handing it to the stats sink.

use std::collections::HashMap;

use crate::maps::{LimitKey, LimitValue, Maps, StatsKey, StatsValue};

/// Synthetic UID buckets used for per-uid attribution. Rather than tracking
/// the real per-socket uid (which the offload path never sees once a flow
/// is handed to the kernel map), every accounted byte is credited to a
/// single synthetic tethering identity; see `DESIGN.md` for the tradeoff.
pub const UID_ALL: i32 = -1;
pub const UID_TETHERING: i32 = 9999;

/// One per-interface/per-uid byte and packet delta, ready for the stats
/// sink.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct UsageDelta {
    pub ifindex: u32,
    pub uid: i32,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub tx_packets: u64,
}

impl UsageDelta {
    fn from_stats(ifindex: u32, uid: i32, delta: &StatsValue) -> Self {
        UsageDelta {
            ifindex,
            uid,
            rx_bytes: delta.rx_bytes,
            tx_bytes: delta.tx_bytes,
            rx_packets: delta.rx_packets,
            tx_packets: delta.tx_packets,
        }
    }
}

/// Outbound notification sink. Implementations
/// forward to whatever the host process reports usage/quota breaches
/// through; tests inject a recording stand-in.
pub trait StatsSink: std::fmt::Debug + Send {
    fn notify_stats_updated(&mut self, per_iface: &[UsageDelta], per_uid: &[UsageDelta]);
    fn notify_alert_reached(&mut self);
}

/// A [`StatsSink`] that discards every notification; the default when no
/// sink is supplied.
#[derive(Debug, Default)]
pub struct NullStatsSink;

impl StatsSink for NullStatsSink {
    fn notify_stats_updated(&mut self, _per_iface: &[UsageDelta], _per_uid: &[UsageDelta]) {}
    fn notify_alert_reached(&mut self) {}
}

#[derive(Debug, Default)]
struct IfaceAccounting {
    /// Cumulative bytes observed across the lifetime of this interface
    /// (including stats-map generations that were read-and-cleared by
    /// conntrack teardown), used for the alert threshold.
    cumulative_bytes: u64,
    last_snapshot: StatsValue,
    pending_limit: Option<u64>,
}

#[derive(Debug)]
pub struct QuotaStats {
    by_iface: HashMap<u32, IfaceAccounting>,
    alert_threshold: Option<u64>,
    alert_fired: bool,
}

// ===== impl QuotaStats =====

impl QuotaStats {
    pub fn new() -> Self {
        QuotaStats {
            by_iface: HashMap::new(),
            alert_threshold: None,
            alert_fired: false,
        }
    }

    /// Sets the byte quota for `ifindex`. If it has no rules yet (no entry in
    /// the limit map), the value is only remembered; the coordinator applies
    /// it once the first rule lands via [`Self::apply_pending_limit`].
    /// Returns `false` if `bytes` is negative (the caller should reject the
    /// request before calling this).
    pub fn set_limit(&mut self, ifindex: u32, bytes: u64, maps: &mut Maps) {
        let key = LimitKey { ifindex };
        if maps.limit.get(&key).is_some() {
            let _ = maps.limit.update(key, LimitValue { quota_bytes: bytes });
        } else {
            self.by_iface.entry(ifindex).or_default().pending_limit = Some(bytes);
        }
    }

    /// Applies a previously remembered quota the moment the first rule for
    /// `ifindex` is about to be seeded, overriding the "unlimited" default
    /// [`Maps::seed_upstream_accounting`] just wrote.
    pub fn apply_pending_limit(&mut self, ifindex: u32, maps: &mut Maps) {
        if let Some(bytes) = self
            .by_iface
            .get(&ifindex)
            .and_then(|acct| acct.pending_limit)
        {
            let _ = maps.limit.update(LimitKey { ifindex }, LimitValue { quota_bytes: bytes });
        }
    }

    /// Sets the cumulative-byte alert threshold. If the cumulative total on
    /// any tracked upstream already meets `bytes`, fires immediately;
    /// returns whether an immediate fire is due.
    pub fn set_alert(&mut self, bytes: u64) -> bool {
        self.alert_threshold = Some(bytes);
        self.alert_fired = false;
        let already_reached = self
            .by_iface
            .values()
            .any(|acct| acct.cumulative_bytes >= bytes);
        if already_reached {
            self.alert_fired = true;
        }
        already_reached
    }

    /// Reads every stats-map entry, diffs against the last snapshot, and
    /// returns the per-iface/per-uid deltas plus whether the alert
    /// threshold was just crossed.
    pub fn poll(&mut self, maps: &Maps) -> (Vec<UsageDelta>, Vec<UsageDelta>, bool) {
        let mut per_iface = Vec::new();
        let mut per_uid = Vec::new();
        let mut snapshot = Vec::new();
        maps.stats.for_each(&mut |key: &StatsKey, value: &StatsValue| {
            snapshot.push((key.ifindex, *value));
        });

        let mut alert_crossed = false;
        for (ifindex, current) in snapshot {
            let acct = self.by_iface.entry(ifindex).or_default();
            let delta = current.delta_since(&acct.last_snapshot);
            acct.last_snapshot = current;
            acct.cumulative_bytes = acct.cumulative_bytes.saturating_add(delta.total_bytes());

            if delta.rx_bytes == 0
                && delta.tx_bytes == 0
                && delta.rx_packets == 0
                && delta.tx_packets == 0
            {
                continue;
            }

            per_iface.push(UsageDelta::from_stats(ifindex, UID_ALL, &delta));
            per_uid.push(UsageDelta::from_stats(ifindex, UID_TETHERING, &delta));

            if let Some(threshold) = self.alert_threshold {
                if !self.alert_fired && acct.cumulative_bytes >= threshold {
                    self.alert_fired = true;
                    alert_crossed = true;
                }
            }
        }

        (per_iface, per_uid, alert_crossed)
    }

    /// Folds a final read-and-cleared stats snapshot into the persistent
    /// per-interface counter when the last rule on an upstream is
    /// withdrawn, and drops the per-interface quota bookkeeping.
    pub fn account_and_forget(&mut self, ifindex: u32, final_snapshot: StatsValue) {
        if let Some(acct) = self.by_iface.get_mut(&ifindex) {
            let delta = final_snapshot.delta_since(&acct.last_snapshot);
            acct.cumulative_bytes = acct.cumulative_bytes.saturating_add(delta.total_bytes());
        }
        self.by_iface.remove(&ifindex);
    }
}

impl Default for QuotaStats {
    fn default() -> Self {
        QuotaStats::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::maps::Maps;

    #[test]
    fn pending_limit_applies_once_accounting_is_seeded() {
        let mut stats = QuotaStats::new();
        let mut maps = Maps::in_memory();
        stats.set_limit(1001, 1_048_576_000, &mut maps);
        assert!(maps.limit.get(&LimitKey { ifindex: 1001 }).is_none());

        maps.seed_upstream_accounting(1001);
        stats.apply_pending_limit(1001, &mut maps);
        assert_eq!(
            maps.limit.get(&LimitKey { ifindex: 1001 }).unwrap().quota_bytes,
            1_048_576_000
        );
    }

    #[test]
    fn limit_applies_immediately_when_already_seeded() {
        let mut stats = QuotaStats::new();
        let mut maps = Maps::in_memory();
        maps.seed_upstream_accounting(1001);
        stats.set_limit(1001, 500, &mut maps);
        assert_eq!(maps.limit.get(&LimitKey { ifindex: 1001 }).unwrap().quota_bytes, 500);
    }

    #[test]
    fn poll_reports_delta_and_fires_alert_once() {
        let mut stats = QuotaStats::new();
        let mut maps = Maps::in_memory();
        maps.seed_upstream_accounting(1001);
        stats.set_alert(1_000);

        let _ = maps.stats.update(
            StatsKey { ifindex: 1001 },
            StatsValue {
                rx_bytes: 600,
                tx_bytes: 600,
                ..Default::default()
            },
        );
        let (per_iface, per_uid, alert) = stats.poll(&maps);
        assert_eq!(per_iface.len(), 1);
        assert_eq!(per_uid[0].uid, UID_TETHERING);
        assert!(alert);

        // A second poll with no new traffic must not refire the alert.
        let (_, _, alert_again) = stats.poll(&maps);
        assert!(!alert_again);
    }

    #[test]
    fn set_alert_fires_immediately_when_already_past_threshold() {
        let mut stats = QuotaStats::new();
        let mut maps = Maps::in_memory();
        maps.seed_upstream_accounting(1001);
        let _ = maps.stats.update(
            StatsKey { ifindex: 1001 },
            StatsValue {
                rx_bytes: 2_000,
                ..Default::default()
            },
        );
        stats.poll(&maps);

        assert!(stats.set_alert(1_500));
    }
}
