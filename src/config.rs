//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::time::Duration;

use serde::Deserialize;

// Operator-tunable knobs. Everything else (which interfaces to tether, which
// upstream is active, per-client quotas) is driven at runtime through the
// `Coordinator` API, not through this file.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub stats_poll: StatsPoll,
    pub conntrack_refresh_secs: u64,
    pub active_sessions_upload_secs: u64,
    pub non_offload_tcp_ports: Vec<u16>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StatsPoll {
    pub interval_secs: u64,
}

// ===== impl Config =====

impl Config {
    const DFLT_FILEPATH: &'static str = "/etc/holo-tether.toml";

    pub fn load(config_file: Option<&str>) -> Config {
        let config_file = config_file.unwrap_or(Self::DFLT_FILEPATH);

        match std::fs::read_to_string(config_file) {
            Ok(config_str) => match toml::from_str(&config_str) {
                Ok(config) => config,
                Err(error) => {
                    eprintln!(
                        "failed to parse configuration file '{config_file}': {error}"
                    );
                    eprintln!("falling back to default configuration...");
                    Config::default()
                }
            },
            Err(error) => {
                eprintln!(
                    "failed to load configuration file '{config_file}': {error}"
                );
                eprintln!("falling back to default configuration...");
                Config::default()
            }
        }
    }

    pub fn stats_poll_interval(&self) -> Duration {
        let secs = if self.stats_poll.interval_secs < StatsPoll::FLOOR_SECS {
            StatsPoll::DEFAULT_SECS
        } else {
            self.stats_poll.interval_secs
        };
        Duration::from_secs(secs)
    }

    pub fn conntrack_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.conntrack_refresh_secs)
    }

    pub fn active_sessions_upload_interval(&self) -> Duration {
        Duration::from_secs(self.active_sessions_upload_secs)
    }
}

impl Default for Config {
    fn default() -> Config {
        Config {
            stats_poll: Default::default(),
            conntrack_refresh_secs: 60,
            active_sessions_upload_secs: 60,
            // Common stateful/management ports that must never be offloaded
            // (e.g. SSH, and protocols that embed addresses in their payload
            // and would be broken by NAT rewriting happening below userspace).
            non_offload_tcp_ports: vec![22, 53],
        }
    }
}

// ===== impl StatsPoll =====

impl StatsPoll {
    /// Values below this floor are rejected and the default is substituted.
    pub const FLOOR_SECS: u64 = 5;
    pub const DEFAULT_SECS: u64 = 5;
}

impl Default for StatsPoll {
    fn default() -> StatsPoll {
        StatsPoll {
            interval_secs: Self::DEFAULT_SECS,
        }
    }
}
