//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! Owns a [`Coordinator`] together with the transports and timers that
//! drive it, and runs the event loop that serializes every caller onto the
//! coordinator's executor: requests arriving through [`Handle`],
//! neighbor/conntrack events off the two netlink monitors, and the three
//! timer ticks all funnel through one `tokio::select!` so no two
//! coordinator methods ever run concurrently.

use std::collections::HashSet;
use std::path::Path;

use futures::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::config::Config;
use crate::coordinator::{Coordinator, NullConntrackTimeoutSink};
use crate::datapath::Datapath;
use crate::error::Error;
use crate::iface_index::InterfaceParams;
use crate::maps::Maps;
use crate::netfilter::{self, ConntrackMonitor, NetfilterTimeoutSink};
use crate::netlink::{self, NeighborMonitor};
use crate::stats::{NullStatsSink, StatsSink};
use crate::task::IntervalTask;
use crate::upstream::UpstreamInfo;

/// Requests a caller outside the event loop can make against the running
/// coordinator.
#[derive(Debug)]
pub enum Command {
    AddIpServer(InterfaceParams),
    RemoveIpServer(u32),
    UpdateIpv6Upstream {
        downstream: u32,
        upstream_index: u32,
        prefixes: HashSet<[u8; 8]>,
    },
    UpdateUpstreamNetworkState(Option<UpstreamInfo>),
    SetDataLimit {
        iface_name: String,
        bytes: i64,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    SetAlert(u64),
    AttachProgram {
        intf_in: (u32, String, bool),
        intf_out: (u32, String, bool),
    },
    DetachProgram {
        intf_in: (u32, String),
        intf_out: (u32, String),
    },
    StatsTick,
    ConntrackRefreshTick,
    ActiveSessionsTick,
}

/// A cheap, cloneable sender for [`Command`]s, handed out to callers that
/// live outside the instance's event loop.
#[derive(Clone, Debug)]
pub struct Handle {
    tx: mpsc::UnboundedSender<Command>,
}

impl Handle {
    pub fn add_ip_server(&self, params: InterfaceParams) {
        let _ = self.tx.send(Command::AddIpServer(params));
    }

    pub fn remove_ip_server(&self, ifindex: u32) {
        let _ = self.tx.send(Command::RemoveIpServer(ifindex));
    }

    pub fn update_ipv6_upstream(
        &self,
        downstream: u32,
        upstream_index: u32,
        prefixes: HashSet<[u8; 8]>,
    ) {
        let _ = self.tx.send(Command::UpdateIpv6Upstream {
            downstream,
            upstream_index,
            prefixes,
        });
    }

    pub fn update_upstream_network_state(&self, state: Option<UpstreamInfo>) {
        let _ = self.tx.send(Command::UpdateUpstreamNetworkState(state));
    }

    pub async fn set_data_limit(&self, iface_name: String, bytes: i64) -> Result<(), Error> {
        let (reply, reply_rx) = oneshot::channel();
        let _ = self.tx.send(Command::SetDataLimit {
            iface_name,
            bytes,
            reply,
        });
        reply_rx
            .await
            .unwrap_or_else(|_| Err(Error::InvariantViolation("instance shut down".to_owned())))
    }

    pub fn set_alert(&self, bytes: u64) {
        let _ = self.tx.send(Command::SetAlert(bytes));
    }

    pub fn attach_program(&self, intf_in: (u32, String, bool), intf_out: (u32, String, bool)) {
        let _ = self.tx.send(Command::AttachProgram { intf_in, intf_out });
    }

    pub fn detach_program(&self, intf_in: (u32, String), intf_out: (u32, String)) {
        let _ = self.tx.send(Command::DetachProgram { intf_in, intf_out });
    }
}

pub struct Instance {
    coordinator: Coordinator,
    config: Config,
    commands_tx: mpsc::UnboundedSender<Command>,
    commands_rx: mpsc::UnboundedReceiver<Command>,
    neighbor_handle: rtnetlink::Handle,
    neighbor_monitor: NeighborMonitor,
    conntrack_monitor: Option<ConntrackMonitor>,
    conntrack_sink: Box<dyn crate::coordinator::ConntrackTimeoutSink>,
    stats_timer: Option<IntervalTask>,
    conntrack_refresh_timer: Option<IntervalTask>,
    active_sessions_timer: Option<IntervalTask>,
}

// ===== impl Instance =====

impl Instance {
    /// Builds an instance against the real kernel maps and datapath program,
    /// both pinned under `pin_base`.
    pub async fn new(config: Config, pin_base: impl AsRef<Path>) -> Self {
        let maps = crate::maps::kernel::open(&pin_base);
        let datapath: Box<dyn Datapath> =
            Box::new(crate::datapath::kernel::BpfDatapath::new(&pin_base));
        Self::with_collaborators(config, maps, datapath, Box::new(NullStatsSink)).await
    }

    pub async fn with_collaborators(
        config: Config,
        maps: Maps,
        datapath: Box<dyn Datapath>,
        stats_sink: Box<dyn StatsSink>,
    ) -> Self {
        let coordinator = Coordinator::with_collaborators(
            config.clone(),
            maps,
            datapath,
            stats_sink,
            Box::new(crate::coordinator::NullMetricsSink),
        );
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (neighbor_handle, neighbor_monitor) = netlink::init().await;

        let conntrack_sink: Box<dyn crate::coordinator::ConntrackTimeoutSink> =
            match NetfilterTimeoutSink::connect() {
                Ok(sink) => Box::new(sink),
                Err(error) => {
                    netfilter::log_bind_failure(&error);
                    Box::new(NullConntrackTimeoutSink)
                }
            };

        Instance {
            coordinator,
            config,
            commands_tx,
            commands_rx,
            neighbor_handle,
            neighbor_monitor,
            conntrack_monitor: None,
            conntrack_sink,
            stats_timer: None,
            conntrack_refresh_timer: None,
            active_sessions_timer: None,
        }
    }

    pub fn handle(&self) -> Handle {
        Handle {
            tx: self.commands_tx.clone(),
        }
    }

    /// Starts the conntrack monitor and the three timers; called once the
    /// first downstream is registered.
    fn arm(&mut self) {
        if self.stats_timer.is_some() {
            return;
        }

        match ConntrackMonitor::bind() {
            Ok(monitor) => self.conntrack_monitor = Some(monitor),
            Err(error) => netfilter::log_bind_failure(&error),
        }

        let tx = self.commands_tx.clone();
        self.stats_timer = Some(IntervalTask::new(
            self.config.stats_poll_interval(),
            false,
            move || {
                let _ = tx.send(Command::StatsTick);
                async {}
            },
        ));

        let tx = self.commands_tx.clone();
        self.conntrack_refresh_timer = Some(IntervalTask::new(
            self.config.conntrack_refresh_interval(),
            false,
            move || {
                let _ = tx.send(Command::ConntrackRefreshTick);
                async {}
            },
        ));

        let tx = self.commands_tx.clone();
        self.active_sessions_timer = Some(IntervalTask::new(
            self.config.active_sessions_upload_interval(),
            false,
            move || {
                let _ = tx.send(Command::ActiveSessionsTick);
                async {}
            },
        ));
    }

    /// Tears down the conntrack monitor and the three timers; called once
    /// the last downstream is removed.
    fn disarm(&mut self) {
        self.conntrack_monitor = None;
        self.stats_timer = None;
        self.conntrack_refresh_timer = None;
        self.active_sessions_timer = None;
    }

    async fn process_command(&mut self, command: Command) {
        match command {
            Command::AddIpServer(params) => {
                if self.coordinator.add_ip_server(params) {
                    self.arm();
                }
            }
            Command::RemoveIpServer(ifindex) => {
                if self.coordinator.remove_ip_server(ifindex) {
                    self.disarm();
                }
            }
            Command::UpdateIpv6Upstream {
                downstream,
                upstream_index,
                prefixes,
            } => {
                self.coordinator
                    .update_ipv6_upstream(downstream, upstream_index, &prefixes);
            }
            Command::UpdateUpstreamNetworkState(state) => {
                self.coordinator.update_upstream_network_state(state);
            }
            Command::SetDataLimit {
                iface_name,
                bytes,
                reply,
            } => {
                let result = self.coordinator.set_data_limit(&iface_name, bytes);
                let _ = reply.send(result);
            }
            Command::SetAlert(bytes) => {
                self.coordinator.set_alert(bytes);
            }
            Command::AttachProgram { intf_in, intf_out } => {
                self.coordinator.attach_program(
                    (intf_in.0, intf_in.1.as_str(), intf_in.2),
                    (intf_out.0, intf_out.1.as_str(), intf_out.2),
                );
            }
            Command::DetachProgram { intf_in, intf_out } => {
                self.coordinator.detach_program(
                    (intf_in.0, intf_in.1.as_str()),
                    (intf_out.0, intf_out.1.as_str()),
                );
            }
            Command::StatsTick => self.coordinator.poll_stats(),
            Command::ConntrackRefreshTick => self
                .coordinator
                .refresh_conntrack_timeouts(self.conntrack_sink.as_mut()),
            Command::ActiveSessionsTick => self.coordinator.upload_active_sessions(),
        }
    }

    /// Runs the event loop until the command channel is dropped, which only
    /// happens when every [`Handle`] has been dropped.
    pub async fn run(mut self) {
        for event in netlink::dump(&self.neighbor_handle).await {
            self.coordinator.neighbor_event(&event);
        }

        loop {
            tokio::select! {
                command = self.commands_rx.recv() => {
                    match command {
                        Some(command) => self.process_command(command).await,
                        None => break,
                    }
                }
                Some((msg, _addr)) = self.neighbor_monitor.next() => {
                    if let Some(event) = netlink::decode(msg) {
                        self.coordinator.neighbor_event(&event);
                    }
                }
                event = recv_conntrack(&mut self.conntrack_monitor), if self.conntrack_monitor.is_some() => {
                    match event {
                        Some(Ok(event)) => self.coordinator.conntrack_event(&event),
                        Some(Err(error)) => warn!(%error, "conntrack monitor read failed"),
                        None => {}
                    }
                }
            }
        }
    }
}

async fn recv_conntrack(
    monitor: &mut Option<ConntrackMonitor>,
) -> Option<std::io::Result<crate::conntrack::ConntrackEvent>> {
    match monitor {
        Some(monitor) => Some(monitor.recv().await),
        None => None,
    }
}
