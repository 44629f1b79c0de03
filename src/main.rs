//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

#![warn(rust_2018_idioms)]

use capctl::caps;
use clap::{App, Arg};
use holo_tether::config::Config;
use holo_tether::instance::Instance;
use nix::unistd::Uid;
use tracing::{error, info};
use tracing_subscriber::prelude::*;

/// Where the datapath program pins the eight maps it owns, and the two TC
/// classifier programs this process attaches by name.
const PIN_BASE: &str = "/sys/fs/bpf/tether";

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive("holo_tether=info".parse().unwrap())
        .from_env_lossy();
    let stdout = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout)
        .init();
}

/// Narrows the permitted capability set down to what the coordinator
/// actually needs (`NET_ADMIN` for the kernel maps and datapath
/// attachments, `NET_RAW` for the raw conntrack socket) and drops
/// everything else. There is no dedicated service user to switch to here:
/// the pinned BPF maps under [`PIN_BASE`] are themselves only writable by
/// root, so unlike `holo-daemon` this process has nothing to gain from a
/// uid change and stays root with a trimmed capability set instead.
fn privdrop() -> nix::Result<()> {
    let mut bounding = caps::CapState::get_current()?;
    bounding.permitted = caps::CapSet::empty();
    bounding.effective = caps::CapSet::empty();
    for cap in [caps::Cap::NET_ADMIN, caps::Cap::NET_RAW] {
        bounding.permitted.add(cap);
        bounding.effective.add(cap);
    }
    bounding.set_current()?;
    Ok(())
}

fn main() {
    let matches = App::new("Tethering offload coordinator")
        .version(clap::crate_version!())
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("file")
                .help("Specify an alternative configuration file."),
        )
        .get_matches();

    let config_file = matches.value_of("config");
    let config = Config::load(config_file);

    if !Uid::effective().is_root() {
        eprintln!("need privileged user");
        std::process::exit(1);
    }

    init_tracing();

    if let Err(error) = privdrop() {
        error!(%error, "failed to drop capabilities");
        std::process::exit(1);
    }

    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_panic(info);
        std::process::exit(1);
    }));

    info!("starting up");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to create async runtime")
        .block_on(async {
            let instance = Instance::new(config, PIN_BASE).await;
            instance.run().await;
        });
}
