// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! ecfan-daemon: owns the embedded controller, runs the fan curves, and
//! publishes live state to editors through shared memory.

use anyhow::{Context, bail};
use clap::Parser;
use ec_fan_control::config::{self, Config};
use ec_fan_control::control::{ControlLoop, LoopOptions};
use ec_fan_control::ec::{DevPort, EcChannel};
use ec_fan_control::platform;
use ec_fan_control::settings::SettingsStore;
use ec_fan_control::shm::{self, SharedRegion};
use nix::unistd::Uid;
use signal_hook::consts::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "ecfan-daemon", about = "Embedded controller fan curve daemon")]
struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, default_value = config::DEFAULT_CONFIG_PATH)]
    config: String,

    /// Override the settings file path.
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Override the shared memory segment name.
    #[arg(long)]
    shm_name: Option<String>,

    /// Run even if the host model is not on the allow-list.
    #[arg(long)]
    skip_model_check: bool,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config_path = config::resolve_config_path(Some(&cli.config));
    let mut cfg = config::load_config(&config_path).unwrap_or_else(|e| {
        log::warn!("Could not load config: {e}, using defaults");
        Config::default()
    });

    if let Some(path) = cli.settings {
        cfg.daemon.settings_path = path;
    }
    if let Some(name) = cli.shm_name {
        cfg.daemon.shm_name = name;
    }
    if cli.skip_model_check {
        cfg.platform.check_model = false;
    }
    cfg.validate()?;

    if !Uid::effective().is_root() {
        bail!("EC port access requires root privileges");
    }

    // Pre-flight: never touch the EC of an unknown model
    let host = platform::read_host_identity();
    platform::check_supported(&cfg.platform, &host)?;

    let ports = DevPort::open().context("Failed to open /dev/port")?;
    let ec = EcChannel::new(ports);

    let shutdown = Arc::new(AtomicBool::new(false));
    for signal in [SIGINT, SIGTERM, SIGHUP, SIGQUIT] {
        signal_hook::flag::register(signal, Arc::clone(&shutdown))
            .with_context(|| format!("Failed to register handler for signal {signal}"))?;
    }

    let region = SharedRegion::create(&shm::shm_path(&cfg.daemon.shm_name))?;

    let mut store = SettingsStore::new(cfg.daemon.settings_path.clone());
    store.load_or_seed(&region);

    let mut control = ControlLoop::new(
        ec,
        &region,
        store,
        shutdown,
        LoopOptions::from(&cfg.daemon),
    )?;

    let result = control.run();
    drop(control);
    drop(region);

    match result {
        Ok(()) => {
            log::info!("Daemon stopped");
            Ok(())
        }
        Err(e) => {
            if e.is_fatal() {
                log::error!("Fan state may be stale; check EC health before restarting");
            }
            Err(e.into())
        }
    }
}
