// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! ecfan-ctl: command-line editor that attaches to the daemon's shared
//! memory segment to show live state, submit curve changes, and reset a
//! curve to its defaults.

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use ec_fan_control::config::{self, Config};
use ec_fan_control::curve::{CurveEngine, CurveParameters};
use ec_fan_control::domain::Domain;
use ec_fan_control::shm::{self, SharedRegion, SharedSnapshot, Telemetry};
use serde::Serialize;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

const ACK_POLL: Duration = Duration::from_millis(50);

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "ecfan-ctl", about = "Inspect and edit ecfan-daemon fan curves")]
struct Cli {
    /// Shared memory segment name.
    #[arg(long, global = true, default_value = shm::DEFAULT_SHM_NAME)]
    shm_name: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print temperatures, duties and curve parameters.
    Status {
        /// Emit JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Print live temperatures and duties periodically.
    Watch {
        #[arg(long, default_value_t = 1000)]
        interval_ms: u64,

        /// Stop after this many samples.
        #[arg(long)]
        count: Option<u64>,
    },

    /// Change one domain's curve and hand it to the daemon.
    Set {
        /// cpu or gpu
        domain: Domain,

        /// Hysteresis band in degrees C.
        #[arg(long)]
        hysteresis: Option<i32>,

        /// Interior breakpoint temperatures, e.g. 55,70,80.
        #[arg(long, value_delimiter = ',')]
        breakpoints: Option<Vec<i32>>,

        /// All five duty points, e.g. 0,5,8,30,100.
        #[arg(long, value_delimiter = ',')]
        duties: Option<Vec<i32>>,

        /// Return as soon as the request is posted.
        #[arg(long)]
        no_wait: bool,

        /// How long to wait for the daemon to pick up the change.
        #[arg(long, default_value_t = 5000)]
        timeout_ms: u64,
    },

    /// Return one domain's curve to the built-in defaults.
    Reset {
        /// cpu or gpu
        domain: Domain,

        /// Return as soon as the request is posted.
        #[arg(long)]
        no_wait: bool,

        #[arg(long, default_value_t = 5000)]
        timeout_ms: u64,
    },

    /// Print or write a default daemon configuration file.
    DefaultConfig {
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

// ---------------------------------------------------------------------------
// Status report
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct DomainStatus {
    domain: Domain,
    #[serde(flatten)]
    telemetry: Telemetry,
    parameters: CurveParameters,
}

#[derive(Debug, Serialize)]
struct StatusReport {
    segment: PathBuf,
    domains: Vec<DomainStatus>,
    sync_pending: bool,
}

impl StatusReport {
    fn capture(region: &SharedRegion) -> Self {
        Self {
            segment: region.path().to_path_buf(),
            domains: Domain::ALL
                .iter()
                .map(|&domain| DomainStatus {
                    domain,
                    telemetry: region.telemetry(domain),
                    parameters: region.load_parameters(domain),
                })
                .collect(),
            sync_pending: region.sync_requested(),
        }
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Command::Status { json } => {
            let region = attach(&cli.shm_name)?;
            let report = StatusReport::capture(&region);
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }
        }

        Command::Watch { interval_ms, count } => {
            let region = attach(&cli.shm_name)?;
            let mut samples = 0u64;
            loop {
                let cpu = region.telemetry(Domain::Cpu);
                let gpu = region.telemetry(Domain::Gpu);
                println!(
                    "CPU {:5.1} C {:3}%   GPU {:5.1} C {:3}%",
                    cpu.temperature, cpu.duty, gpu.temperature, gpu.duty
                );
                samples += 1;
                if count.is_some_and(|n| samples >= n) {
                    break;
                }
                thread::sleep(Duration::from_millis(interval_ms));
            }
        }

        Command::Set {
            domain,
            hysteresis,
            breakpoints,
            duties,
            no_wait,
            timeout_ms,
        } => {
            let region = attach(&cli.shm_name)?;
            let mut params = region.load_parameters(domain);

            if let Some(h) = hysteresis {
                params.hysteresis = h;
            }
            if let Some(b) = breakpoints {
                params.breakpoints = b
                    .as_slice()
                    .try_into()
                    .context("--breakpoints takes exactly 3 temperatures")?;
            }
            if let Some(d) = duties {
                params.duties = d
                    .as_slice()
                    .try_into()
                    .context("--duties takes exactly 5 values")?;
            }

            submit(&region, domain, &params, no_wait, Duration::from_millis(timeout_ms))?;
        }

        Command::Reset {
            domain,
            no_wait,
            timeout_ms,
        } => {
            let region = attach(&cli.shm_name)?;
            let params = CurveParameters::defaults(domain);
            submit(&region, domain, &params, no_wait, Duration::from_millis(timeout_ms))?;
        }

        Command::DefaultConfig { output } => {
            let cfg = Config::default();
            match output {
                Some(path) => {
                    config::save_config(&path, &cfg)?;
                    println!("Wrote {}", path.display());
                }
                None => print!("{}", toml::to_string_pretty(&cfg)?),
            }
        }
    }

    Ok(())
}

fn attach(name: &str) -> anyhow::Result<SharedRegion> {
    let path = shm::shm_path(name);
    SharedRegion::open(&path).with_context(|| {
        format!("Could not attach to {} (is ecfan-daemon running?)", path.display())
    })
}

/// Validate `params` locally, hand them to the daemon and, unless
/// `no_wait`, confirm they were applied rather than reverted.
fn submit(
    shared: &SharedSnapshot,
    domain: Domain,
    params: &CurveParameters,
    no_wait: bool,
    timeout: Duration,
) -> anyhow::Result<()> {
    // Same validation the daemon applies on import
    CurveEngine::from_parameters(domain, params)?;

    if !shared.submit_parameters(domain, params) {
        bail!("A previous update is still pending; try again shortly");
    }
    if no_wait {
        println!("Submitted {domain} curve");
        return Ok(());
    }

    wait_for_ack(shared, timeout)?;
    if shared.load_parameters(domain) != *params {
        bail!("Daemon rejected the {domain} curve; previous parameters remain in force");
    }
    println!("Applied {domain} curve");
    Ok(())
}

/// Wait until the daemon lowers the sync flag.
fn wait_for_ack(shared: &SharedSnapshot, timeout: Duration) -> anyhow::Result<()> {
    let deadline = Instant::now() + timeout;
    while shared.sync_requested() {
        if Instant::now() >= deadline {
            bail!("Daemon did not pick up the change within {timeout:?}");
        }
        thread::sleep(ACK_POLL);
    }
    Ok(())
}

fn print_report(report: &StatusReport) {
    println!("Segment {}", report.segment.display());
    for d in &report.domains {
        let p = &d.parameters;
        println!("{}", d.domain.name().to_uppercase());
        println!("  temperature  {:.1} C", d.telemetry.temperature);
        println!("  duty         {}%", d.telemetry.duty);
        println!("  hysteresis   {} C", p.hysteresis);
        println!(
            "  curve        0:{}  {}:{}  {}:{}  {}:{}  100:{}",
            p.duties[0],
            p.breakpoints[0],
            p.duties[1],
            p.breakpoints[1],
            p.duties[2],
            p.breakpoints[2],
            p.duties[3],
            p.duties[4]
        );
    }
    if report.sync_pending {
        println!("(update pending)");
    }
}
