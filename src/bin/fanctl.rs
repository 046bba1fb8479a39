// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! clevo-fanctl: fan control for Clevo laptops.
//!
//! Without arguments it forks into a root control worker and an
//! unprivileged status panel. A duty percentage performs a one-shot write
//! to both fans; `--dump` only reads. The EC ports need root, so install
//! the binary setuid-root to use the panel as a desktop user:
//!
//! ```text
//! sudo chown root clevo-fanctl
//! sudo chmod u+s clevo-fanctl
//! ```

use std::io::{self, IsTerminal};

use anyhow::{Context, bail};
use clap::Parser;

use clevo_fan_utility::config;
use clevo_fan_utility::ec::{EcPorts, Zone};
use clevo_fan_utility::shared::SharedMem;
use clevo_fan_utility::supervisor::{self, PROG_NAME};

#[derive(Parser, Debug)]
#[command(name = PROG_NAME, version, about = "EC fan control for Clevo laptops")]
struct Cli {
    /// One-shot fan duty in percent (40-100), applied to both fans
    duty: Option<i32>,

    /// Print fan state and exit without starting the control loop
    #[arg(short, long)]
    dump: bool,

    /// Path to the fan-table configuration file
    #[arg(short, long, default_value = config::DEFAULT_CONFIG_PATH)]
    config: String,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    if let Some(duty) = cli.duty {
        if !(40..=100).contains(&duty) {
            bail!("invalid fan duty {duty}%: expected 40-100");
        }
    }

    // A second instance would race the EC handshake.
    let others = supervisor::count_other_instances(PROG_NAME)
        .context("unable to scan /proc for other instances")?;
    if others > 0 {
        bail!("{others} other running instance(s) of {PROG_NAME}");
    }

    let ports = EcPorts::acquire().context("EC ports unavailable (is the binary setuid-root?)")?;

    if let Some(duty) = cli.duty {
        return set_fan_once(&ports, duty);
    }
    if cli.dump {
        return dump_fan(&ports);
    }
    if !io::stdout().is_terminal() {
        log::info!("stdout is not a terminal, dumping fan state instead of starting the panel");
        return dump_fan(&ports);
    }

    let tables = config::load_tables(&config::resolve_config_path(Some(&cli.config)));
    match SharedMem::create() {
        Ok(shm) => supervisor::run_dual_process(&shm, ports, tables),
        Err(e) => {
            // No shared block, no dual-process mode; degrade to a one-shot
            // dump so the invocation still reports something.
            log::warn!("shared state unavailable ({e}), falling back to a dump");
            dump_fan(&ports)
        }
    }
}

/// Write one duty to both fans, then show what the EC settled on.
fn set_fan_once(ports: &EcPorts, duty: i32) -> anyhow::Result<()> {
    println!("Setting fan duty to {duty}%");
    for zone in Zone::ALL {
        ports.write_fan_duty(zone, duty)?;
    }
    dump_fan(ports)
}

/// Print both zones' live state through the port protocol.
fn dump_fan(ports: &EcPorts) -> anyhow::Result<()> {
    for zone in Zone::ALL {
        let status = ports.read_zone(zone)?;
        println!(
            "  {}: {}°C, fan duty {}%, fan speed {} RPM",
            zone.label(),
            status.temp,
            status.duty,
            status.rpm
        );
    }
    Ok(())
}
