use anyhow::{Result, bail};
use clap::Parser;
use console::style;
use img2sd::args::LayoutArgs;
use img2sd::ui::{self, TermRestorer};
use img2sd_core::monitor::{Monitor, MonitorConfig, RemovableDevices, SessionFlasher};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "multiflash")]
#[command(
    about = "Flash every SD card that gets inserted, once per insertion, until Ctrl+C",
    version
)]
struct Cli {
    #[command(flatten)]
    layout: LayoutArgs,

    /// Seconds between device scans
    #[arg(short, long, default_value_t = 2)]
    interval: u64,

    /// Number of cards flashed at the same time
    #[arg(short = 'j', long, default_value_t = 1)]
    workers: usize,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let _term_restorer = TermRestorer::new();
    let cli = Cli::parse();
    ui::init_logging(cli.verbose, "info");

    if !nix::unistd::geteuid().is_root() {
        bail!("multiflash must be run as root (sudo).");
    }
    if cli.workers == 0 {
        bail!("--workers must be at least 1.");
    }

    let running = ui::stop_flag("Stopping monitor, waiting for active cards...")?;
    let (env_guard, descriptor) = cli.layout.load()?;
    cli.layout.check_images(&descriptor)?;

    let flasher = Arc::new(SessionFlasher {
        records: descriptor.records,
        image_dir: cli.layout.image_dir.clone(),
        policy: cli.layout.policy(),
    });
    let config = MonitorConfig {
        poll_interval: Duration::from_secs(cli.interval),
        workers: cli.workers,
        ..MonitorConfig::default()
    };

    let monitor = Monitor::new(config, running);
    monitor.start(flasher)?;
    println!(
        "{} Insert SD cards to begin flashing. Press Ctrl+C to stop.",
        style("Monitoring removable devices.").bold()
    );
    monitor.run(&RemovableDevices);
    monitor.stop();
    drop(env_guard);

    let status = monitor.status();
    println!("\n{} {status}", style("Final status:").bold());
    if !status.failed.is_empty() {
        bail!("{} card(s) failed to flash.", status.failed.len());
    }
    Ok(())
}
