use anyhow::{Context, Result, bail};
use clap::Parser;
use console::style;
use img2sd::args::LayoutArgs;
use img2sd::ui::{self, MenuChooser, ProgressObserver, TermRestorer, TypedConfirm};
use img2sd_core::Error;
use img2sd_core::confirm::{Chooser, Confirm, FirstIfUnique, Refuse};
use img2sd_core::device::Target;
use img2sd_core::envfile;
use img2sd_core::session::FlashSession;
use img2sd_core::size::format_size;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "img2sd")]
#[command(
    about = "Write per-partition images to an SD card at the offsets in a blkdevparts descriptor",
    version
)]
struct Cli {
    /// Target device (e.g. /dev/sdb) or image file. Omit, or pass `select`,
    /// to pick from the removable devices
    device: Option<String>,

    #[command(flatten)]
    layout: LayoutArgs,

    /// Never prompt; every confirmation is declined
    #[arg(long)]
    non_interactive: bool,

    /// Also write the secondary-tag descriptor lines to this file
    #[arg(long, value_name = "FILE")]
    passthrough: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let _term_restorer = TermRestorer::new();
    let running = ui::stop_flag("Stopping after the current partition...")?;

    let cli = Cli::parse();
    ui::init_logging(cli.verbose, "warn");

    let confirm: Box<dyn Confirm> = if cli.non_interactive {
        Box::new(Refuse)
    } else {
        Box::new(TypedConfirm)
    };

    let chooser: Box<dyn Chooser> = if cli.non_interactive {
        Box::new(FirstIfUnique)
    } else {
        Box::new(MenuChooser {
            prompt: "Select the SD card to flash".to_string(),
        })
    };
    let device = ui::resolve_device(
        cli.device.as_deref(),
        img2sd_core::platform::get_removable_devices,
        chooser.as_ref(),
    )?;
    let target = Target::validate(&device, cli.layout.allow_non_removable, confirm.as_ref())
        .context("Device validation failed! Exiting for safety.")?;

    let (env_guard, descriptor) = cli.layout.load()?;
    if let Some(out) = &cli.passthrough {
        envfile::write_passthrough(out, &descriptor.passthrough)?;
    }

    println!(
        "{} Flashing {} partitions from '{}' to {}",
        style("==").bold(),
        descriptor.records.len(),
        cli.layout.env_file.display(),
        style(target.path().display()).cyan()
    );
    for record in &descriptor.records {
        println!("  {record}");
    }
    println!("  Layout ends at {}", format_size(descriptor.layout_end()));

    let policy = cli.layout.policy();
    let mut observer = ProgressObserver::new();
    let result = FlashSession::new(&target, &policy)
        .image_dir(&cli.layout.image_dir)
        .confirm(confirm.as_ref())
        .cancel_on(running)
        .run(&descriptor.records, &mut observer);

    match result {
        Ok(report) => {
            drop(env_guard);
            println!(
                "\n✨ Flashed {} partitions to {}.",
                report.partitions.len(),
                style(report.device.display()).cyan()
            );
            Ok(())
        }
        Err(Error::Cancelled) => {
            observer.abandon();
            bail!("Cancelled. Partitions already written are left in place.")
        }
        Err(e) => {
            observer.abandon();
            Err(e.into())
        }
    }
}
