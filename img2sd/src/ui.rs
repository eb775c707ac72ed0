use anyhow::bail;
use console::style;
use dialoguer::{Input, Select, theme::ColorfulTheme};
use img2sd_core::confirm::{Chooser, Confirm};
use img2sd_core::device::Device;
use img2sd_core::session::{FlashTask, Observer, PartitionReport, VerifyStatus};
use img2sd_core::size::format_size;
use img2sd_core::verify::Strategy;
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{self, IsTerminal, stdout};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[cfg(unix)]
use libc::ECHOCTL;
#[cfg(unix)]
use std::os::unix::io::AsRawFd;
#[cfg(unix)]
use termios::{TCSANOW, Termios, tcsetattr};

/// Turns off `ECHOCTL` so Ctrl+C does not leave a stray `^C` in front of the
/// stop message. The saved terminal state is put back on drop.
pub struct TermRestorer {
    #[cfg(unix)]
    saved: Option<Termios>,
}

impl TermRestorer {
    pub fn new() -> Self {
        #[cfg(unix)]
        {
            let fd = stdout().as_raw_fd();
            let saved = stdout()
                .is_terminal()
                .then(|| Termios::from_fd(fd).ok())
                .flatten()
                .and_then(|original| {
                    let mut quiet = original;
                    quiet.c_lflag &= !ECHOCTL;
                    tcsetattr(fd, TCSANOW, &quiet).ok().map(|_| original)
                });
            Self { saved }
        }
        #[cfg(not(unix))]
        {
            Self {}
        }
    }
}

impl Default for TermRestorer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TermRestorer {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(saved) = &self.saved {
            tcsetattr(stdout().as_raw_fd(), TCSANOW, saved).ok();
        }
    }
}

/// Sets up `env_logger`. `RUST_LOG` wins; otherwise each `-v` raises the
/// level one step above `default_level`.
pub fn init_logging(verbose: u8, default_level: &str) {
    let level = match verbose {
        0 => default_level,
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .init();
}

/// Installs the Ctrl+C handler and returns the flag it clears.
pub fn stop_flag(message: &'static str) -> anyhow::Result<Arc<AtomicBool>> {
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        if r.swap(false, Ordering::SeqCst) {
            eprintln!("\n{}", style(message).yellow());
        }
    })?;
    Ok(running)
}

fn prompt_error(e: dialoguer::Error) -> img2sd_core::Error {
    io::Error::other(e.to_string()).into()
}

/// Asks on the terminal and only accepts the word `yes`.
pub struct TypedConfirm;

impl Confirm for TypedConfirm {
    fn confirm(&self, prompt: &str) -> img2sd_core::Result<bool> {
        let answer = Input::<String>::with_theme(&ColorfulTheme::default())
            .with_prompt(format!("{prompt} (yes/NO)"))
            .allow_empty(true)
            .interact_text()
            .map_err(prompt_error)?;
        Ok(answer.trim().eq_ignore_ascii_case("yes"))
    }
}

/// Arrow-key menu over the candidate devices. Esc backs out.
pub struct MenuChooser {
    pub prompt: String,
}

impl Chooser for MenuChooser {
    fn choose(&self, candidates: &[Device]) -> img2sd_core::Result<Option<Device>> {
        if candidates.is_empty() {
            return Ok(None);
        }
        let items: Vec<String> = candidates.iter().map(|d| d.to_string()).collect();
        let selection = Select::with_theme(&ColorfulTheme::default())
            .with_prompt(self.prompt.as_str())
            .items(&items)
            .default(0)
            .interact_opt()
            .map_err(prompt_error)?;
        Ok(selection.map(|i| candidates[i].clone()))
    }
}

/// Resolves the `[DEVICE]` argument. A path is used as given; no argument or
/// `select` lets `chooser` pick from `candidates()`. Backing out is an error.
pub fn resolve_device<F>(
    arg: Option<&str>,
    candidates: F,
    chooser: &dyn Chooser,
) -> anyhow::Result<PathBuf>
where
    F: FnOnce() -> img2sd_core::Result<Vec<Device>>,
{
    if let Some(path) = arg.filter(|a| *a != "select") {
        return Ok(PathBuf::from(path));
    }
    let devices = candidates()?;
    if devices.is_empty() {
        bail!("No removable devices found.");
    }
    match chooser.choose(&devices)? {
        Some(device) => Ok(device.path),
        None => bail!("No valid device selected. Exiting."),
    }
}

fn bar_style(color: &str) -> ProgressStyle {
    let template = format!(
        "{{prefix:12}} [{{elapsed_precise}}] [{{bar:40.{color}/black}}] {{bytes}}/{{total_bytes}} ({{bytes_per_sec}}, {{eta}})"
    );
    ProgressStyle::default_bar()
        .template(&template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("■ ")
}

/// Draws one write bar and one verify bar per partition.
pub struct ProgressObserver {
    bar: ProgressBar,
}

impl ProgressObserver {
    pub fn new() -> Self {
        Self {
            bar: ProgressBar::hidden(),
        }
    }

    /// Leaves whatever bar is on screen, e.g. when the session failed.
    pub fn abandon(&self) {
        if !self.bar.is_finished() {
            self.bar.abandon_with_message("❌ Operation failed.");
        }
    }
}

impl Default for ProgressObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl Observer for ProgressObserver {
    fn partition_started(&mut self, task: &FlashTask<'_>) {
        println!(
            "\n{} {} -> {} at offset {}",
            style("▶").cyan(),
            style(task.image_path.display()).cyan(),
            task.device.display(),
            task.offset()
        );
        self.bar = ProgressBar::new(task.record.size.bytes());
        self.bar.set_prefix("Writing");
        self.bar.set_style(bar_style("green"));
    }

    fn write_progress(&mut self, done: u64, total: u64) {
        self.bar.set_length(total);
        self.bar.set_position(done);
    }

    fn verify_started(&mut self, task: &FlashTask<'_>, strategy: Strategy) {
        self.bar.finish_with_message("Write complete.");
        self.bar = ProgressBar::new(task.image_size);
        self.bar.set_prefix(match strategy {
            Strategy::FullChecksum => "Verifying",
            Strategy::Sampled => "Sampling",
        });
        self.bar.set_style(bar_style("magenta"));
    }

    fn verify_progress(&mut self, done: u64, total: u64) {
        self.bar.set_length(total);
        self.bar.set_position(done);
    }

    fn partition_finished(&mut self, report: &PartitionReport) {
        self.bar.finish();
        if report.padded_bytes > 0 {
            println!(
                "  {} padded with {} of zeros",
                style("ℹ").blue(),
                format_size(report.padded_bytes)
            );
        }
        let line = match report.verify {
            VerifyStatus::Passed(Strategy::FullChecksum) => {
                format!("{} checksum verified", style("✓").green())
            }
            VerifyStatus::Passed(Strategy::Sampled) => {
                format!("{} sampled verification passed", style("✓").green())
            }
            VerifyStatus::SkippedPadded => format!(
                "{} verification skipped, partition is padded",
                style("ℹ").blue()
            ),
            VerifyStatus::Overridden => format!(
                "{} verification failed, continued on request",
                style("⚠").yellow()
            ),
            VerifyStatus::Disabled => format!("{} verification disabled", style("-").dim()),
        };
        println!("  {} {line}", style(&report.name).bold());
    }
}
