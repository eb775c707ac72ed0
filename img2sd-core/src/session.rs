//! Flashes a whole partition layout onto one target.
//!
//! A session walks the primary records of a descriptor in order. For each one
//! it locates `<name>.img`, checks the size, writes and pads it through
//! [`crate::write`], and verifies it through [`crate::verify`]. The first
//! fatal error aborts the session; records already written stay written.
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{info, warn};

use crate::confirm::{Confirm, Refuse};
use crate::descriptor::PartitionRecord;
use crate::device::Target;
use crate::error::{Error, Result};
use crate::size::{ByteSize, format_size};
use crate::verify::{Strategy, Verifier, VerifySpan};
use crate::write::{self, WriteResult};

/// Knobs for a flash session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlashPolicy {
    /// Read back and compare every partition after writing it.
    pub verify: bool,
    pub verifier: Verifier,
    pub verify_span: VerifySpan,
    /// Skip the confirmation for block devices not flagged removable.
    pub allow_non_removable: bool,
}

impl Default for FlashPolicy {
    fn default() -> Self {
        Self {
            verify: true,
            verifier: Verifier::default(),
            verify_span: VerifySpan::default(),
            allow_non_removable: false,
        }
    }
}

/// How a partition's verification ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VerifyStatus {
    Passed(Strategy),
    /// The compared range included zero padding, so the mismatch says nothing
    /// about the image.
    SkippedPadded,
    /// Mismatched, and the operator chose to continue.
    Overridden,
    Disabled,
}

/// One partition processed by a session.
#[derive(Clone, Debug)]
pub struct FlashTask<'a> {
    pub device: &'a Path,
    pub record: &'a PartitionRecord,
    pub image_path: PathBuf,
    pub image_size: u64,
}

impl FlashTask<'_> {
    pub fn offset(&self) -> ByteSize {
        self.record.offset
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionReport {
    pub name: String,
    pub offset: ByteSize,
    pub image_size: u64,
    pub padded_bytes: u64,
    pub verify: VerifyStatus,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionReport {
    pub device: PathBuf,
    pub partitions: Vec<PartitionReport>,
}

/// Receives session progress. Every method defaults to doing nothing.
#[allow(unused_variables)]
pub trait Observer {
    fn partition_started(&mut self, task: &FlashTask<'_>) {}
    fn write_progress(&mut self, done: u64, total: u64) {}
    fn verify_started(&mut self, task: &FlashTask<'_>, strategy: Strategy) {}
    fn verify_progress(&mut self, done: u64, total: u64) {}
    fn partition_finished(&mut self, report: &PartitionReport) {}
}

/// An observer that ignores everything.
pub struct Silent;

impl Observer for Silent {}

/// A flash of one layout onto one validated target.
pub struct FlashSession<'a> {
    target: &'a Target,
    policy: &'a FlashPolicy,
    image_dir: PathBuf,
    confirm: &'a dyn Confirm,
    running: Option<Arc<AtomicBool>>,
}

impl<'a> FlashSession<'a> {
    /// A session reading images from the current directory that declines
    /// every confirmation.
    pub fn new(target: &'a Target, policy: &'a FlashPolicy) -> Self {
        Self {
            target,
            policy,
            image_dir: PathBuf::from("."),
            confirm: &Refuse,
            running: None,
        }
    }

    pub fn image_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.image_dir = dir.into();
        self
    }

    pub fn confirm(mut self, confirm: &'a dyn Confirm) -> Self {
        self.confirm = confirm;
        self
    }

    /// Stops the session before the next partition once `running` turns
    /// false. A partition that is being written is always finished first.
    pub fn cancel_on(mut self, running: Arc<AtomicBool>) -> Self {
        self.running = Some(running);
        self
    }

    /// Writes and verifies every record, in order.
    pub fn run(&self, records: &[PartitionRecord], observer: &mut dyn Observer) -> Result<SessionReport> {
        if self.policy.verify {
            self.policy.verifier.validate()?;
        }
        let device = self.target.path();
        let layout_end = records.iter().map(PartitionRecord::end).max().unwrap_or(0);
        self.target.ensure_fits(layout_end)?;

        info!(
            "Flashing {} partitions ({}) to {}",
            records.len(),
            format_size(layout_end),
            device.display()
        );

        let mut partitions = Vec::with_capacity(records.len());
        for record in records {
            if let Some(running) = &self.running {
                if !running.load(Ordering::SeqCst) {
                    return Err(Error::Cancelled);
                }
            }
            let report = self.flash_partition(device, record, observer)?;
            observer.partition_finished(&report);
            partitions.push(report);
        }

        nix::unistd::sync();
        info!("All partitions written to {}", device.display());

        Ok(SessionReport {
            device: device.to_path_buf(),
            partitions,
        })
    }

    fn flash_partition(
        &self,
        device: &Path,
        record: &PartitionRecord,
        observer: &mut dyn Observer,
    ) -> Result<PartitionReport> {
        let image_path = self.image_dir.join(record.image_file_name());
        let image_size = match fs::metadata(&image_path) {
            Ok(metadata) => metadata.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::ImageNotFound {
                    name: record.name.clone(),
                    path: image_path,
                });
            }
            Err(e) => return Err(e.into()),
        };
        if image_size > record.size.bytes() {
            return Err(Error::ImageTooLarge {
                name: record.name.clone(),
                path: image_path,
                image_size,
                partition_size: record.size.bytes(),
            });
        }

        let task = FlashTask {
            device,
            record,
            image_path,
            image_size,
        };
        info!(
            "{}: {} -> {} ({})",
            record.name,
            task.image_path.display(),
            device.display(),
            record
        );
        observer.partition_started(&task);

        let written = write::run(
            &record.name,
            &task.image_path,
            device,
            record.offset.bytes(),
            record.size.bytes(),
            |done, total| observer.write_progress(done, total),
        )?;
        if written.padded {
            info!(
                "{}: padded with {} of zeros",
                record.name,
                format_size(written.padded_bytes)
            );
        }

        let verify = if self.policy.verify {
            self.verify_partition(&task, &written, observer)?
        } else {
            VerifyStatus::Disabled
        };

        Ok(PartitionReport {
            name: record.name.clone(),
            offset: record.offset,
            image_size,
            padded_bytes: written.padded_bytes,
            verify,
        })
    }

    fn verify_partition(
        &self,
        task: &FlashTask<'_>,
        written: &WriteResult,
        observer: &mut dyn Observer,
    ) -> Result<VerifyStatus> {
        let record = task.record;
        let span = match self.policy.verify_span {
            VerifySpan::Image => task.image_size,
            VerifySpan::Partition => record.size.bytes(),
        };
        let verifier = &self.policy.verifier;
        observer.verify_started(task, verifier.strategy_for(task.image_size));

        let (strategy, matched) = verifier.verify(
            &task.image_path,
            task.device,
            record.offset.bytes(),
            span,
            |done, total| observer.verify_progress(done, total),
        )?;
        if matched {
            info!("{}: verification passed ({:?})", record.name, strategy);
            return Ok(VerifyStatus::Passed(strategy));
        }

        let compared_padding = strategy == Strategy::FullChecksum && span > task.image_size;
        if written.padded && compared_padding {
            info!(
                "{}: verification skipped, partition is padded ({} + {} padding)",
                record.name,
                format_size(task.image_size),
                format_size(written.padded_bytes)
            );
            return Ok(VerifyStatus::SkippedPadded);
        }

        warn!("{}: verification failed on {}", record.name, task.device.display());
        let proceed = self.confirm.confirm(&format!(
            "Verification of '{}' failed. Type 'yes' to continue anyway",
            record.name
        ))?;
        if proceed {
            Ok(VerifyStatus::Overridden)
        } else {
            Err(Error::VerifyFailed {
                name: record.name.clone(),
                device: task.device.to_path_buf(),
            })
        }
    }
}
