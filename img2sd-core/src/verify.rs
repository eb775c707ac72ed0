//! Read-back verification of a written partition.
//!
//! Two strategies are available. Small images are verified in full by
//! comparing SHA-256 digests. Large images are sampled: three windows at the
//! start, middle and end of the image are compared byte for byte. Sampling is
//! a best-effort check; corruption outside the windows goes unnoticed.
use crate::error::{Error, Result};
use crate::size::ByteSize;
use log::debug;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::os::unix::fs::FileExt;
use std::path::Path;

const BUFFER_SIZE: usize = 1024 * 1024; // 1 MiB

/// How a partition was checked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    FullChecksum,
    Sampled,
}

/// How much of the device range the full checksum covers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum VerifySpan {
    /// The bytes of the image only.
    #[default]
    Image,
    /// The whole declared partition, padding included. Against a padded
    /// partition this always mismatches and is reported as skipped.
    Partition,
}

/// The verification policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Verifier {
    /// Images strictly larger than this are sampled.
    pub sample_threshold: ByteSize,
    pub sample_size: ByteSize,
}

impl Default for Verifier {
    fn default() -> Self {
        Self {
            sample_threshold: ByteSize::mib(64),
            sample_size: ByteSize::mib(1),
        }
    }
}

impl Verifier {
    /// Rejects a zero sample size, which would make every sampled
    /// comparison vacuously match.
    pub fn validate(&self) -> Result<()> {
        if self.sample_size.bytes() == 0 {
            return Err(Error::InvalidVerifier {
                reason: "sample size must be at least 1 byte".to_string(),
            });
        }
        Ok(())
    }

    pub fn strategy_for(&self, image_len: u64) -> Strategy {
        if image_len > self.sample_threshold.bytes() {
            Strategy::Sampled
        } else {
            Strategy::FullChecksum
        }
    }

    /// Compares the image with the device starting at `offset`.
    ///
    /// `span` is the device length hashed by the full strategy; sampling always
    /// works on the image length. Returns the strategy used and whether the
    /// contents matched. A device that ends before the compared range is a
    /// mismatch, not an error.
    pub fn verify<F>(
        &self,
        image_path: &Path,
        device_path: &Path,
        offset: u64,
        span: u64,
        on_progress: F,
    ) -> Result<(Strategy, bool)>
    where
        F: FnMut(u64, u64),
    {
        self.validate()?;
        let image_len = std::fs::metadata(image_path)?.len();
        let strategy = self.strategy_for(image_len);
        let matched = match strategy {
            Strategy::FullChecksum => {
                full_compare(image_path, device_path, offset, span, on_progress)?
            }
            Strategy::Sampled => {
                sampled_compare(image_path, device_path, offset, self.sample_size.bytes())?
            }
        };
        debug!(
            "{:?} verification of {} at {offset}: {}",
            strategy,
            image_path.display(),
            if matched { "match" } else { "mismatch" }
        );
        Ok((strategy, matched))
    }
}

/// Hashes `len` bytes of `file` from `offset`, reporting progress through
/// `done_before`.
fn hash_range<F>(
    file: &mut File,
    offset: u64,
    len: u64,
    done_before: u64,
    total: u64,
    on_progress: &mut F,
) -> io::Result<Vec<u8>>
where
    F: FnMut(u64, u64),
{
    file.seek(SeekFrom::Start(offset))?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];

    let mut remaining = len;
    while remaining > 0 {
        let chunk = std::cmp::min(BUFFER_SIZE as u64, remaining) as usize;
        file.read_exact(&mut buffer[..chunk])?;
        hasher.update(&buffer[..chunk]);
        remaining -= chunk as u64;
        on_progress(done_before + len - remaining, total);
    }

    Ok(hasher.finalize().to_vec())
}

/// Compares the SHA-256 of the whole image with the SHA-256 of `span` bytes of
/// the device from `offset`.
pub fn full_compare<F>(
    image_path: &Path,
    device_path: &Path,
    offset: u64,
    span: u64,
    mut on_progress: F,
) -> Result<bool>
where
    F: FnMut(u64, u64),
{
    let mut image_file = File::open(image_path)?;
    let image_len = image_file.metadata()?.len();
    let mut device_file = File::open(device_path)?;
    let total = image_len + span;

    let image_hash = hash_range(&mut image_file, 0, image_len, 0, total, &mut on_progress)?;
    let device_hash = match hash_range(
        &mut device_file,
        offset,
        span,
        image_len,
        total,
        &mut on_progress,
    ) {
        Ok(hash) => hash,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(false),
        Err(e) => return Err(Error::Io(e)),
    };

    Ok(image_hash == device_hash)
}

/// The three sample positions for an image of `len` bytes.
pub fn sample_positions(len: u64, sample_size: u64) -> [u64; 3] {
    [0, len / 2, len.saturating_sub(sample_size)]
}

/// Compares up to `sample_size` bytes at the start, middle and end of the
/// image with the same positions on the device.
pub fn sampled_compare(
    image_path: &Path,
    device_path: &Path,
    offset: u64,
    sample_size: u64,
) -> Result<bool> {
    if sample_size == 0 {
        return Err(Error::InvalidVerifier {
            reason: "sample size must be at least 1 byte".to_string(),
        });
    }
    let image_file = File::open(image_path)?;
    let image_len = image_file.metadata()?.len();
    let device_file = File::open(device_path)?;

    // Samples never extend past the image, so neither do the buffers.
    let buf_len = std::cmp::min(sample_size, image_len) as usize;
    let mut image_buf = vec![0u8; buf_len];
    let mut device_buf = vec![0u8; buf_len];

    for pos in sample_positions(image_len, sample_size) {
        let n = std::cmp::min(sample_size, image_len - pos) as usize;
        image_file.read_exact_at(&mut image_buf[..n], pos)?;
        match device_file.read_exact_at(&mut device_buf[..n], offset + pos) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(false),
            Err(e) => return Err(Error::Io(e)),
        }
        if image_buf[..n] != device_buf[..n] {
            debug!("Sample at {pos} differs");
            return Ok(false);
        }
    }

    Ok(true)
}
