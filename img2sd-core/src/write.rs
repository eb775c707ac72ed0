//! Contains the logic for writing one partition image to a device.
//!
//! The image is streamed to an absolute byte offset on the target. If it is
//! shorter than its partition, the rest of the partition is zero-filled so
//! the next partition always starts on its declared boundary.
use crate::error::{Error, Result};
use crate::size::ByteSize;
use log::debug;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Images larger than this are streamed with [`LARGE_BLOCK`] buffers.
pub const LARGE_IMAGE_THRESHOLD: ByteSize = ByteSize::mib(64);
pub const LARGE_BLOCK: ByteSize = ByteSize::mib(64);
pub const SMALL_BLOCK: ByteSize = ByteSize::mib(1);

/// What a successful write put on the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WriteResult {
    /// Image bytes copied.
    pub bytes_written: u64,
    /// Zero bytes written after the image to reach the partition boundary.
    pub padded_bytes: u64,
    pub padded: bool,
}

/// Buffer granularity for an image of `image_len` bytes.
///
/// Only throughput depends on this; offsets are always absolute bytes.
pub fn block_size_for(image_len: u64) -> usize {
    if image_len > LARGE_IMAGE_THRESHOLD.bytes() {
        LARGE_BLOCK.bytes() as usize
    } else {
        SMALL_BLOCK.bytes() as usize
    }
}

/// Writes `image_path` to `device_path` at `offset`, padding with zeros up to
/// `partition_size`.
///
/// The size precondition is checked before the device is opened, so an
/// oversized image never touches the device. Once writing has started every
/// failure is a [`Error::WriteFailed`]; nothing is retried. The device's data
/// is synced before returning.
///
/// # Arguments
///
/// * `name` - The partition name, used in error messages.
/// * `image_path` - Path to the partition image.
/// * `device_path` - Path to the target device or image file.
/// * `offset` - Absolute byte offset of the partition.
/// * `partition_size` - Declared partition size in bytes.
/// * `on_progress` - Called with `(bytes_done, partition_size)` after every
///   chunk, including padding chunks.
pub fn run<F>(
    name: &str,
    image_path: &Path,
    device_path: &Path,
    offset: u64,
    partition_size: u64,
    mut on_progress: F,
) -> Result<WriteResult>
where
    F: FnMut(u64, u64),
{
    let mut image_file = File::open(image_path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => Error::ImageNotFound {
            name: name.to_string(),
            path: image_path.to_path_buf(),
        },
        _ => Error::Io(e),
    })?;
    let image_len = image_file.metadata()?.len();

    if image_len > partition_size {
        return Err(Error::ImageTooLarge {
            name: name.to_string(),
            path: image_path.to_path_buf(),
            image_size: image_len,
            partition_size,
        });
    }

    let fail = |source: io::Error| Error::WriteFailed {
        name: name.to_string(),
        device: device_path.to_path_buf(),
        source,
    };

    let mut device_file = OpenOptions::new()
        .write(true)
        .open(device_path)
        .map_err(fail)?;
    device_file.seek(SeekFrom::Start(offset)).map_err(fail)?;

    let mut buffer = vec![0u8; block_size_for(image_len)];
    debug!(
        "Writing {} ({image_len} bytes) to {} at {offset} with {} blocks",
        image_path.display(),
        device_path.display(),
        ByteSize::from_bytes(buffer.len() as u64)
    );

    let mut written: u64 = 0;
    while written < image_len {
        let to_read = std::cmp::min(buffer.len() as u64, image_len - written) as usize;
        image_file
            .read_exact(&mut buffer[..to_read])
            .map_err(fail)?;
        device_file.write_all(&buffer[..to_read]).map_err(fail)?;

        written += to_read as u64;
        on_progress(written, partition_size);
    }

    let padded_bytes = partition_size - image_len;
    if padded_bytes > 0 {
        debug!(
            "Zero-filling {padded_bytes} bytes at {}",
            offset + image_len
        );
        buffer.fill(0);
        let mut remaining = padded_bytes;
        while remaining > 0 {
            let chunk = std::cmp::min(buffer.len() as u64, remaining) as usize;
            device_file.write_all(&buffer[..chunk]).map_err(fail)?;
            remaining -= chunk as u64;
            on_progress(partition_size - remaining, partition_size);
        }
    }

    device_file.flush().map_err(fail)?;
    device_file.sync_data().map_err(fail)?;

    Ok(WriteResult {
        bytes_written: image_len,
        padded_bytes,
        padded: padded_bytes > 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn setup(image: &[u8], device_len: usize) -> (TempDir, std::path::PathBuf, std::path::PathBuf) {
        let dir = TempDir::new().unwrap();
        let image_path = dir.path().join("part.img");
        let device_path = dir.path().join("device.bin");
        fs::write(&image_path, image).unwrap();
        fs::write(&device_path, vec![0xAA; device_len]).unwrap();
        (dir, image_path, device_path)
    }

    #[test]
    fn writes_at_exact_unaligned_offset() {
        let (_dir, image, device) = setup(b"hello", 64);
        let result = run("p", &image, &device, 7, 5, |_, _| {}).unwrap();
        assert_eq!(
            result,
            WriteResult {
                bytes_written: 5,
                padded_bytes: 0,
                padded: false
            }
        );

        let bytes = fs::read(&device).unwrap();
        assert_eq!(&bytes[..7], &[0xAA; 7]);
        assert_eq!(&bytes[7..12], b"hello");
        assert_eq!(&bytes[12..], &[0xAA; 52]);
    }

    #[test]
    fn pads_short_image_to_partition_boundary() {
        let (_dir, image, device) = setup(&[1, 2, 3], 32);
        let mut last = (0, 0);
        let result = run("p", &image, &device, 4, 10, |done, total| last = (done, total)).unwrap();
        assert!(result.padded);
        assert_eq!(result.padded_bytes, 7);
        assert_eq!(last, (10, 10));

        let bytes = fs::read(&device).unwrap();
        assert_eq!(&bytes[4..7], &[1, 2, 3]);
        assert_eq!(&bytes[7..14], &[0; 7]);
        assert_eq!(bytes[14], 0xAA);
    }

    #[test]
    fn oversized_image_never_touches_device() {
        let (_dir, image, device) = setup(&[7; 100], 256);
        let err = run("boot", &image, &device, 0, 99, |_, _| {}).unwrap_err();
        assert!(matches!(
            err,
            Error::ImageTooLarge { image_size: 100, partition_size: 99, .. }
        ));
        assert_eq!(fs::read(&device).unwrap(), vec![0xAA; 256]);
    }

    #[test]
    fn missing_device_is_a_write_failure() {
        let (dir, image, _device) = setup(b"x", 1);
        let err = run("p", &image, &dir.path().join("gone"), 0, 1, |_, _| {}).unwrap_err();
        assert!(matches!(err, Error::WriteFailed { .. }));
    }

    #[test]
    fn missing_image_is_reported_as_not_found() {
        let (dir, _image, device) = setup(b"x", 1);
        let err = run("boot", &dir.path().join("boot.img"), &device, 0, 1, |_, _| {}).unwrap_err();
        assert!(matches!(err, Error::ImageNotFound { name, .. } if name == "boot"));
    }

    #[test]
    fn block_size_grows_for_large_images() {
        assert_eq!(block_size_for(1024), 1 << 20);
        assert_eq!(block_size_for(64 << 20), 1 << 20);
        assert_eq!(block_size_for((64 << 20) + 1), 64 << 20);
    }
}
