use std::fmt;
use std::fs::{self, File};
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};

use log::{info, warn};

use crate::confirm::Confirm;
use crate::error::{Error, Result};
use crate::platform::{self, Sysfs};
use crate::size::format_size;

/// Represents a block device discovered on the system.
///
/// Populated by the discovery functions in the [`crate::platform`] module.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Device {
    /// The system path to the device (e.g., `/dev/sdb`).
    pub path: PathBuf,
    /// The kernel-provided name of the device (e.g., "sdb").
    pub name: String,
    /// Total size in bytes.
    pub size_bytes: u64,
    /// The kernel's `removable` flag.
    pub removable: bool,
    /// The primary mount point of the device, if any.
    pub mount_point: String,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mount_info = if !self.mount_point.is_empty() {
            format!("[Mounted at {}]", self.mount_point)
        } else {
            "[Not mounted]".to_string()
        };

        write!(
            f,
            "{:<15} {:>8.1} GB {}",
            self.path.display(),
            self.size_bytes as f64 / (1024.0 * 1024.0 * 1024.0),
            mount_info
        )
    }
}

/// A validated write destination.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Target {
    /// A whole-disk block device that passed the removability check (or whose
    /// write was explicitly confirmed).
    BlockDevice(Device),
    /// An existing regular file that receives the layout as a raw disk image.
    ImageFile(PathBuf),
}

impl Target {
    /// Classifies `path` and applies the removability guardrail.
    ///
    /// A block device that is not flagged removable requires either
    /// `allow_non_removable` or an affirmative answer from `confirm`.
    pub fn validate(path: &Path, allow_non_removable: bool, confirm: &dyn Confirm) -> Result<Self> {
        Self::validate_with(&Sysfs::default(), path, allow_non_removable, confirm)
    }

    pub fn validate_with(
        sysfs: &Sysfs,
        path: &Path,
        allow_non_removable: bool,
        confirm: &dyn Confirm,
    ) -> Result<Self> {
        let metadata = fs::metadata(path).map_err(|e| Error::DeviceValidationFailed {
            device: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        if metadata.file_type().is_block_device() {
            let device = platform::inspect_device(sysfs, path)?;
            if !device.mount_point.is_empty() {
                warn!("{} is mounted at {}", path.display(), device.mount_point);
            }
            guard_removable(device, allow_non_removable, confirm).map(Target::BlockDevice)
        } else if metadata.is_file() {
            Ok(Target::ImageFile(path.to_path_buf()))
        } else {
            Err(Error::DeviceValidationFailed {
                device: path.to_path_buf(),
                reason: "not a block device or regular file".to_string(),
            })
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            Target::BlockDevice(device) => &device.path,
            Target::ImageFile(path) => path,
        }
    }

    /// Refuses layouts that end beyond the device.
    ///
    /// Image files grow as needed, so only block devices are checked.
    pub fn ensure_fits(&self, layout_end: u64) -> Result<()> {
        let Target::BlockDevice(device) = self else {
            return Ok(());
        };
        let unreadable = |e: std::io::Error| Error::DeviceValidationFailed {
            device: device.path.clone(),
            reason: format!("cannot read device capacity: {e}"),
        };
        let file = File::open(&device.path).map_err(unreadable)?;
        let capacity = platform::block_device_capacity(&file).map_err(unreadable)?;
        if layout_end > capacity {
            return Err(Error::DeviceValidationFailed {
                device: device.path.clone(),
                reason: format!(
                    "layout needs {} but the device holds {}",
                    format_size(layout_end),
                    format_size(capacity)
                ),
            });
        }
        Ok(())
    }
}

/// Lets a removable device through. Anything else needs `allow_non_removable`
/// or a `yes` from `confirm`.
pub fn guard_removable(
    device: Device,
    allow_non_removable: bool,
    confirm: &dyn Confirm,
) -> Result<Device> {
    if device.removable {
        return Ok(device);
    }
    warn!("{} does not appear to be removable", device.path.display());
    let confirmed = allow_non_removable
        || confirm.confirm(&format!(
            "{} does not appear to be removable! Type 'yes' to write to it anyway",
            device.path.display()
        ))?;
    if !confirmed {
        return Err(Error::DeviceNotRemovable {
            device: device.path,
        });
    }
    info!("Writing to non-removable device {} as confirmed", device.path.display());
    Ok(device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confirm::{Assume, Refuse};
    use std::cell::Cell;
    use tempfile::{NamedTempFile, TempDir};

    /// Counts prompts and answers them all the same way.
    struct Counting {
        answer: bool,
        asked: Cell<usize>,
    }

    impl Confirm for Counting {
        fn confirm(&self, _prompt: &str) -> Result<bool> {
            self.asked.set(self.asked.get() + 1);
            Ok(self.answer)
        }
    }

    fn sysfs_device(removable: &str) -> (TempDir, Device) {
        let root = TempDir::new().unwrap();
        let dir = root.path().join("sdz");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("removable"), format!("{removable}\n")).unwrap();
        fs::write(dir.join("size"), "2048\n").unwrap();
        let device = platform::inspect_device(&Sysfs::new(root.path()), Path::new("/dev/sdz")).unwrap();
        (root, device)
    }

    #[test]
    fn non_removable_device_is_refused_without_confirmation() {
        let (_root, device) = sysfs_device("0");
        assert!(!device.removable);
        let err = guard_removable(device, false, &Refuse).unwrap_err();
        assert!(matches!(err, Error::DeviceNotRemovable { ref device } if device == Path::new("/dev/sdz")));
    }

    #[test]
    fn non_removable_device_passes_on_typed_yes() {
        let (_root, device) = sysfs_device("0");
        let guarded = guard_removable(device.clone(), false, &Assume).unwrap();
        assert_eq!(guarded, device);
    }

    #[test]
    fn override_flag_skips_the_prompt() {
        let (_root, device) = sysfs_device("0");
        let confirm = Counting {
            answer: false,
            asked: Cell::new(0),
        };
        guard_removable(device, true, &confirm).unwrap();
        assert_eq!(confirm.asked.get(), 0);
    }

    #[test]
    fn removable_device_is_never_prompted_for() {
        let (_root, device) = sysfs_device("1");
        let confirm = Counting {
            answer: false,
            asked: Cell::new(0),
        };
        guard_removable(device, false, &confirm).unwrap();
        assert_eq!(confirm.asked.get(), 0);
    }

    #[test]
    fn regular_file_is_an_image_target() {
        let file = NamedTempFile::new().unwrap();
        let target = Target::validate(file.path(), false, &Refuse).unwrap();
        assert_eq!(target, Target::ImageFile(file.path().to_path_buf()));
        target.ensure_fits(u64::MAX).unwrap();
    }

    #[test]
    fn missing_path_fails_validation() {
        let dir = TempDir::new().unwrap();
        let err = Target::validate(&dir.path().join("nope"), true, &Refuse).unwrap_err();
        assert!(matches!(err, Error::DeviceValidationFailed { .. }));
    }

    #[test]
    fn directory_fails_validation() {
        let dir = TempDir::new().unwrap();
        let err = Target::validate(dir.path(), true, &Refuse).unwrap_err();
        assert!(matches!(err, Error::DeviceValidationFailed { .. }));
    }

    #[test]
    fn unreadable_capacity_names_the_device() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gone");
        let target = Target::BlockDevice(Device {
            path: path.clone(),
            name: "gone".to_string(),
            size_bytes: 0,
            removable: true,
            mount_point: String::new(),
        });
        match target.ensure_fits(1).unwrap_err() {
            Error::DeviceValidationFailed { device, reason } => {
                assert_eq!(device, path);
                assert!(reason.contains("capacity"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn display_shows_size_and_mount() {
        let device = Device {
            path: PathBuf::from("/dev/sdb"),
            name: "sdb".to_string(),
            size_bytes: 8 * 1024 * 1024 * 1024,
            removable: true,
            mount_point: "/media/card".to_string(),
        };
        let shown = device.to_string();
        assert!(shown.starts_with("/dev/sdb"));
        assert!(shown.contains("8.0 GB"));
        assert!(shown.contains("[Mounted at /media/card]"));
    }
}
