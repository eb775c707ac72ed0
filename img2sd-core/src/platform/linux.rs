use crate::device::Device;
use crate::error::{Error, Result};
use log::debug;
use nix::ioctl_read;
use std::fs::{self, File};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

ioctl_read!(blkgetsize64, 0x12, 114, u64);

/// A view of the kernel's `/sys/block` directory.
///
/// The root is configurable so discovery can be exercised against a fake tree.
#[derive(Clone, Debug)]
pub struct Sysfs {
    root: PathBuf,
}

impl Default for Sysfs {
    fn default() -> Self {
        Self::new("/sys/block")
    }
}

impl Sysfs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Reads a specific attribute file of a block device.
    fn read(&self, device_name: &str, file: &str) -> io::Result<String> {
        let path = self.root.join(device_name).join(file);
        fs::read_to_string(path).map(|s| s.trim().to_string())
    }

    /// Whether the kernel knows `device_name` as a whole block device.
    pub fn contains(&self, device_name: &str) -> bool {
        self.root.join(device_name).exists()
    }

    pub fn is_removable(&self, device_name: &str) -> bool {
        self.read(device_name, "removable")
            .map(|s| s == "1")
            .unwrap_or(false)
    }

    /// Device size in bytes, from the 512-byte sector count.
    pub fn size_bytes(&self, device_name: &str) -> u64 {
        self.read(device_name, "size")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0)
            .saturating_mul(512)
    }

    /// Lists removable whole-disk devices with media present.
    ///
    /// Loop and zram devices are skipped, as is `exclude` (the system disk).
    /// Devices reporting a size of zero (empty card readers) are skipped too.
    pub fn removable_devices(&self, exclude: Option<&Path>) -> Result<Vec<Device>> {
        let mut devices = Vec::new();

        for entry in fs::read_dir(&self.root)?.filter_map(|e| e.ok()) {
            let device_name = entry.file_name().to_string_lossy().to_string();
            let device_path = PathBuf::from("/dev/").join(&device_name);

            if device_name.starts_with("loop")
                || device_name.starts_with("zram")
                || Some(device_path.as_path()) == exclude
            {
                continue;
            }
            if !self.is_removable(&device_name) {
                continue;
            }
            let size_bytes = self.size_bytes(&device_name);
            if size_bytes == 0 {
                debug!("Skipping {device_name}: no media");
                continue;
            }

            devices.push(Device {
                path: device_path,
                name: device_name,
                size_bytes,
                removable: true,
                mount_point: String::new(),
            });
        }

        devices.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(devices)
    }
}

/// Helper to find the parent device of a partition (e.g., /dev/sda1 -> /dev/sda).
/// This is used to find the system drive's parent for exclusion.
fn get_parent_device_path(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if path_str.starts_with("/dev/sd") {
        if let Some(index) = path_str.rfind(|c: char| c.is_alphabetic()) {
            return PathBuf::from(&path_str[..=index]);
        }
    } else if path_str.starts_with("/dev/mmcblk") || path_str.starts_with("/dev/nvme") {
        if let Some(index) = path_str.rfind('p') {
            return PathBuf::from(&path_str[..index]);
        }
    }

    path.to_path_buf()
}

/// Scans for all removable block devices with media inserted.
///
/// The disk mounted at `/` is excluded even if the kernel flags it removable,
/// so a system booted from a USB stick never offers itself as a target. Mount
/// points are filled in from `sysinfo`.
pub fn get_removable_devices() -> Result<Vec<Device>> {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    let system_disk_parent = disks
        .iter()
        .find(|disk| disk.mount_point() == Path::new("/"))
        .map(|disk| get_parent_device_path(&PathBuf::from("/dev/").join(disk.name())));
    if system_disk_parent.is_none() {
        debug!("Could not determine the system drive; nothing excluded");
    }

    let mut devices = Sysfs::default().removable_devices(system_disk_parent.as_deref())?;
    for device in &mut devices {
        if let Some(disk) = disks.iter().find(|d| {
            d.name().to_string_lossy().starts_with(&device.name)
                && !d.mount_point().as_os_str().is_empty()
        }) {
            device.mount_point = disk.mount_point().to_string_lossy().to_string();
        }
    }

    Ok(devices)
}

/// Describes the whole-disk block device at `path` using `sysfs`.
///
/// Symlinks are resolved first, so the returned path is the kernel device
/// node. Partitions (e.g. `/dev/sdb1`) and unknown names fail validation.
pub fn inspect_device(sysfs: &Sysfs, path: &Path) -> Result<Device> {
    let invalid = |reason: String| Error::DeviceValidationFailed {
        device: path.to_path_buf(),
        reason,
    };

    // Follow aliases such as /dev/disk/by-id/* to the kernel name.
    let resolved = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    let path = resolved.as_path();

    if !path.starts_with("/dev/") {
        return Err(invalid("block devices must live under /dev".to_string()));
    }
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| invalid("path has no device name".to_string()))?;
    if !sysfs.contains(&name) {
        return Err(invalid(format!("'{name}' is not a whole-disk block device")));
    }

    Ok(Device {
        path: path.to_path_buf(),
        size_bytes: sysfs.size_bytes(&name),
        removable: sysfs.is_removable(&name),
        name,
        mount_point: String::new(),
    })
}

/// The capacity of an open block device in bytes (`BLKGETSIZE64`).
pub fn block_device_capacity(device: &File) -> io::Result<u64> {
    let fd = device.as_raw_fd();
    let mut size_bytes: u64 = 0;
    // SAFETY: `fd` is a valid open descriptor for the lifetime of `device`,
    // and the kernel writes exactly one u64 into `size_bytes`.
    unsafe {
        blkgetsize64(fd, &mut size_bytes).map_err(io::Error::from)?;
    }
    Ok(size_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fake_device(root: &Path, name: &str, removable: &str, sectors: &str) {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("removable"), format!("{removable}\n")).unwrap();
        fs::write(dir.join("size"), format!("{sectors}\n")).unwrap();
    }

    #[test]
    fn lists_only_removable_devices_with_media() {
        let root = TempDir::new().unwrap();
        fake_device(root.path(), "sda", "0", "1000");
        fake_device(root.path(), "sdc", "1", "2048");
        fake_device(root.path(), "sdb", "1", "4096");
        fake_device(root.path(), "sdd", "1", "0");
        fake_device(root.path(), "loop0", "1", "8");
        fake_device(root.path(), "zram0", "1", "8");

        let sysfs = Sysfs::new(root.path());
        let devices = sysfs.removable_devices(None).unwrap();
        let names: Vec<&str> = devices.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["sdb", "sdc"]);
        assert_eq!(devices[0].size_bytes, 4096 * 512);
        assert_eq!(devices[0].path, PathBuf::from("/dev/sdb"));
    }

    #[test]
    fn excludes_the_system_disk() {
        let root = TempDir::new().unwrap();
        fake_device(root.path(), "sdb", "1", "4096");
        fake_device(root.path(), "sdc", "1", "4096");

        let sysfs = Sysfs::new(root.path());
        let devices = sysfs
            .removable_devices(Some(Path::new("/dev/sdb")))
            .unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].name, "sdc");
    }

    #[test]
    fn inspect_classifies_removability() {
        let root = TempDir::new().unwrap();
        fake_device(root.path(), "sda", "0", "1000");
        fake_device(root.path(), "mmcblk1", "1", "1000");
        let sysfs = Sysfs::new(root.path());

        assert!(!inspect_device(&sysfs, Path::new("/dev/sda")).unwrap().removable);
        assert!(inspect_device(&sysfs, Path::new("/dev/mmcblk1")).unwrap().removable);
        assert!(matches!(
            inspect_device(&sysfs, Path::new("/dev/sda1")),
            Err(Error::DeviceValidationFailed { .. })
        ));
        assert!(matches!(
            inspect_device(&sysfs, Path::new("/tmp/sda")),
            Err(Error::DeviceValidationFailed { .. })
        ));
    }

    #[test]
    fn inspect_follows_device_aliases() {
        let root = TempDir::new().unwrap();
        fake_device(root.path(), "null", "1", "1000");
        let sysfs = Sysfs::new(root.path());

        let by_id = root.path().join("usb-Generic_SD_Card-0:0");
        std::os::unix::fs::symlink("/dev/null", &by_id).unwrap();

        let device = inspect_device(&sysfs, &by_id).unwrap();
        assert_eq!(device.name, "null");
        assert_eq!(device.path, PathBuf::from("/dev/null"));
        assert!(device.removable);
    }

    #[test]
    fn parent_device_of_partitions() {
        assert_eq!(
            get_parent_device_path(Path::new("/dev/sda2")),
            PathBuf::from("/dev/sda")
        );
        assert_eq!(
            get_parent_device_path(Path::new("/dev/nvme0n1p3")),
            PathBuf::from("/dev/nvme0n1")
        );
        assert_eq!(
            get_parent_device_path(Path::new("/dev/mmcblk0p1")),
            PathBuf::from("/dev/mmcblk0")
        );
    }
}
