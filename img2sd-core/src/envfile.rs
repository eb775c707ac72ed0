//! Bookkeeping for the board's environment file (`.env.txt`).
//!
//! [`EnvBackup`] keeps a pristine copy next to the file for as long as it is
//! alive and puts it back when dropped, whichever way the program exits.
use std::ffi::OsString;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use crate::error::Result;

/// The backup path for `path`: the same name with `.orig` appended.
pub fn backup_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".orig");
    PathBuf::from(name)
}

/// Restores an environment file from its backup when dropped.
#[derive(Debug)]
pub struct EnvBackup {
    path: PathBuf,
    backup: PathBuf,
}

impl EnvBackup {
    /// Copies `path` to `<path>.orig`.
    ///
    /// A backup left behind by an interrupted run is restored first, so the
    /// new backup is always taken from the pristine file.
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let backup = backup_path(&path);

        if backup.exists() {
            warn!(
                "Restoring {} from a backup left by an earlier run",
                path.display()
            );
            fs::rename(&backup, &path)?;
        }
        fs::copy(&path, &backup)?;
        debug!("Backed up {} to {}", path.display(), backup.display());

        Ok(Self { path, backup })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Puts the backup back now instead of on drop.
    pub fn restore(self) -> Result<()> {
        self.restore_in_place()
    }

    fn restore_in_place(&self) -> Result<()> {
        if self.backup.exists() {
            fs::rename(&self.backup, &self.path)?;
            info!("Restored {}", self.path.display());
        }
        Ok(())
    }
}

impl Drop for EnvBackup {
    fn drop(&mut self) {
        if let Err(e) = self.restore_in_place() {
            warn!("Could not restore {}: {e}", self.path.display());
        }
    }
}

/// Writes secondary-tag descriptor lines verbatim, one per line.
pub fn write_passthrough(out: &Path, lines: &[String]) -> Result<()> {
    let mut file = fs::File::create(out)?;
    for line in lines {
        writeln!(file, "{line}")?;
    }
    file.flush()?;
    debug!("Wrote {} pass-through lines to {}", lines.len(), out.display());
    Ok(())
}
