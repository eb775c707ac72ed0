//! The error taxonomy shared by every stage of a flash.
//!
//! Parse-time variants abort a whole descriptor. Everything else aborts only
//! the session for one device.
use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors produced by `img2sd-core`.
#[derive(Error, Debug)]
pub enum Error {
    #[error("malformed size '{token}': expected <digits><B|K|M|G>")]
    MalformedSize { token: String },

    #[error("malformed partition entry '{entry}': {reason}")]
    MalformedPartitionEntry { entry: String, reason: String },

    #[error("partition '{name}' is declared more than once")]
    DuplicatePartition { name: String },

    #[error("descriptor declares partitions for '{tag}' more than once")]
    DuplicateDeviceTag { tag: String },

    #[error("descriptor has no partition list for '{tag}'")]
    MissingPrimary { tag: String },

    #[error("image '{}' for partition '{name}' not found", path.display())]
    ImageNotFound { name: String, path: PathBuf },

    #[error(
        "image '{}' ({image_size} bytes) exceeds partition '{name}' ({partition_size} bytes)",
        path.display()
    )]
    ImageTooLarge {
        name: String,
        path: PathBuf,
        image_size: u64,
        partition_size: u64,
    },

    #[error("{} is not a removable device and the write was not confirmed", device.display())]
    DeviceNotRemovable { device: PathBuf },

    #[error("device validation failed for {}: {reason}", device.display())]
    DeviceValidationFailed { device: PathBuf, reason: String },

    #[error("writing partition '{name}' to {} failed: {source}", device.display())]
    WriteFailed {
        name: String,
        device: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid verification policy: {reason}")]
    InvalidVerifier { reason: String },

    #[error("verification of partition '{name}' on {} failed", device.display())]
    VerifyFailed { name: String, device: PathBuf },

    #[error("operation cancelled by user")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A `Result` alias using the crate's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
