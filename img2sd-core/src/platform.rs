//! Provides platform-specific functionality.
//!
//! This module contains the logic for interacting with the operating system to
//! discover removable block devices, classify a target path, and query device
//! capacity. Only Linux is supported: discovery reads `/sys/block` and capacity
//! comes from the `BLKGETSIZE64` ioctl.

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use self::linux::*;

#[cfg(not(target_os = "linux"))]
compile_error!("img2sd-core currently supports Linux only");
