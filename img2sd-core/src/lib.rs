//! The core, UI-agnostic library for the `img2sd` SD card flasher.
//!
//! `img2sd-core` turns a partition descriptor such as
//! `blkdevparts=mmcblk1:32K(env),512K@32K(idblock),32M(boot)` plus one
//! `<name>.img` per partition into a flashed card. It can be driven by any
//! front-end: the `img2sd` and `multiflash` binaries are two of them.
//!
//! The library is structured into several key modules:
//! - [`size`]: `512K`/`64M`/`1G` size tokens.
//! - [`descriptor`]: the partition descriptor parser.
//! - [`mod@write`]: writes one image at its offset and zero-pads it.
//! - [`verify`]: full-checksum and sampled read-back verification.
//! - [`session`]: flashes a whole layout onto one target.
//! - [`monitor`]: watches for inserted cards and flashes each one once.
//! - [`device`] and [`platform`]: device discovery and target validation.
//! - [`confirm`]: the confirmation and device chooser capabilities.
//! - [`envfile`]: backup and restore of the board's environment file.
//!
//! Progress is reported through the [`session::Observer`] trait so callers can
//! display it any way they choose.
//!
//! ## Example: Flashing a Layout
//!
//! ```rust,no_run
//! use img2sd_core::confirm::Refuse;
//! use img2sd_core::descriptor::Descriptor;
//! use img2sd_core::device::Target;
//! use img2sd_core::session::{FlashPolicy, FlashSession, Silent};
//! use std::path::Path;
//!
//! fn main() -> img2sd_core::Result<()> {
//!     let text = std::fs::read_to_string(".env.txt")?;
//!     let descriptor = Descriptor::parse(&text)?;
//!
//!     let policy = FlashPolicy::default();
//!     let target = Target::validate(Path::new("/dev/sdb"), false, &Refuse)?;
//!
//!     let report = FlashSession::new(&target, &policy)
//!         .image_dir(".")
//!         .run(&descriptor.records, &mut Silent)?;
//!
//!     for partition in &report.partitions {
//!         println!("{}: {:?}", partition.name, partition.verify);
//!     }
//!     Ok(())
//! }
//! ```

pub mod confirm;
pub mod descriptor;
pub mod device;
pub mod envfile;
pub mod error;
pub mod monitor;
pub mod platform;
pub mod session;
pub mod size;
pub mod verify;
pub mod write;

pub use error::{Error, Result};
