//! Parses `blkdevparts=` / `sd_parts=` partition descriptors.
//!
//! A descriptor line looks like:
//!
//! ```text
//! blkdevparts=mmcblk1:32K(env),512K@32K(idblock),256K(uboot),32M(boot)
//! ```
//!
//! Each entry is either `SIZE@OFFSET(NAME)` or `SIZE(NAME)`. Entries without an
//! explicit offset start at the running cursor, which begins at zero and
//! advances by the size of every entry before it on the same line.
//!
//! Only the line for the primary tag (the card being flashed) is expanded
//! into [`PartitionRecord`]s. Lines for the secondary tag are kept verbatim so
//! they can be passed through; all other lines are ignored.
use std::collections::HashSet;
use std::fmt;
use std::sync::LazyLock;

use log::{debug, warn};
use regex::Regex;

use crate::error::{Error, Result};
use crate::size::{ByteSize, parse_size};

static LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(blkdevparts|sd_parts)=(\w+)(?::(\S*))?").expect("line regex is valid")
});

static EXPLICIT_ENTRY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+[BKMG])@(\d+[BKMG])\((\w+)\)$").expect("entry regex is valid")
});

static AUTO_ENTRY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+[BKMG])\((\w+)\)$").expect("entry regex is valid"));

/// The device tags that decide what a descriptor line is used for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TagConfig {
    /// The card being flashed, e.g. `mmcblk1`.
    pub primary: String,
    /// The already-provisioned medium whose lines are passed through.
    pub secondary: String,
}

impl Default for TagConfig {
    fn default() -> Self {
        Self {
            primary: "mmcblk1".to_string(),
            secondary: "mmcblk0".to_string(),
        }
    }
}

/// One partition of the primary layout, with its offset resolved.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionRecord {
    pub name: String,
    pub size: ByteSize,
    /// Absolute start on the device.
    pub offset: ByteSize,
    /// `true` when the entry carried `@OFFSET`, `false` when it was placed at
    /// the cursor.
    pub explicit_offset: bool,
}

impl PartitionRecord {
    /// One past the last byte of the partition.
    pub fn end(&self) -> u64 {
        self.offset.bytes().saturating_add(self.size.bytes())
    }

    /// The image file expected for this partition.
    pub fn image_file_name(&self) -> String {
        format!("{}.img", self.name)
    }
}

impl fmt::Display for PartitionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} size:{} ({}) offset:{} ({})",
            self.name,
            self.size.bytes(),
            self.size,
            self.offset.bytes(),
            self.offset
        )
    }
}

/// The result of parsing a descriptor.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Descriptor {
    /// Primary partitions, in descriptor order.
    pub records: Vec<PartitionRecord>,
    /// Secondary-tag lines, verbatim.
    pub passthrough: Vec<String>,
}

impl Descriptor {
    /// Parses every line of `text` with the default tags.
    pub fn parse(text: &str) -> Result<Self> {
        Self::parse_with(text, &TagConfig::default())
    }

    /// Parses every line of `text`.
    ///
    /// Fails on the first malformed entry; a descriptor is never partially
    /// interpreted.
    pub fn parse_with(text: &str, tags: &TagConfig) -> Result<Self> {
        let mut descriptor = Descriptor::default();
        let mut primary_seen = false;

        for line in text.lines() {
            let Some(caps) = LINE.captures(line) else {
                continue;
            };
            let tag = &caps[2];

            if tag == tags.primary {
                if primary_seen {
                    return Err(Error::DuplicateDeviceTag {
                        tag: tag.to_string(),
                    });
                }
                primary_seen = true;
                let list = caps.get(3).map(|m| m.as_str()).ok_or_else(|| {
                    Error::MalformedPartitionEntry {
                        entry: line.trim().to_string(),
                        reason: "missing partition list".to_string(),
                    }
                })?;
                descriptor.records = parse_partition_list(list)?;
            } else if tag == tags.secondary {
                descriptor.passthrough.push(line.to_string());
            } else {
                debug!("Ignoring descriptor line for unknown tag '{tag}'");
            }
        }

        if !primary_seen {
            return Err(Error::MissingPrimary {
                tag: tags.primary.clone(),
            });
        }

        warn_on_overlaps(&descriptor.records);
        Ok(descriptor)
    }

    /// The highest end offset over all records.
    pub fn layout_end(&self) -> u64 {
        self.records.iter().map(PartitionRecord::end).max().unwrap_or(0)
    }
}

/// Parses a comma-separated entry list such as `512K(boot),64M@1M(rootfs)`.
pub fn parse_partition_list(list: &str) -> Result<Vec<PartitionRecord>> {
    let mut records = Vec::new();
    let mut names = HashSet::new();
    let mut cursor = ByteSize::ZERO;

    for raw in list.split(',') {
        let entry = raw.trim();
        let (size, offset, name) = if let Some(caps) = EXPLICIT_ENTRY.captures(entry) {
            (
                parse_size(&caps[1])?,
                Some(parse_size(&caps[2])?),
                caps[3].to_string(),
            )
        } else if let Some(caps) = AUTO_ENTRY.captures(entry) {
            (parse_size(&caps[1])?, None, caps[2].to_string())
        } else {
            return Err(Error::MalformedPartitionEntry {
                entry: entry.to_string(),
                reason: "expected SIZE@OFFSET(NAME) or SIZE(NAME)".to_string(),
            });
        };

        if size == ByteSize::ZERO {
            return Err(Error::MalformedPartitionEntry {
                entry: entry.to_string(),
                reason: "partition size must be greater than zero".to_string(),
            });
        }
        if !names.insert(name.clone()) {
            return Err(Error::DuplicatePartition { name });
        }

        let record = PartitionRecord {
            name,
            size,
            offset: offset.unwrap_or(cursor),
            explicit_offset: offset.is_some(),
        };
        if record.offset.checked_add(record.size).is_none() {
            return Err(Error::MalformedPartitionEntry {
                entry: entry.to_string(),
                reason: "partition end does not fit in 64 bits".to_string(),
            });
        }

        cursor = cursor
            .checked_add(size)
            .ok_or_else(|| Error::MalformedPartitionEntry {
                entry: entry.to_string(),
                reason: "cumulative layout size does not fit in 64 bits".to_string(),
            })?;

        debug!("Parsed partition {record}");
        records.push(record);
    }

    Ok(records)
}

fn warn_on_overlaps(records: &[PartitionRecord]) {
    for (i, a) in records.iter().enumerate() {
        for b in &records[i + 1..] {
            if a.offset.bytes() < b.end() && b.offset.bytes() < a.end() {
                warn!("Partitions '{}' and '{}' overlap", a.name, b.name);
            }
        }
    }
}
