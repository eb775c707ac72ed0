//! Command-line options common to both binaries.
use anyhow::{Context, Result, bail};
use clap::Args;
use img2sd_core::descriptor::{Descriptor, TagConfig};
use img2sd_core::envfile::EnvBackup;
use img2sd_core::session::FlashPolicy;
use img2sd_core::size::ByteSize;
use img2sd_core::verify::{Verifier, VerifySpan};
use std::fs;
use std::path::PathBuf;

/// Where the layout and images come from, and how they are verified.
#[derive(Args, Debug, Clone)]
pub struct LayoutArgs {
    /// Environment file holding the partition descriptor
    #[arg(short = 'e', long = "env", default_value = ".env.txt", env = "IMG2SD_ENV")]
    pub env_file: PathBuf,

    /// Directory containing the <partition>.img files
    #[arg(short = 'd', long = "images", default_value = ".", env = "IMG2SD_IMAGES")]
    pub image_dir: PathBuf,

    /// Descriptor tag of the card being flashed
    #[arg(long, default_value = "mmcblk1")]
    pub primary_tag: String,

    /// Descriptor tag whose lines are passed through untouched
    #[arg(long, default_value = "mmcblk0")]
    pub secondary_tag: String,

    /// Skip write verification
    #[arg(short = 'n', long = "no-verify")]
    pub no_verify: bool,

    /// Images larger than this are verified by sampling instead of a full checksum
    #[arg(long, default_value = "64M")]
    pub sample_threshold: ByteSize,

    /// Size of each verification sample
    #[arg(long, default_value = "1M", value_parser = parse_sample_size)]
    pub sample_size: ByteSize,

    /// Checksum the whole partition, padding included, instead of just the image
    #[arg(long)]
    pub verify_partition: bool,

    /// Write to block devices that are not flagged removable without asking
    #[arg(long)]
    pub allow_non_removable: bool,
}

fn parse_sample_size(token: &str) -> Result<ByteSize> {
    let size: ByteSize = token.parse()?;
    if size == ByteSize::ZERO {
        bail!("sample size must be at least 1 byte");
    }
    Ok(size)
}

impl LayoutArgs {
    pub fn tags(&self) -> TagConfig {
        TagConfig {
            primary: self.primary_tag.clone(),
            secondary: self.secondary_tag.clone(),
        }
    }

    pub fn policy(&self) -> FlashPolicy {
        FlashPolicy {
            verify: !self.no_verify,
            verifier: Verifier {
                sample_threshold: self.sample_threshold,
                sample_size: self.sample_size,
            },
            verify_span: if self.verify_partition {
                VerifySpan::Partition
            } else {
                VerifySpan::Image
            },
            allow_non_removable: self.allow_non_removable,
        }
    }

    /// Backs up the environment file and parses it.
    ///
    /// The returned guard restores the file when dropped.
    pub fn load(&self) -> Result<(EnvBackup, Descriptor)> {
        let guard = EnvBackup::acquire(&self.env_file)
            .with_context(|| format!("Cannot open '{}'", self.env_file.display()))?;
        let text = fs::read_to_string(&self.env_file)?;
        let descriptor = Descriptor::parse_with(&text, &self.tags())
            .with_context(|| format!("Invalid descriptor in '{}'", self.env_file.display()))?;
        Ok((guard, descriptor))
    }

    /// Fails if any partition image is missing.
    pub fn check_images(&self, descriptor: &Descriptor) -> Result<()> {
        let missing: Vec<String> = descriptor
            .records
            .iter()
            .map(|r| r.image_file_name())
            .filter(|name| !self.image_dir.join(name).is_file())
            .collect();
        if !missing.is_empty() {
            bail!(
                "Missing images in '{}': {}",
                self.image_dir.display(),
                missing.join(", ")
            );
        }
        Ok(())
    }
}
