//! Capabilities the core asks the front-end for: confirmation of destructive
//! steps and the choice of a target device.
//!
//! The core never talks to a terminal itself. Front-ends implement these traits
//! with whatever UI they have; the implementations here are the headless ones.
use crate::device::Device;
use crate::error::{Error, Result};

/// Asks the operator to confirm a destructive step.
///
/// Implementations must require an explicit affirmative answer (typing
/// `yes`), never a bare default.
pub trait Confirm {
    fn confirm(&self, prompt: &str) -> Result<bool>;
}

/// Fails closed: every confirmation is declined.
#[derive(Clone, Copy, Debug, Default)]
pub struct Refuse;

impl Confirm for Refuse {
    fn confirm(&self, prompt: &str) -> Result<bool> {
        log::warn!("{prompt}: declined (non-interactive)");
        Ok(false)
    }
}

/// Accepts every confirmation. Only for an explicit operator override.
#[derive(Clone, Copy, Debug, Default)]
pub struct Assume;

impl Confirm for Assume {
    fn confirm(&self, prompt: &str) -> Result<bool> {
        log::warn!("{prompt}: accepted by override");
        Ok(true)
    }
}

/// Picks the device to flash from a list of candidates.
pub trait Chooser {
    /// Returns `None` when the operator backs out.
    fn choose(&self, candidates: &[Device]) -> Result<Option<Device>>;
}

/// Headless chooser: picks the only candidate and refuses to guess between
/// several.
#[derive(Clone, Copy, Debug, Default)]
pub struct FirstIfUnique;

impl Chooser for FirstIfUnique {
    fn choose(&self, candidates: &[Device]) -> Result<Option<Device>> {
        match candidates {
            [] => Ok(None),
            [only] => Ok(Some(only.clone())),
            many => Err(Error::DeviceValidationFailed {
                device: many[0].path.clone(),
                reason: format!("{} removable devices found; pick one explicitly", many.len()),
            }),
        }
    }
}
