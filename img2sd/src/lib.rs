//! Terminal front-end pieces shared by the `img2sd` and `multiflash` binaries.
//!
//! Everything that talks to a human lives here: prompts, the device menu,
//! progress bars, logger setup, and Ctrl+C handling. The flashing itself is
//! done by `img2sd-core`.

pub mod args;
pub mod ui;
