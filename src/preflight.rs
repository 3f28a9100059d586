//! Host-tool availability check.
//!
//! Verifies every external program the clone will invoke exists on PATH
//! before any device is touched, so a missing tool surfaces as one clear
//! error up front instead of a failure halfway through the sequence.

use anyhow::Result;

use crate::error::CloneError;

/// Tools every run needs.
const REQUIRED_TOOLS: &[&str] = &[
    "df", "lsblk", "mount", "umount", "rsync", "chroot", "sfdisk",
];

/// Tools only needed when the destination is addressed by UUID (it
/// always is) and may be LUKS-encrypted.
const DESTINATION_TOOLS: &[&str] = &["blkid", "cryptsetup"];

/// Check that all required host tools are installed.
pub fn check_host_tools() -> Result<()> {
    check_tools(REQUIRED_TOOLS.iter().chain(DESTINATION_TOOLS).copied())
}

fn check_tools<'a>(tools: impl IntoIterator<Item = &'a str>) -> Result<()> {
    let missing: Vec<&str> = tools
        .into_iter()
        .filter(|tool| which::which(tool).is_err())
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(CloneError::Config(format!(
            "required host tool(s) not found on PATH: {}",
            missing.join(", ")
        ))
        .into())
    }
}
