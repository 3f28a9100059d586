//! Block-device discovery and probing.
//!
//! Thin wrappers around df/lsblk/blkid/cryptsetup/sfdisk plus the pure
//! parsing they need. Parse failures on output we expect to understand
//! are invariant violations, not user errors.

use anyhow::{Context, Result};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::error::CloneError;
use crate::process::Cmd;

/// Length of a canonical filesystem UUID (8-4-4-4-12).
pub const UUID_LEN: usize = 36;

/// Bytes of the boot sector inspected for a bootloader signature.
const BOOT_SECTOR_LEN: usize = 512;

/// Resolve the device backing a mount point via the mount table.
pub fn device_for_mount_point(mount_point: &Path) -> Result<PathBuf> {
    let result = Cmd::new("df")
        .args(["--no-sync", "--output=source"])
        .arg_path(mount_point)
        .capture_stdout()
        .run()?;
    let device = parse_df_source(&result.stdout).ok_or_else(|| {
        CloneError::Invariant(format!(
            "df did not report a /dev/ source for '{}'",
            mount_point.display()
        ))
    })?;
    Ok(PathBuf::from(device))
}

/// First line of `df --output=source` output naming a real device.
fn parse_df_source(output: &str) -> Option<String> {
    output
        .lines()
        .map(str::trim)
        .find(|line| line.starts_with("/dev/"))
        .map(str::to_string)
}

/// Look up the filesystem UUID of a block device.
pub fn filesystem_uuid(device: &Path) -> Result<String> {
    let result = Cmd::new("lsblk")
        .args(["--noheadings", "--output", "UUID"])
        .arg_path(device)
        .capture_stdout()
        .run()?;
    let uuid = result.stdout_trimmed().to_string();
    if uuid.len() != UUID_LEN {
        return Err(CloneError::Invariant(format!(
            "lsblk reported no canonical UUID for '{}' (got '{uuid}')",
            device.display()
        ))
        .into());
    }
    Ok(uuid)
}

/// Look up a block device in the by-UUID index.
pub fn device_for_uuid(uuid: &str) -> Result<PathBuf> {
    let result = Cmd::new("blkid")
        .args(["--uuid", uuid])
        .capture_stdout()
        .error_msg(format!("no block device with UUID {uuid}"))
        .run()?;
    let device = result.stdout_trimmed();
    if device.is_empty() {
        return Err(CloneError::Invariant(format!(
            "blkid resolved UUID {uuid} to an empty device path"
        ))
        .into());
    }
    Ok(PathBuf::from(device))
}

/// Probe whether a raw partition carries a LUKS signature.
pub fn is_luks(device: &Path) -> Result<bool> {
    let result = Cmd::new("cryptsetup")
        .arg("isLuks")
        .arg_path(device)
        .allow_fail()
        .run()?;
    Ok(result.success())
}

/// Extract the trailing numeric partition index from a partition device
/// path, e.g. `/dev/sdb1` -> `1`.
pub fn partition_number(partition_device: &Path) -> Result<String> {
    let name = partition_device.to_string_lossy();
    let digits: String = name
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    if digits.is_empty() {
        return Err(CloneError::Invariant(format!(
            "partition device '{name}' has no trailing partition number"
        ))
        .into());
    }
    Ok(digits)
}

/// Strip the trailing partition index to get the whole-disk device,
/// e.g. `/dev/sdb1` -> `/dev/sdb`. Names whose disk part itself ends in
/// a digit carry a `p` separator (`/dev/nvme0n1p2`, `/dev/mmcblk0p1`);
/// the separator is stripped along with the index.
pub fn whole_disk(partition_device: &Path) -> Result<PathBuf> {
    let name = partition_device.to_string_lossy();
    let number = partition_number(partition_device)?;
    let mut disk = &name[..name.len() - number.len()];
    if disk.ends_with('p') && disk[..disk.len() - 1].ends_with(|c: char| c.is_ascii_digit()) {
        disk = &disk[..disk.len() - 1];
    }
    if !disk.starts_with("/dev/") {
        return Err(CloneError::Invariant(format!(
            "'{disk}' is not a /dev/ disk device"
        ))
        .into());
    }
    Ok(PathBuf::from(disk))
}

/// Check whether GRUB is already installed on a disk by inspecting the
/// boot sector for its ASCII signature.
pub fn grub_is_installed(disk_device: &Path) -> Result<bool> {
    let mut file = File::open(disk_device)
        .with_context(|| format!("opening '{}' for boot-sector probe", disk_device.display()))?;
    let mut sector = [0u8; BOOT_SECTOR_LEN];
    let mut filled = 0;
    while filled < sector.len() {
        let n = file.read(&mut sector[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(contains_grub_signature(&sector[..filled]))
}

fn contains_grub_signature(sector: &[u8]) -> bool {
    sector.windows(4).any(|w| w == b"GRUB")
}

/// Check whether the bootable flag is set on the given partition.
pub fn bootable_flag_is_set(disk_device: &Path, partition_device: &Path) -> Result<bool> {
    let result = Cmd::new("sfdisk")
        .arg("--activate")
        .arg_path(disk_device)
        .capture_stdout()
        .error_msg("bootable-flag probe failed")
        .run()?;
    Ok(lists_partition(&result.stdout, partition_device))
}

/// `sfdisk --activate DISK` lists the partitions with the flag set.
fn lists_partition(sfdisk_output: &str, partition_device: &Path) -> bool {
    let partition = partition_device.to_string_lossy();
    sfdisk_output
        .lines()
        .any(|line| line.trim() == partition.as_ref())
}

/// Set the bootable flag on one partition of a disk.
pub fn set_bootable_flag(disk_device: &Path, partition_number: &str) -> Result<()> {
    Cmd::new("sfdisk")
        .arg("--activate")
        .arg_path(disk_device)
        .arg(partition_number)
        .error_msg("setting bootable flag failed")
        .run()?;
    Ok(())
}
