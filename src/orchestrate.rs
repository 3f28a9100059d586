//! The clone sequence.
//!
//! Sequences partition resolution, data transfer, fstab/bootloader
//! repair and bootloader installation on top of the FileSystem and
//! Cleaner primitives. Aborts on the first failure; the caller drains
//! the cleanup stack unconditionally, so every step may assume prior
//! steps succeeded and never unwinds anything itself.

use anyhow::Result;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::blockdev;
use crate::cleanup::Cleaner;
use crate::diff;
use crate::error::CloneError;
use crate::filesystem::{FileSystem, FileSystemOptions};
use crate::preflight;
use crate::process::Cmd;
use crate::repair;

/// Fixed rsync transfer mode: archive the whole source filesystem in
/// place, never crossing filesystem boundaries.
const RSYNC_MODE_OPTS: &[&str] = &[
    "--archive",
    "--verbose",
    "--delete-during",
    "--one-file-system",
    "--inplace",
];

/// Pseudo and volatile trees never worth copying.
const RSYNC_EXCLUDES: &[&str] = &[
    "--exclude=/proc/*",
    "--exclude=/dev/*",
    "--exclude=/tmp/*",
    "--exclude=/sys/*",
    "--exclude=/run/*",
    "--exclude=/var/cache/*",
    "--exclude=/var/lock/*",
    "--exclude=/var/log/*",
    "--exclude=/var/mail/*",
    "--exclude=/var/spool/*",
];

/// Everything the CLI collects for one run.
#[derive(Debug, Default)]
pub struct CloneOptions {
    /// UUID of the filesystem to clone onto.
    pub dest_uuid: String,
    /// Options passed through to the destination mount.
    pub mount_options: Vec<String>,
    /// Extra options passed through to rsync.
    pub rsync_options: Vec<String>,
    /// Additional rsync include patterns.
    pub includes: Vec<String>,
    /// Additional rsync exclude patterns.
    pub excludes: Vec<String>,
    /// Additional source paths copied beyond the root.
    pub extra_sources: Vec<PathBuf>,
    /// Literal LUKS passphrase for the destination.
    pub password: Option<String>,
    /// File holding the LUKS passphrase for the destination.
    pub password_file: Option<PathBuf>,
}

/// Run the whole clone. Teardown jobs accumulate on `cleaner`; the
/// caller drains them whether this returns Ok or Err.
pub fn run(opts: &CloneOptions, cleaner: &Cleaner) -> Result<()> {
    preflight::check_host_tools()?;

    // First job registered, therefore the last to run: disks are synced
    // only after every mount point and mapping has been released.
    cleaner.push("sync disks", || {
        rustix::fs::sync();
        Ok(())
    });

    debug!("determining source partition");
    let source = FileSystem::new(
        FileSystemOptions {
            mount_point: Some(PathBuf::from("/")),
            ..Default::default()
        },
        cleaner,
    )?;
    info!(
        "source partition: {} ({})",
        source.partition_device().display(),
        source.partition_uuid()
    );

    debug!("resolving and mounting target filesystem");
    let dest = FileSystem::new(
        FileSystemOptions {
            uuid: Some(opts.dest_uuid.clone()),
            mount_options: opts.mount_options.clone(),
            password: opts.password.clone(),
            password_file: opts.password_file.clone(),
            ..Default::default()
        },
        cleaner,
    )?;
    info!(
        "target partition: {} mounted at '{}'",
        dest.partition_device().display(),
        dest.mount_point().display()
    );

    debug!("checking whether the bootloader configuration needs regeneration");
    let update_grub = diff::dirs_differ(&source.path(["boot"]), &dest.path(["boot"]))?;
    info!("bootloader configuration needs regeneration: {update_grub}");

    info!(
        "copying contents of '{}' to '{}'",
        source.mount_point().display(),
        dest.mount_point().display()
    );
    let args = rsync_args(source.mount_point(), dest.mount_point(), opts);
    Cmd::new("rsync")
        .args(args.iter().map(String::as_str))
        .error_msg("data transfer failed")
        .run()?;

    debug!("preparing destination chroot");
    dest.prepare_chroot(&source)?;

    info!("updating fstab on the destination");
    rewrite_fstab(&source, &dest)?;

    info!("stripping resume= from the destination bootloader defaults");
    repair::rewrite_file(&dest.path(["etc/default/grub"]), repair::strip_resume_option)?;

    if dest.is_encrypted() {
        configure_encrypted_boot(&dest)?;
    }

    ensure_bootable_flag(&dest)?;

    if update_grub {
        info!("regenerating bootloader configuration on the destination");
        dest.run_chrooted(["update-grub"])?;
    }

    install_bootloader_if_missing(&dest)?;

    Ok(())
}

/// Full rsync argument vector for the transfer.
///
/// Caller-supplied include/exclude patterns come before the built-in
/// exclude set; rsync's first matching filter wins, so user patterns
/// take precedence.
fn rsync_args(source_root: &Path, dest_root: &Path, opts: &CloneOptions) -> Vec<String> {
    let mut args: Vec<String> = RSYNC_MODE_OPTS.iter().map(|s| s.to_string()).collect();
    args.extend(opts.includes.iter().map(|p| format!("--include={p}")));
    args.extend(opts.excludes.iter().map(|p| format!("--exclude={p}")));
    args.extend(RSYNC_EXCLUDES.iter().map(|s| s.to_string()));
    args.extend(opts.rsync_options.iter().cloned());
    args.push(with_trailing_slash(source_root));
    args.extend(
        opts.extra_sources
            .iter()
            .map(|p| p.to_string_lossy().into_owned()),
    );
    args.push(dest_root.to_string_lossy().into_owned());
    args
}

/// A trailing separator makes rsync copy the directory's contents
/// rather than the directory itself.
fn with_trailing_slash(path: &Path) -> String {
    let mut s = path.to_string_lossy().into_owned();
    if !s.ends_with('/') {
        s.push('/');
    }
    s
}

/// Substitute the source's filesystem device path and UUID with the
/// destination's in the destination fstab.
fn rewrite_fstab(source: &FileSystem, dest: &FileSystem) -> Result<()> {
    let src_device = source.fs_device().to_string_lossy().into_owned();
    let dest_device = dest.fs_device().to_string_lossy().into_owned();
    debug!("replacing any '{src_device}' with '{dest_device}'");
    debug!(
        "replacing any '{}' with '{}'",
        source.fs_uuid(),
        dest.fs_uuid()
    );
    repair::rewrite_file(&dest.path(["etc/fstab"]), |content| {
        repair::substitute(
            content,
            &[
                (src_device.as_str(), dest_device.as_str()),
                (source.fs_uuid(), dest.fs_uuid()),
            ],
        )
    })
}

/// Everything an encrypted destination needs to unlock itself at boot:
/// crypttab entry, kernel cmdline fragment, the bootloader crypto-disk
/// flag, cryptsetup in the initramfs, and a fresh initramfs.
fn configure_encrypted_boot(dest: &FileSystem) -> Result<()> {
    let mapper_name = dest.mapper_name().ok_or_else(|| {
        CloneError::Invariant("encrypted destination without a mapper name".into())
    })?;
    let key_file = dest.password_file().ok_or_else(|| {
        CloneError::Invariant("encrypted destination without a password file".into())
    })?;

    info!("adding crypttab entry on the destination");
    let entry = repair::crypttab_entry(mapper_name, dest.partition_uuid(), key_file);
    repair::append_line_to_file(&dest.path(["etc/crypttab"]), &entry)?;

    info!("enabling encrypted boot in the bootloader defaults");
    let cryptopts = format!("cryptopts=source=UUID={}", dest.partition_uuid());
    repair::rewrite_file(&dest.path(["etc/default/grub"]), |content| {
        repair::enable_cryptodisk(&repair::add_cmdline_option(content, &cryptopts))
    })?;

    info!("enabling cryptsetup in the initramfs hook configuration");
    repair::rewrite_file(
        &dest.path(["etc/cryptsetup-initramfs/conf-hook"]),
        repair::enable_initramfs_cryptsetup,
    )?;

    info!("regenerating the destination initramfs");
    dest.run_chrooted(["update-initramfs", "-u"])?;
    Ok(())
}

/// Set the bootable flag on the destination partition unless it is
/// already set. Probe before set keeps the step idempotent.
fn ensure_bootable_flag(dest: &FileSystem) -> Result<()> {
    let disk = dest.whole_disk_device()?;
    debug!(
        "checking bootable flag on {}",
        dest.partition_device().display()
    );
    if blockdev::bootable_flag_is_set(&disk, dest.partition_device())? {
        debug!("bootable flag already set");
        return Ok(());
    }
    info!(
        "setting bootable flag on {}",
        dest.partition_device().display()
    );
    blockdev::set_bootable_flag(&disk, &dest.partition_number()?)
}

/// Install the bootloader onto the destination's whole disk unless its
/// boot sector already carries the GRUB signature.
fn install_bootloader_if_missing(dest: &FileSystem) -> Result<()> {
    let disk = dest.whole_disk_device()?;
    if blockdev::grub_is_installed(&disk)? {
        info!("bootloader already installed on {}", disk.display());
        return Ok(());
    }
    info!("installing bootloader on {}", disk.display());
    let disk_arg = disk.to_string_lossy();
    dest.run_chrooted(["grub-install", disk_arg.as_ref()])
}
