//! A mounted, possibly LUKS-encrypted partition.
//!
//! One `FileSystem` instance models one partition involved in the clone:
//! it discovers the backing device and UUID, opens the LUKS mapping when
//! the partition is encrypted, mounts the filesystem onto a temporary
//! directory when no mount point was supplied, and registers every
//! teardown with the shared [`Cleaner`] as it acquires resources.

use anyhow::{Context, Result};
use rustix::process::umask;
use std::cell::Cell;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::blockdev;
use crate::cleanup::Cleaner;
use crate::error::CloneError;
use crate::process::Cmd;

/// Prefix for temp mount points, key files and mapper names.
const TEMPFILE_PREFIX: &str = "bootclone__";

/// Directories bind-mounted into the destination for chrooted calls.
pub const CHROOT_BINDS: &[&str] = &["proc", "sys", "dev"];

/// Construction arguments for [`FileSystem::new`]. Exactly one of
/// `mount_point` and `uuid` must be given.
#[derive(Debug, Default)]
pub struct FileSystemOptions {
    /// Mount point of an already-mounted filesystem (the live source).
    pub mount_point: Option<PathBuf>,
    /// UUID of a filesystem to decrypt/mount (the destination).
    pub uuid: Option<String>,
    /// Options passed through to `mount -o`.
    pub mount_options: Vec<String>,
    /// Literal LUKS passphrase.
    pub password: Option<String>,
    /// Path to a file holding the LUKS passphrase.
    pub password_file: Option<PathBuf>,
}

/// One mounted partition, decrypted if necessary.
pub struct FileSystem {
    partition_device: PathBuf,
    partition_uuid: String,
    fs_device: PathBuf,
    fs_uuid: String,
    mount_point: PathBuf,
    encrypted: bool,
    mapper_name: Option<String>,
    password_file: Option<PathBuf>,
    // Holds the generated key file open so it outlives the run.
    _password_tmp: Option<NamedTempFile>,
    chroot_prepared: Rc<Cell<bool>>,
    cleaner: Cleaner,
}

// Not derivable: the embedded Cleaner holds opaque teardown closures.
impl fmt::Debug for FileSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileSystem")
            .field("partition_device", &self.partition_device)
            .field("partition_uuid", &self.partition_uuid)
            .field("fs_device", &self.fs_device)
            .field("fs_uuid", &self.fs_uuid)
            .field("mount_point", &self.mount_point)
            .field("encrypted", &self.encrypted)
            .field("mapper_name", &self.mapper_name)
            .finish_non_exhaustive()
    }
}

impl FileSystem {
    /// Resolve, decrypt and mount a partition.
    ///
    /// Teardown jobs (close mapping, unmount, remove temp directory) are
    /// registered on `cleaner` in acquisition order, so the final unwind
    /// releases them in reverse.
    pub fn new(opts: FileSystemOptions, cleaner: &Cleaner) -> Result<FileSystem> {
        match (&opts.mount_point, &opts.uuid) {
            (Some(_), Some(_)) | (None, None) => {
                return Err(CloneError::Config(
                    "exactly one of a mount point and a UUID must be given".into(),
                )
                .into());
            }
            _ => {}
        }
        if opts.password.is_some() && opts.password_file.is_some() {
            return Err(CloneError::Config(
                "--password and --password-file are mutually exclusive".into(),
            )
            .into());
        }

        let cleaner = cleaner.clone();

        debug!("resolving partition device");
        let (partition_device, partition_uuid) = match (&opts.mount_point, &opts.uuid) {
            (Some(mount_point), None) => {
                let device = blockdev::device_for_mount_point(mount_point)?;
                let uuid = blockdev::filesystem_uuid(&device)?;
                (device, uuid)
            }
            (None, Some(uuid)) => {
                if uuid.len() != blockdev::UUID_LEN {
                    return Err(CloneError::Config(format!(
                        "'{uuid}' is not a canonical {}-character UUID",
                        blockdev::UUID_LEN
                    ))
                    .into());
                }
                let device = blockdev::device_for_uuid(uuid)?;
                (device, uuid.clone())
            }
            _ => unreachable!("validated above"),
        };
        info!(
            "partition: {} ({})",
            partition_device.display(),
            partition_uuid
        );

        let encrypted = blockdev::is_luks(&partition_device)?;
        debug!("partition is LUKS-encrypted: {encrypted}");

        let mut mapper_name = None;
        let mut password_file = opts.password_file.clone();
        let mut password_tmp = None;

        let (fs_device, fs_uuid) = if encrypted {
            let key_file = match (&opts.password, &opts.password_file) {
                (Some(password), None) => {
                    let tmp = write_key_file(password, &cleaner)?;
                    let path = tmp.path().to_path_buf();
                    password_tmp = Some(tmp);
                    password_file = Some(path.clone());
                    path
                }
                (None, Some(file)) => file.clone(),
                (None, None) => {
                    return Err(CloneError::MissingPassword {
                        device: partition_device,
                    }
                    .into());
                }
                (Some(_), Some(_)) => unreachable!("validated above"),
            };

            let name = format!("{TEMPFILE_PREFIX}{partition_uuid}");
            open_luks_mapping(&partition_device, &name, &key_file, &cleaner)?;

            let mapper_device = PathBuf::from(format!("/dev/mapper/{name}"));
            let uuid = blockdev::filesystem_uuid(&mapper_device)?;
            mapper_name = Some(name);
            (mapper_device, uuid)
        } else {
            if opts.password.is_some() || opts.password_file.is_some() {
                return Err(CloneError::PasswordNotNeeded {
                    device: partition_device,
                }
                .into());
            }
            (partition_device.clone(), partition_uuid.clone())
        };

        let mount_point = match &opts.mount_point {
            Some(mount_point) => mount_point.clone(),
            None => mount_filesystem(&fs_device, &opts.mount_options, &cleaner)?,
        };

        Ok(FileSystem {
            partition_device,
            partition_uuid,
            fs_device,
            fs_uuid,
            mount_point,
            encrypted,
            mapper_name,
            password_file,
            _password_tmp: password_tmp,
            chroot_prepared: Rc::new(Cell::new(false)),
            cleaner,
        })
    }

    /// Device path of the raw partition, e.g. `/dev/sdb1`.
    pub fn partition_device(&self) -> &Path {
        &self.partition_device
    }

    /// UUID of the raw partition.
    pub fn partition_uuid(&self) -> &str {
        &self.partition_uuid
    }

    /// Device holding the filesystem: the partition itself, or the
    /// decrypted mapper device for a LUKS partition.
    pub fn fs_device(&self) -> &Path {
        &self.fs_device
    }

    /// UUID of the (decrypted) filesystem.
    pub fn fs_uuid(&self) -> &str {
        &self.fs_uuid
    }

    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    /// Mapper name of the opened LUKS mapping, if any.
    pub fn mapper_name(&self) -> Option<&str> {
        self.mapper_name.as_deref()
    }

    /// Path of the passphrase file in use, if any.
    pub fn password_file(&self) -> Option<&Path> {
        self.password_file.as_deref()
    }

    /// Join path segments under the mount point. Leading separators are
    /// stripped from each segment, so absolute-looking inputs like
    /// `/etc/fstab` stay inside the mount point.
    pub fn path<I, S>(&self, segments: I) -> PathBuf
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        join_under(&self.mount_point, segments)
    }

    /// Trailing numeric partition index of the raw partition device.
    pub fn partition_number(&self) -> Result<String> {
        blockdev::partition_number(&self.partition_device)
    }

    /// Whole-disk device holding the raw partition.
    pub fn whole_disk_device(&self) -> Result<PathBuf> {
        blockdev::whole_disk(&self.partition_device)
    }

    /// Bind-mount /proc, /sys and /dev from `source` into this
    /// filesystem so bootloader tools can run chrooted. One unmount job
    /// per bind is registered, plus a job resetting the prepared flag.
    pub fn prepare_chroot(&self, source: &FileSystem) -> Result<()> {
        if self.chroot_prepared.get() {
            return Err(CloneError::Invariant(
                "prepare_chroot called twice without teardown".into(),
            )
            .into());
        }

        // Registered before the binds, so the flag clears only after
        // every bind has been unmounted during the unwind.
        let prepared = self.chroot_prepared.clone();
        self.cleaner.push("reset chroot-prepared flag", move || {
            prepared.set(false);
            Ok(())
        });

        for bind in CHROOT_BINDS {
            let source_path = source.path([*bind]);
            let target_path = self.path([*bind]);
            debug!(
                "bind-mounting {} -> {}",
                source_path.display(),
                target_path.display()
            );
            Cmd::new("mount")
                .arg("--bind")
                .arg_path(&source_path)
                .arg_path(&target_path)
                .run()?;

            let what = format!("unmount bind {}", target_path.display());
            self.cleaner.push(what, move || {
                Cmd::new("umount").arg("--lazy").arg_path(&target_path).run()?;
                Ok(())
            });
        }

        self.chroot_prepared.set(true);
        Ok(())
    }

    /// Run a command with the process root switched to this mount point.
    pub fn run_chrooted<I, S>(&self, args: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if !self.chroot_prepared.get() {
            return Err(CloneError::Invariant(
                "run_chrooted requires prepare_chroot first".into(),
            )
            .into());
        }
        Cmd::new("chroot")
            .arg_path(&self.mount_point)
            .args(args)
            .run()?;
        Ok(())
    }
}

/// Join segments under `root`, treating each as relative.
fn join_under<I, S>(root: &Path, segments: I) -> PathBuf
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut path = root.to_path_buf();
    for segment in segments {
        path.push(segment.as_ref().trim_start_matches('/'));
    }
    path
}

/// Write a passphrase to a fresh 0600 temp file. The umask is tightened
/// while the file is created and restored immediately afterwards via a
/// single-job early drain, not during the final unwind.
fn write_key_file(password: &str, cleaner: &Cleaner) -> Result<NamedTempFile> {
    let old_mask = umask(rustix::fs::Mode::from_raw_mode(0o077));
    cleaner.push("restore process umask", move || {
        umask(old_mask);
        Ok(())
    });

    let result = (|| -> Result<NamedTempFile> {
        let mut file = tempfile::Builder::new()
            .prefix(TEMPFILE_PREFIX)
            .suffix("__key")
            .tempfile()
            .context("creating passphrase file")?;
        // No trailing newline: cryptsetup reads key files verbatim.
        file.write_all(password.as_bytes())?;
        file.flush()?;
        Ok(file)
    })();

    cleaner.drain_one()?;
    result
}

/// Open the LUKS mapping under a deterministic name and register the
/// close job. cryptsetup reports a rejected passphrase with exit code 2.
fn open_luks_mapping(
    partition_device: &Path,
    name: &str,
    key_file: &Path,
    cleaner: &Cleaner,
) -> Result<()> {
    info!("opening LUKS mapping '{name}'");
    let result = Cmd::new("cryptsetup")
        .arg("open")
        .arg("--key-file")
        .arg_path(key_file)
        .arg_path(partition_device)
        .arg(name)
        .allow_fail()
        .run()?;

    if !result.success() {
        if result.code() == 2 {
            return Err(CloneError::WrongPassphrase {
                device: partition_device.to_path_buf(),
            }
            .into());
        }
        return Err(CloneError::Command {
            program: "cryptsetup".into(),
            code: result.code(),
            detail: result.stderr.trim().to_string(),
        }
        .into());
    }

    let name = name.to_string();
    cleaner.push(format!("close LUKS mapping '{name}'"), move || {
        Cmd::new("cryptsetup").arg("close").arg(&name).run()?;
        Ok(())
    });
    Ok(())
}

/// Mount a filesystem onto a fresh temporary directory and register the
/// unmount and directory-removal jobs.
fn mount_filesystem(
    fs_device: &Path,
    mount_options: &[String],
    cleaner: &Cleaner,
) -> Result<PathBuf> {
    let mount_point = tempfile::Builder::new()
        .prefix(TEMPFILE_PREFIX)
        .suffix("__mount")
        .tempdir()
        .context("creating temporary mount point")?
        .keep();

    // Pushed before the mount succeeds: during unwind the directory is
    // removed right after the unmount job above it has run.
    let dir = mount_point.clone();
    cleaner.push(format!("remove {}", dir.display()), move || {
        fs::remove_dir(&dir)?;
        Ok(())
    });

    info!("mounting to '{}'", mount_point.display());
    let mut cmd = Cmd::new("mount");
    if !mount_options.is_empty() {
        cmd = cmd.arg("-o").arg(mount_options.join(","));
    }
    cmd.arg_path(fs_device)
        .arg_path(&mount_point)
        .error_msg("mounting the target filesystem failed")
        .run()?;

    let dir = mount_point.clone();
    cleaner.push(format!("unmount {}", dir.display()), move || {
        Cmd::new("umount").arg("--lazy").arg_path(&dir).run()?;
        Ok(())
    });

    Ok(mount_point)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_construction_requires_exactly_one_origin() {
        let cleaner = Cleaner::new();

        let both = FileSystemOptions {
            mount_point: Some(PathBuf::from("/")),
            uuid: Some("11111111-1111-1111-1111-111111111111".into()),
            ..Default::default()
        };
        let err = FileSystem::new(both, &cleaner).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CloneError>(),
            Some(CloneError::Config(_))
        ));

        let neither = FileSystemOptions::default();
        let err = FileSystem::new(neither, &cleaner).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CloneError>(),
            Some(CloneError::Config(_))
        ));

        // Rejected before any resource was acquired.
        assert!(cleaner.is_empty());
    }

    #[test]
    fn test_password_and_password_file_are_mutually_exclusive() {
        let cleaner = Cleaner::new();
        let opts = FileSystemOptions {
            uuid: Some("11111111-1111-1111-1111-111111111111".into()),
            password: Some("secret".into()),
            password_file: Some(PathBuf::from("/root/key")),
            ..Default::default()
        };
        let err = FileSystem::new(opts, &cleaner).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CloneError>(),
            Some(CloneError::Config(_))
        ));
    }

    #[test]
    fn test_non_canonical_uuid_rejected() {
        let cleaner = Cleaner::new();
        let opts = FileSystemOptions {
            uuid: Some("not-a-uuid".into()),
            ..Default::default()
        };
        let err = FileSystem::new(opts, &cleaner).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CloneError>(),
            Some(CloneError::Config(_))
        ));
    }

    #[test]
    fn test_join_under_strips_leading_separators() {
        let root = Path::new("/mnt/backup");
        assert_eq!(join_under(root, ["/proc"]), join_under(root, ["proc"]));
        assert_eq!(
            join_under(root, ["/etc/fstab"]),
            PathBuf::from("/mnt/backup/etc/fstab")
        );
        assert_eq!(
            join_under(root, ["etc", "/default/grub"]),
            PathBuf::from("/mnt/backup/etc/default/grub")
        );
    }

    #[test]
    fn test_write_key_file_is_private_and_verbatim() {
        let cleaner = Cleaner::new();
        let file = write_key_file("hunter2", &cleaner).unwrap();

        let content = fs::read_to_string(file.path()).unwrap();
        assert_eq!(content, "hunter2");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(file.path()).unwrap().permissions().mode();
            assert_eq!(mode & 0o077, 0);
        }

        // The umask-restore job was drained immediately.
        assert!(cleaner.is_empty());
    }
}
