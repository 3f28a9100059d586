//! Shared test utilities for bootclone integration tests.
//!
//! Builds fake external binaries (df, lsblk, blkid, cryptsetup, mount,
//! umount, chroot, ...) in a temporary directory and prepends it to
//! PATH, so FileSystem construction and teardown can be exercised
//! without root or real block devices. Every fake logs its invocation
//! to a shared file, letting tests assert what ran and in which order.
//!
//! PATH is process-global: every test using this harness must be marked
//! `#[serial]`.

use std::env;
use std::ffi::OsString;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

/// A directory of fake tools prepended to PATH for the test's lifetime.
pub struct FakeTools {
    dir: TempDir,
    log: PathBuf,
    saved_path: OsString,
}

impl FakeTools {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("creating fake tool dir");
        let log = dir.path().join("invocations.log");
        fs::write(&log, "").expect("creating invocation log");

        let saved_path = env::var_os("PATH").unwrap_or_default();
        let mut paths = vec![dir.path().to_path_buf()];
        paths.extend(env::split_paths(&saved_path));
        env::set_var("PATH", env::join_paths(paths).expect("joining PATH"));

        Self {
            dir,
            log,
            saved_path,
        }
    }

    /// Install a fake tool. It logs `NAME ARGS...` to the shared log and
    /// then runs `body` (default: exit 0).
    pub fn stub(&self, name: &str, body: &str) {
        let script = format!(
            "#!/bin/sh\necho \"{name} $*\" >> \"{}\"\n{body}\n",
            self.log.display()
        );
        let path = self.dir.path().join(name);
        fs::write(&path, script).expect("writing fake tool");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
                .expect("marking fake tool executable");
        }
    }

    /// Every invocation logged so far, one `NAME ARGS...` line each.
    pub fn invocations(&self) -> Vec<String> {
        fs::read_to_string(&self.log)
            .expect("reading invocation log")
            .lines()
            .map(str::to_string)
            .collect()
    }

    /// Index of the first invocation of `tool`, if any ran.
    pub fn first_invocation_of(&self, tool: &str) -> Option<usize> {
        self.invocations()
            .iter()
            .position(|line| line.starts_with(&format!("{tool} ")) || line == tool)
    }

    pub fn ran(&self, tool: &str) -> bool {
        self.first_invocation_of(tool).is_some()
    }
}

impl Drop for FakeTools {
    fn drop(&mut self) {
        env::set_var("PATH", &self.saved_path);
    }
}
