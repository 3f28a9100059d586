//! Recursive directory-tree comparison.
//!
//! Used to decide whether the destination's bootloader configuration
//! must be regenerated: any difference between the two boot directories
//! counts, as does one side missing while the other exists.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// What we compare per directory entry.
#[derive(Debug, PartialEq, Eq)]
enum Entry {
    Dir,
    Symlink(PathBuf),
    File { sha256: [u8; 32] },
}

/// Returns true when the two directory trees differ in structure or
/// content, or when exactly one of them exists.
pub fn dirs_differ(a: &Path, b: &Path) -> Result<bool> {
    if a.is_dir() != b.is_dir() {
        return Ok(true);
    }
    if !a.is_dir() {
        return Ok(false);
    }
    Ok(snapshot(a)? != snapshot(b)?)
}

/// Collect relative path -> entry content for a tree.
fn snapshot(root: &Path) -> Result<BTreeMap<PathBuf, Entry>> {
    let mut entries = BTreeMap::new();

    for item in WalkDir::new(root).min_depth(1) {
        let item = item.with_context(|| format!("walking '{}'", root.display()))?;
        let relative = item
            .path()
            .strip_prefix(root)
            .expect("walkdir yields paths under its root")
            .to_path_buf();

        let file_type = item.file_type();
        let entry = if file_type.is_symlink() {
            Entry::Symlink(fs::read_link(item.path())?)
        } else if file_type.is_dir() {
            Entry::Dir
        } else {
            Entry::File {
                sha256: hash_file(item.path())?,
            }
        };
        entries.insert(relative, entry);
    }

    Ok(entries)
}

fn hash_file(path: &Path) -> Result<[u8; 32]> {
    let mut file =
        fs::File::open(path).with_context(|| format!("reading '{}'", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tree(files: &[(&str, &str)]) -> TempDir {
        let dir = TempDir::new().unwrap();
        for (path, content) in files {
            let full = dir.path().join(path);
            fs::create_dir_all(full.parent().unwrap()).unwrap();
            fs::write(full, content).unwrap();
        }
        dir
    }

    #[test]
    fn test_equal_trees_do_not_differ() {
        let a = tree(&[("vmlinuz", "kernel"), ("grub/grub.cfg", "menu")]);
        let b = tree(&[("vmlinuz", "kernel"), ("grub/grub.cfg", "menu")]);
        assert!(!dirs_differ(a.path(), b.path()).unwrap());
    }

    #[test]
    fn test_content_drift_differs() {
        let a = tree(&[("grub/grub.cfg", "menu v1")]);
        let b = tree(&[("grub/grub.cfg", "menu v2")]);
        assert!(dirs_differ(a.path(), b.path()).unwrap());
    }

    #[test]
    fn test_extra_file_differs() {
        let a = tree(&[("vmlinuz", "kernel")]);
        let b = tree(&[("vmlinuz", "kernel"), ("initrd.img", "ramdisk")]);
        assert!(dirs_differ(a.path(), b.path()).unwrap());
    }

    #[test]
    fn test_missing_side_differs() {
        let a = tree(&[("vmlinuz", "kernel")]);
        let missing = a.path().join("no-such-subdir");
        assert!(dirs_differ(a.path(), &missing).unwrap());
        assert!(dirs_differ(&missing, a.path()).unwrap());
    }

    #[test]
    fn test_both_missing_do_not_differ() {
        let base = TempDir::new().unwrap();
        let a = base.path().join("a");
        let b = base.path().join("b");
        assert!(!dirs_differ(&a, &b).unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_target_is_compared() {
        use std::os::unix::fs::symlink;

        let a = tree(&[("vmlinuz-6.1", "kernel")]);
        let b = tree(&[("vmlinuz-6.1", "kernel")]);
        symlink("vmlinuz-6.1", a.path().join("vmlinuz")).unwrap();
        symlink("vmlinuz-6.1", b.path().join("vmlinuz")).unwrap();
        assert!(!dirs_differ(a.path(), b.path()).unwrap());

        fs::remove_file(b.path().join("vmlinuz")).unwrap();
        symlink("vmlinuz-6.2", b.path().join("vmlinuz")).unwrap();
        assert!(dirs_differ(a.path(), b.path()).unwrap());
    }
}
