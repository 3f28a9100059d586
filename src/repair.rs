//! Config-file surgery on the destination filesystem.
//!
//! Pure text transforms for fstab, the bootloader default-options file,
//! crypttab and the initramfs cryptsetup hook config, plus the file-level
//! wrappers that apply them in place. Keeping the transforms pure keeps
//! them testable without a mounted destination.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

/// The bootloader variable holding the default kernel command line.
const CMDLINE_VAR: &str = "GRUB_CMDLINE_LINUX_DEFAULT";

/// The bootloader variable enabling encrypted-disk support.
const CRYPTODISK_VAR: &str = "GRUB_ENABLE_CRYPTODISK";

/// Replace every occurrence of each `(from, to)` pair.
///
/// Used on fstab to substitute the source's device path and filesystem
/// UUID with the destination's.
pub fn substitute(content: &str, replacements: &[(&str, &str)]) -> String {
    let mut result = content.to_string();
    for (from, to) in replacements {
        result = result.replace(from, to);
    }
    result
}

/// Remove any `resume=...` parameter from the default kernel command
/// line. A hibernation image from the source device is meaningless on
/// the clone.
pub fn strip_resume_option(content: &str) -> String {
    edit_cmdline(content, |cmdline| {
        cmdline
            .split_whitespace()
            .filter(|token| !token.starts_with("resume="))
            .collect::<Vec<_>>()
            .join(" ")
    })
}

/// Add a parameter to the default kernel command line, once.
pub fn add_cmdline_option(content: &str, option: &str) -> String {
    let edited = edit_cmdline(content, |cmdline| {
        if cmdline.split_whitespace().any(|token| token == option) {
            return cmdline.to_string();
        }
        if cmdline.is_empty() {
            option.to_string()
        } else {
            format!("{cmdline} {option}")
        }
    });
    if edited.lines().any(|l| l.starts_with(CMDLINE_VAR)) {
        edited
    } else {
        append_line(&edited, &format!("{CMDLINE_VAR}=\"{option}\""))
    }
}

/// Ensure the bootloader's crypto-disk support flag is set.
pub fn enable_cryptodisk(content: &str) -> String {
    set_or_append_var(content, CRYPTODISK_VAR, "y")
}

/// Ensure cryptsetup support is enabled in the initramfs hook config.
/// The stock Debian conf-hook ships the setting commented out.
pub fn enable_initramfs_cryptsetup(content: &str) -> String {
    let mut lines: Vec<String> = Vec::new();
    let mut found = false;
    for line in content.lines() {
        let uncommented = line.trim_start().trim_start_matches('#').trim_start();
        if uncommented.starts_with("CRYPTSETUP=") {
            if !found {
                lines.push("CRYPTSETUP=y".to_string());
                found = true;
            }
            continue;
        }
        lines.push(line.to_string());
    }
    if !found {
        lines.push("CRYPTSETUP=y".to_string());
    }
    join_lines(lines)
}

/// One crypttab line mapping the LUKS partition to its mapper name.
/// The keyscript makes boot-time decryption non-interactive.
pub fn crypttab_entry(mapper_name: &str, partition_uuid: &str, key_file: &Path) -> String {
    format!(
        "{mapper_name} UUID={partition_uuid} {} luks,keyscript=/bin/cat",
        key_file.display()
    )
}

/// Apply a pure transform to a file in place.
pub fn rewrite_file(path: &Path, transform: impl FnOnce(&str) -> String) -> Result<()> {
    let content =
        fs::read_to_string(path).with_context(|| format!("reading '{}'", path.display()))?;
    let updated = transform(&content);
    if updated != content {
        fs::write(path, updated).with_context(|| format!("writing '{}'", path.display()))?;
    }
    Ok(())
}

/// Append one line to a file, creating it when missing.
pub fn append_line_to_file(path: &Path, line: &str) -> Result<()> {
    let mut content = if path.exists() {
        fs::read_to_string(path).with_context(|| format!("reading '{}'", path.display()))?
    } else {
        String::new()
    };
    if !content.is_empty() && !content.ends_with('\n') {
        content.push('\n');
    }
    content.push_str(line);
    content.push('\n');
    fs::write(path, content).with_context(|| format!("writing '{}'", path.display()))?;
    Ok(())
}

/// Edit the quoted value of the default-cmdline variable on every line
/// that sets it; other lines pass through untouched.
fn edit_cmdline(content: &str, edit: impl Fn(&str) -> String) -> String {
    let lines = content
        .lines()
        .map(|line| {
            let Some(rest) = line.strip_prefix(CMDLINE_VAR) else {
                return line.to_string();
            };
            let Some(value) = rest.strip_prefix('=') else {
                return line.to_string();
            };
            let value = value.trim().trim_matches('"');
            format!("{CMDLINE_VAR}=\"{}\"", edit(value))
        })
        .collect();
    preserve_trailing_newline(content, join_lines(lines))
}

fn set_or_append_var(content: &str, var: &str, value: &str) -> String {
    let mut found = false;
    let mut lines: Vec<String> = content
        .lines()
        .map(|line| {
            if line.starts_with(var) && line[var.len()..].starts_with('=') {
                found = true;
                format!("{var}={value}")
            } else {
                line.to_string()
            }
        })
        .collect();
    if !found {
        lines.push(format!("{var}={value}"));
    }
    preserve_trailing_newline(content, join_lines(lines))
}

fn append_line(content: &str, line: &str) -> String {
    let mut result = content.to_string();
    if !result.is_empty() && !result.ends_with('\n') {
        result.push('\n');
    }
    result.push_str(line);
    result.push('\n');
    result
}

fn join_lines(lines: Vec<String>) -> String {
    let mut joined = lines.join("\n");
    joined.push('\n');
    joined
}

fn preserve_trailing_newline(original: &str, mut edited: String) -> String {
    if !original.ends_with('\n') && edited.ends_with('\n') {
        edited.pop();
    }
    edited
}
