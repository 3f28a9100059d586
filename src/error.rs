//! Error taxonomy and exit-code mapping.
//!
//! Errors propagate as `anyhow::Error` like everywhere else in the crate;
//! the variants below carry the exit-code semantics and are downcast once,
//! in `main`, to pick the process exit status. Nothing below `main` calls
//! `exit()`.

use std::path::PathBuf;
use thiserror::Error;

/// Exit code for failures without a more specific mapping.
pub const EXIT_FAILURE: u8 = 1;

/// Errors with meaning beyond "something failed".
#[derive(Debug, Error)]
pub enum CloneError {
    /// Invalid combination of construction/CLI arguments.
    #[error("configuration error: {0}")]
    Config(String),

    /// An external command exited non-zero. `detail` is the captured
    /// stderr, empty when the output went to the terminal instead.
    #[error("'{program}' exited with code {code}{}", fmt_detail(.detail))]
    Command {
        program: String,
        code: i32,
        detail: String,
    },

    /// A password was supplied but the target is not LUKS-encrypted.
    #[error("password supplied, but {} is not LUKS-encrypted", device.display())]
    PasswordNotNeeded { device: PathBuf },

    /// Opening the LUKS mapping failed with the bad-passphrase status.
    #[error("wrong LUKS passphrase for {}", device.display())]
    WrongPassphrase { device: PathBuf },

    /// The target is LUKS-encrypted but no passphrase source was given.
    #[error("{} is LUKS-encrypted but neither --password nor --password-file was given", device.display())]
    MissingPassword { device: PathBuf },

    /// A device path or UUID did not have the expected shape. This means
    /// an environment the tool does not understand, not user error.
    #[error("invariant violated: {0}")]
    Invariant(String),
}

fn fmt_detail(detail: &str) -> String {
    if detail.is_empty() {
        String::new()
    } else {
        format!(": {detail}")
    }
}

impl CloneError {
    /// Process exit status for this error kind.
    pub fn exit_code(&self) -> u8 {
        match self {
            CloneError::PasswordNotNeeded { .. } => 2,
            CloneError::WrongPassphrase { .. } => 3,
            CloneError::MissingPassword { .. } => 4,
            _ => EXIT_FAILURE,
        }
    }
}

/// Exit code for an `anyhow` chain: the `CloneError` mapping if one is
/// in the chain, the generic failure code otherwise.
pub fn exit_code_for(err: &anyhow::Error) -> u8 {
    err.downcast_ref::<CloneError>()
        .map(CloneError::exit_code)
        .unwrap_or(EXIT_FAILURE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn dev() -> PathBuf {
        PathBuf::from("/dev/sdz1")
    }

    #[test]
    fn test_decryption_exit_codes() {
        assert_eq!(CloneError::PasswordNotNeeded { device: dev() }.exit_code(), 2);
        assert_eq!(CloneError::WrongPassphrase { device: dev() }.exit_code(), 3);
        assert_eq!(CloneError::MissingPassword { device: dev() }.exit_code(), 4);
    }

    #[test]
    fn test_generic_exit_codes() {
        assert_eq!(CloneError::Config("x".into()).exit_code(), 1);
        let command = CloneError::Command {
            program: "mount".into(),
            code: 32,
            detail: String::new(),
        };
        assert_eq!(command.exit_code(), 1);
        assert_eq!(CloneError::Invariant("x".into()).exit_code(), 1);
    }

    #[test]
    fn test_command_display_includes_captured_stderr() {
        let plain = CloneError::Command {
            program: "rsync".into(),
            code: 23,
            detail: String::new(),
        };
        assert_eq!(plain.to_string(), "'rsync' exited with code 23");

        let detailed = CloneError::Command {
            program: "rsync".into(),
            code: 23,
            detail: "rsync: opendir failed: Permission denied".into(),
        };
        assert_eq!(
            detailed.to_string(),
            "'rsync' exited with code 23: rsync: opendir failed: Permission denied"
        );
    }

    #[test]
    fn test_exit_code_survives_anyhow_context() {
        use anyhow::Context;

        let err: anyhow::Error = Err::<(), _>(CloneError::WrongPassphrase { device: dev() })
            .context("opening LUKS mapping")
            .unwrap_err();
        assert_eq!(exit_code_for(&err), 3);

        let plain = anyhow::anyhow!("some failure");
        assert_eq!(exit_code_for(&plain), 1);
    }
}
