//! bootclone - creates a bootable copy of the running system.
//!
//! Clones the current filesystem root onto a separate device, repairs
//! fstab and the bootloader configuration on the copy, and reinstalls
//! the bootloader so the copy boots on its own. The destination must be
//! a separate device, not just another partition, since the bootloader
//! is installed into its boot sector.
//!
//! Run it from cron for regular bootable backups; a reasonably sized
//! USB key is enough for a fast manual failover when the boot medium
//! fails.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

use bootclone::cleanup::Cleaner;
use bootclone::error::{exit_code_for, EXIT_FAILURE};
use bootclone::orchestrate::{self, CloneOptions};

#[derive(Parser)]
#[command(name = "bootclone")]
#[command(version)]
#[command(about = "Creates a bootable copy of the current file system root (/)")]
#[command(
    after_help = "The destination MUST reside on a separate device (a partition on the \
    same disk is not enough), since the bootloader is installed into the destination \
    disk's boot sector."
)]
struct Cli {
    /// UUID of the file system to clone onto
    dest_uuid: String,

    /// Turn on debug messages (and show external command output)
    #[arg(short, long)]
    debug: bool,

    /// Turn on verbose messages
    #[arg(short, long)]
    verbose: bool,

    /// Suppress everything except errors
    #[arg(short, long)]
    quiet: bool,

    /// Option for mounting the destination file system (repeatable)
    #[arg(short = 'm', long = "mount-option", value_name = "OPT")]
    mount_options: Vec<String>,

    /// Extra option passed to rsync (repeatable)
    #[arg(short = 'r', long = "rsync-option", value_name = "OPT")]
    rsync_options: Vec<String>,

    /// Path to include in the copy (repeatable, see man 1 rsync)
    #[arg(short = 'i', long = "include", value_name = "PATTERN")]
    includes: Vec<String>,

    /// Path to exclude from the copy (repeatable, see man 1 rsync)
    #[arg(short = 'e', long = "exclude", value_name = "PATTERN")]
    excludes: Vec<String>,

    /// Additional source path copied beyond the root (repeatable)
    #[arg(short = 's', long = "source", value_name = "PATH")]
    extra_sources: Vec<PathBuf>,

    /// LUKS passphrase for the destination
    #[arg(long, value_name = "PASSWORD", conflicts_with = "password_file")]
    password: Option<String>,

    /// File holding the LUKS passphrase for the destination
    #[arg(long, value_name = "PATH")]
    password_file: Option<PathBuf>,
}

impl Cli {
    fn clone_options(&self) -> CloneOptions {
        CloneOptions {
            dest_uuid: self.dest_uuid.clone(),
            mount_options: self.mount_options.clone(),
            rsync_options: self.rsync_options.clone(),
            includes: self.includes.clone(),
            excludes: self.excludes.clone(),
            extra_sources: self.extra_sources.clone(),
            password: self.password.clone(),
            password_file: self.password_file.clone(),
        }
    }

    fn log_level(&self) -> &'static str {
        if self.debug {
            "debug"
        } else if self.verbose {
            "info"
        } else if self.quiet {
            "error"
        } else {
            "warn"
        }
    }
}

fn init_logging(cli: &Cli) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log_level()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli);

    let cleaner = Cleaner::new();
    let result = orchestrate::run(&cli.clone_options(), &cleaner);

    // The unwind runs no matter how the orchestration ended.
    info!("running cleanup jobs");
    let cleanup_result = cleaner.drain_all();

    match (result, cleanup_result) {
        (Ok(()), Ok(())) => {
            info!("success - please verify your backup (!)");
            ExitCode::SUCCESS
        }
        (Ok(()), Err(cleanup_err)) => {
            error!("clone finished, but cleanup failed: {cleanup_err:#}");
            ExitCode::from(EXIT_FAILURE)
        }
        (Err(err), cleanup_result) => {
            if let Err(cleanup_err) = cleanup_result {
                error!("cleanup failed: {cleanup_err:#}");
            }
            error!("abnormal termination");
            // Failure detail only at elevated verbosity.
            info!("failure: {err:#}");
            ExitCode::from(exit_code_for(&err))
        }
    }
}
