//! Bootclone library exports for testing.
//!
//! This module exposes internal components for integration testing.

pub mod blockdev;
pub mod cleanup;
pub mod diff;
pub mod error;
pub mod filesystem;
pub mod orchestrate;
pub mod preflight;
pub mod process;
pub mod repair;
