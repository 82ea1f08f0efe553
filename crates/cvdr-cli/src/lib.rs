//! cvdr-cli: Command-line interface for cvdr
//!
//! Provides the `cvdr` binary for connecting to and disconnecting from
//! remote virtual devices, plus the hidden agent sub-commands that keep a
//! tunnel alive in the background.

pub mod agent;
pub mod bridge;
pub mod commands;
pub mod directory;
pub mod output;
