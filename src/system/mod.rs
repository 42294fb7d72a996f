//! Local system integration
//!
//! # Submodules
//!
//! - [`command`]: Privileged command execution used by the VPN and firewall control surfaces

pub mod command;

pub use command::{CommandError, CommandOutput, CommandRunner, ProcessRunner, RecordingCommandRunner};
