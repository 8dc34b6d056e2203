//! Infrastructure
//!
//! Wraps external processes (local commands, ssh, rsync)

pub mod command;
pub mod remote;

pub use command::{CommandError, CommandOutput, CommandRunner};
pub use remote::{RemoteExecutor, SshExecutor};
