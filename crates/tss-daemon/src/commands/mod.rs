//! Command handlers behind the CLI.

pub mod helpers;
pub mod migrate;
pub mod service;

/// How a command ended, mapped onto the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// A one-shot session (keygen, reshare) did not complete.
    SessionFailed,
}
