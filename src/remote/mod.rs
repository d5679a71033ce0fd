//! Remote execution capability
//!
//! Executors never talk to the network directly. They go through a
//! [`RemoteConnector`] which opens a [`RemoteSession`] on a node; a session hands
//! out [`RemoteChannel`]s, each running one command line.
//!
//! The production implementation is [`ssh::SshConnector`]. Tests plug in their
//! own connector.

pub mod ssh;

use crate::error::{DeployError, Result};
use crate::models::Node;
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

/// Output of a finished remote command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    /// Combined stdout and stderr, truncated to `MAX_OUTPUT_SIZE`
    pub output: String,
    pub output_truncated: bool,
}

/// Opens authenticated sessions to nodes
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RemoteConnector: Send + Sync {
    async fn connect(&self, node: &Node) -> Result<Box<dyn RemoteSession>>;
}

/// An established session to one node
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Host the session is connected to
    fn host(&self) -> &str;

    async fn new_channel(&self) -> Result<Box<dyn RemoteChannel>>;
}

/// Runs a single command line on the remote host
#[async_trait]
pub trait RemoteChannel: Send {
    /// Start the command without waiting for it
    async fn start(&mut self, command: &str) -> Result<()>;

    /// Resolve once a line of output contains `marker`.
    ///
    /// Fails if the command finishes without printing it.
    async fn wait_for_output(&mut self, marker: &str) -> Result<()>;

    /// Wait for the command to finish.
    ///
    /// A non-zero exit status is reported as [`DeployError::CommandFailed`].
    async fn wait(&mut self) -> Result<CommandOutput>;
}

/// Run one command to completion on a fresh channel
pub async fn run_command(session: &dyn RemoteSession, command: &str) -> Result<CommandOutput> {
    let mut channel = session.new_channel().await?;
    channel.start(command).await?;
    channel.wait().await
}

/// Exit code of a failed command, if the failure came from the command itself
pub fn exit_code_of(err: &DeployError) -> Option<i32> {
    match err {
        DeployError::CommandFailed { exit_code, .. } => Some(*exit_code),
        _ => None,
    }
}

/// Truncate output to `limit` bytes on a char boundary
///
/// Returns (truncated_string, was_truncated)
pub(crate) fn truncate_output(data: &str, limit: usize) -> (String, bool) {
    if data.len() <= limit {
        return (data.to_string(), false);
    }
    let mut end = limit;
    while !data.is_char_boundary(end) {
        end -= 1;
    }
    (data[..end].to_string(), true)
}
