//! Remote command execution over the system `ssh` client

use anyhow::{Context, Result};
use async_trait::async_trait;
use harness_lib::{PhysicalNode, RemoteExecutor};
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct SshExecutor {
    user: String,
}

impl SshExecutor {
    pub fn new(user: impl Into<String>) -> Self {
        Self { user: user.into() }
    }

    fn destination(&self, node: &PhysicalNode) -> String {
        let host = node.address.as_deref().unwrap_or(&node.name);
        format!("{}@{}", self.user, host)
    }

    fn args(&self, command: &str, node: &PhysicalNode) -> Vec<String> {
        vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", CONNECT_TIMEOUT.as_secs()),
            self.destination(node),
            command.to_string(),
        ]
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn run(&self, command: &str, node: &PhysicalNode) -> Result<String> {
        debug!(node = %node.name, command = %command, "Running remote command");
        let output = Command::new("ssh")
            .args(self.args(command, node))
            .output()
            .await
            .context("Failed to spawn ssh")?;

        if !output.status.success() {
            anyhow::bail!(
                "ssh {} `{}` exited with {}: {}",
                node.name,
                command,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destination_prefers_address() {
        let executor = SshExecutor::new("prow");
        let mut node = PhysicalNode::new("node-1");
        assert_eq!(executor.destination(&node), "prow@node-1");

        node.address = Some("10.0.0.7".to_string());
        let args = executor.args("sudo reboot", &node);
        assert_eq!(args[args.len() - 2], "prow@10.0.0.7");
        assert_eq!(args[args.len() - 1], "sudo reboot");
    }
}
