//! Deploy etcd on a single node
//!
//! Enables and restarts the `etcd` systemd unit, then checks that it is active.
//! Binaries and unit files are expected to be in place already.

use crate::action::{Action, ActionKind, ActionLog, ActionType};
use crate::error::{ActionError, ExecuteError};
use crate::executors::{open_session, Executor};
use crate::remote::{run_command, RemoteConnector};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

const START_ETCD_COMMAND: &str =
    "systemctl daemon-reload && systemctl enable etcd && systemctl restart etcd";
const ETCD_ACTIVE_COMMAND: &str = "systemctl is-active etcd";

pub struct DeployEtcdExecutor {
    connector: Arc<dyn RemoteConnector>,
}

impl DeployEtcdExecutor {
    pub fn new(connector: Arc<dyn RemoteConnector>) -> Self {
        Self { connector }
    }
}

fn deploy_failed(node: &str, command: &str, err: impl std::fmt::Display) -> ActionError {
    ActionError::new(
        "deploy etcd failed",
        format!("'{}' failed on {}: {}", command, node, err),
        "check the etcd service status with `journalctl -u etcd` on the node",
    )
}

#[async_trait]
impl Executor for DeployEtcdExecutor {
    async fn execute(&self, action: &mut Action) -> Result<(), ExecuteError> {
        if !matches!(action.kind, ActionKind::DeployEtcd) {
            return Err(ExecuteError::TypeMismatch {
                executor: ActionType::DeployEtcd,
                actual: action.kind.action_type(),
            });
        }
        let node = action.node.clone();
        let mut log = ActionLog::open(&action.log_file_path).await;

        let session = open_session(self.connector.as_ref(), &node).await?;

        for command in [START_ETCD_COMMAND, ETCD_ACTIVE_COMMAND] {
            debug!(node = %node.name, "Running: {}", command);
            log.line(format!("running: {}", command)).await;
            if let Err(e) = run_command(session.as_ref(), command).await {
                log.line(format!("failed: {}", e)).await;
                return Err(deploy_failed(&node.name, command, e).into());
            }
        }

        log.line("etcd is active").await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::HaproxyCheckActionConfig;
    use crate::models::{Auth, AuthMethod, Node, SshSettings};
    use crate::remote::MockRemoteConnector;

    #[tokio::test]
    async fn test_rejects_other_action_kinds() {
        let mut connector = MockRemoteConnector::new();
        connector.expect_connect().never();
        let executor = DeployEtcdExecutor::new(Arc::new(connector));

        let mut action = Action::haproxy_check(Some(&HaproxyCheckActionConfig {
            node: Some(Arc::new(Node {
                name: "etcd-1".to_string(),
                ip: "10.0.0.21".to_string(),
                ssh: SshSettings {
                    port: 22,
                    auth: Auth {
                        username: "root".to_string(),
                        method: AuthMethod::Password {
                            password: "pw".to_string(),
                        },
                    },
                },
            })),
            backend_addresses: vec!["10.0.0.1".to_string()],
            log_file_base_path: std::env::temp_dir(),
        }))
        .unwrap();

        let err = executor.execute(&mut action).await.unwrap_err();
        assert!(matches!(
            err,
            ExecuteError::TypeMismatch {
                executor: ActionType::DeployEtcd,
                actual: ActionType::HaproxyCheck
            }
        ));
    }
}
