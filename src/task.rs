//! Tasks and task splitting
//!
//! A [`Task`] is a cluster-wide intent plus one sub-config per target. Each task
//! type has a [`TaskProcessor`] that turns the task into actions: exactly one
//! action per sub-config, in input order, each logging under the task's base
//! log path. Splitting never executes anything.

use crate::action::{
    Action, ConnectivityCheckActionConfig, ConnectivityCheckItem, DeployEtcdActionConfig,
    HaproxyCheckActionConfig, NodeCheckActionConfig,
};
use crate::error::{DeployError, Result};
use crate::models::{KernelRequirement, Node};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error};

/// Task type variants
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    NodeCheck,
    ConnectivityCheck,
    DeployEtcd,
    HaproxyCheck,
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskType::NodeCheck => write!(f, "node_check"),
            TaskType::ConnectivityCheck => write!(f, "connectivity_check"),
            TaskType::DeployEtcd => write!(f, "deploy_etcd"),
            TaskType::HaproxyCheck => write!(f, "haproxy_check"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeCheckConfig {
    pub node: Arc<Node>,
    pub kernel: KernelRequirement,
}

#[derive(Debug, Clone)]
pub struct ConnectivityCheckConfig {
    pub source_node: Arc<Node>,
    pub destination_node: Arc<Node>,
    pub check_items: Vec<ConnectivityCheckItem>,
}

#[derive(Debug, Clone)]
pub struct DeployEtcdConfig {
    pub node: Arc<Node>,
}

#[derive(Debug, Clone)]
pub struct HaproxyCheckConfig {
    pub node: Arc<Node>,
    pub backend_addresses: Vec<String>,
}

/// Per-target configs of a task, one variant per task type
#[derive(Debug, Clone)]
pub enum TaskSpec {
    NodeCheck(Vec<NodeCheckConfig>),
    ConnectivityCheck(Vec<ConnectivityCheckConfig>),
    DeployEtcd(Vec<DeployEtcdConfig>),
    HaproxyCheck(Vec<HaproxyCheckConfig>),
}

impl TaskSpec {
    pub fn task_type(&self) -> TaskType {
        match self {
            TaskSpec::NodeCheck(_) => TaskType::NodeCheck,
            TaskSpec::ConnectivityCheck(_) => TaskType::ConnectivityCheck,
            TaskSpec::DeployEtcd(_) => TaskType::DeployEtcd,
            TaskSpec::HaproxyCheck(_) => TaskType::HaproxyCheck,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TaskSpec::NodeCheck(c) => c.len(),
            TaskSpec::ConnectivityCheck(c) => c.len(),
            TaskSpec::DeployEtcd(c) => c.len(),
            TaskSpec::HaproxyCheck(c) => c.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A cluster-wide intent
#[derive(Debug, Clone)]
pub struct Task {
    pub name: String,
    pub task_type: TaskType,
    /// Base directory for the logs of the task's actions
    pub log_file_path: PathBuf,
    pub spec: TaskSpec,
}

impl Task {
    pub fn new(name: impl Into<String>, log_file_path: impl Into<PathBuf>, spec: TaskSpec) -> Self {
        Self {
            name: name.into(),
            task_type: spec.task_type(),
            log_file_path: log_file_path.into(),
            spec,
        }
    }

    /// Copy of the task whose connectivity check items have fresh result slots.
    ///
    /// Check items of a task that already ran are terminal and splitting them
    /// again fails; run the renewed copy instead.
    pub fn renewed(&self) -> Self {
        let spec = match &self.spec {
            TaskSpec::ConnectivityCheck(configs) => TaskSpec::ConnectivityCheck(
                configs
                    .iter()
                    .map(|c| ConnectivityCheckConfig {
                        check_items: c.check_items.iter().map(ConnectivityCheckItem::renewed).collect(),
                        ..c.clone()
                    })
                    .collect(),
            ),
            other => other.clone(),
        };
        Self {
            spec,
            ..self.clone()
        }
    }
}

/// Splits one task type into actions
pub trait TaskProcessor: Send + Sync {
    fn task_type(&self) -> TaskType;

    /// Split the task into an ordered sequence of pending actions
    fn split_task(&self, task: Option<&Task>) -> Result<Vec<Action>>;
}

/// Processor for a task type
pub fn processor_for(task_type: TaskType) -> Box<dyn TaskProcessor> {
    match task_type {
        TaskType::NodeCheck => Box::new(NodeCheckProcessor),
        TaskType::ConnectivityCheck => Box::new(ConnectivityCheckProcessor),
        TaskType::DeployEtcd => Box::new(DeployEtcdProcessor),
        TaskType::HaproxyCheck => Box::new(HaproxyCheckProcessor),
    }
}

/// Check presence, type and non-emptiness of a task before splitting
fn verify_task(task: Option<&Task>, expected: TaskType) -> Result<&Task> {
    let result = match task {
        None => Err(DeployError::EmptyTask),
        Some(t) if t.task_type != expected || t.spec.task_type() != expected => {
            Err(DeployError::TaskTypeMismatch {
                expected,
                actual: t.spec.task_type(),
            })
        }
        Some(t) if t.spec.is_empty() => Err(DeployError::EmptyNodeConfigs {
            task: t.name.clone(),
        }),
        Some(t) => Ok(t),
    };

    if let Err(e) = &result {
        error!("Invalid task: {}", e);
    }
    result
}

fn spec_mismatch(expected: TaskType, spec: &TaskSpec) -> DeployError {
    let err = DeployError::TaskTypeMismatch {
        expected,
        actual: spec.task_type(),
    };
    error!("Invalid task: {}", err);
    err
}

fn finish_split(task: &Task, actions: Result<Vec<Action>>) -> Result<Vec<Action>> {
    if let Ok(actions) = &actions {
        debug!(
            task = %task.name,
            "Finished splitting {} task: {} actions",
            task.task_type,
            actions.len()
        );
    }
    actions
}

/// One node check action per node
pub struct NodeCheckProcessor;

impl TaskProcessor for NodeCheckProcessor {
    fn task_type(&self) -> TaskType {
        TaskType::NodeCheck
    }

    fn split_task(&self, task: Option<&Task>) -> Result<Vec<Action>> {
        let task = verify_task(task, self.task_type())?;
        let TaskSpec::NodeCheck(configs) = &task.spec else {
            return Err(spec_mismatch(self.task_type(), &task.spec));
        };
        let actions = configs
            .iter()
            .map(|sub| {
                Action::node_check(Some(&NodeCheckActionConfig {
                    node: Some(sub.node.clone()),
                    kernel: sub.kernel.clone(),
                    log_file_base_path: task.log_file_path.clone(),
                }))
            })
            .collect();
        finish_split(task, actions)
    }
}

/// One connectivity check action per (source, destination) pair
pub struct ConnectivityCheckProcessor;

impl TaskProcessor for ConnectivityCheckProcessor {
    fn task_type(&self) -> TaskType {
        TaskType::ConnectivityCheck
    }

    fn split_task(&self, task: Option<&Task>) -> Result<Vec<Action>> {
        let task = verify_task(task, self.task_type())?;
        let TaskSpec::ConnectivityCheck(configs) = &task.spec else {
            return Err(spec_mismatch(self.task_type(), &task.spec));
        };
        let actions = configs
            .iter()
            .map(|sub| {
                Action::connectivity_check(Some(&ConnectivityCheckActionConfig {
                    source_node: Some(sub.source_node.clone()),
                    destination_node: Some(sub.destination_node.clone()),
                    check_items: sub.check_items.clone(),
                    log_file_base_path: task.log_file_path.clone(),
                }))
            })
            .collect();
        finish_split(task, actions)
    }
}

/// One etcd deployment action per etcd node
pub struct DeployEtcdProcessor;

impl TaskProcessor for DeployEtcdProcessor {
    fn task_type(&self) -> TaskType {
        TaskType::DeployEtcd
    }

    fn split_task(&self, task: Option<&Task>) -> Result<Vec<Action>> {
        let task = verify_task(task, self.task_type())?;
        let TaskSpec::DeployEtcd(configs) = &task.spec else {
            return Err(spec_mismatch(self.task_type(), &task.spec));
        };
        let actions = configs
            .iter()
            .map(|sub| {
                Action::deploy_etcd(Some(&DeployEtcdActionConfig {
                    node: Some(sub.node.clone()),
                    log_file_base_path: task.log_file_path.clone(),
                }))
            })
            .collect();
        finish_split(task, actions)
    }
}

/// One haproxy parameter check action per haproxy node
pub struct HaproxyCheckProcessor;

impl TaskProcessor for HaproxyCheckProcessor {
    fn task_type(&self) -> TaskType {
        TaskType::HaproxyCheck
    }

    fn split_task(&self, task: Option<&Task>) -> Result<Vec<Action>> {
        let task = verify_task(task, self.task_type())?;
        let TaskSpec::HaproxyCheck(configs) = &task.spec else {
            return Err(spec_mismatch(self.task_type(), &task.spec));
        };
        let actions = configs
            .iter()
            .map(|sub| {
                Action::haproxy_check(Some(&HaproxyCheckActionConfig {
                    node: Some(sub.node.clone()),
                    backend_addresses: sub.backend_addresses.clone(),
                    log_file_base_path: task.log_file_path.clone(),
                }))
            })
            .collect();
        finish_split(task, actions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionKind, ActionType};
    use crate::models::{Auth, AuthMethod, Protocol, SshSettings, Status};

    fn node(name: &str) -> Arc<Node> {
        Arc::new(Node {
            name: name.to_string(),
            ip: format!("10.0.0.{}", name.len()),
            ssh: SshSettings {
                port: 22,
                auth: Auth {
                    username: "root".to_string(),
                    method: AuthMethod::PrivateKey {
                        key_path: "/root/.ssh/id_rsa".to_string(),
                    },
                },
            },
        })
    }

    fn node_check_task(names: &[&str]) -> Task {
        let configs = names
            .iter()
            .map(|n| NodeCheckConfig {
                node: node(n),
                kernel: KernelRequirement::default(),
            })
            .collect();
        Task::new("check-nodes", "/var/log/deploy", TaskSpec::NodeCheck(configs))
    }

    #[test]
    fn test_split_one_action_per_config_in_order() {
        let task = node_check_task(&["m1", "m22", "m333"]);
        let actions = NodeCheckProcessor.split_task(Some(&task)).unwrap();

        assert_eq!(actions.len(), 3);
        let names: Vec<_> = actions.iter().map(|a| a.node.name.as_str()).collect();
        assert_eq!(names, vec!["m1", "m22", "m333"]);
        for action in &actions {
            assert_eq!(action.action_type, ActionType::NodeCheck);
            assert_eq!(action.status(), Status::Pending);
            assert_eq!(
                action.log_file_path,
                PathBuf::from("/var/log/deploy").join(&action.name)
            );
        }
    }

    #[test]
    fn test_split_keeps_duplicates() {
        let task = node_check_task(&["m1", "m1"]);
        let actions = NodeCheckProcessor.split_task(Some(&task)).unwrap();
        assert_eq!(actions.len(), 2);
        assert_ne!(actions[0].name, actions[1].name);
    }

    #[test]
    fn test_split_is_repeatable() {
        let task = node_check_task(&["m1", "m22"]);
        let first = NodeCheckProcessor.split_task(Some(&task)).unwrap();
        let second = NodeCheckProcessor.split_task(Some(&task)).unwrap();
        assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(&second) {
            assert_eq!(a.action_type, b.action_type);
            assert_eq!(a.node, b.node);
        }
    }

    #[test]
    fn test_split_missing_task() {
        let result = NodeCheckProcessor.split_task(None);
        assert!(matches!(result, Err(DeployError::EmptyTask)));
    }

    #[test]
    fn test_split_empty_configs() {
        let task = node_check_task(&[]);
        let result = NodeCheckProcessor.split_task(Some(&task));
        assert!(matches!(result, Err(DeployError::EmptyNodeConfigs { .. })));
    }

    #[test]
    fn test_split_type_mismatch() {
        let task = node_check_task(&["m1"]);
        let result = ConnectivityCheckProcessor.split_task(Some(&task));
        assert!(matches!(
            result,
            Err(DeployError::TaskTypeMismatch {
                expected: TaskType::ConnectivityCheck,
                actual: TaskType::NodeCheck,
            })
        ));
    }

    #[test]
    fn test_split_declared_type_disagrees_with_spec() {
        let mut task = node_check_task(&["m1"]);
        task.task_type = TaskType::DeployEtcd;
        assert!(matches!(
            NodeCheckProcessor.split_task(Some(&task)),
            Err(DeployError::TaskTypeMismatch { .. })
        ));
    }

    #[test]
    fn test_split_connectivity_check() {
        let task = Task::new(
            "check-connectivity",
            "/logs",
            TaskSpec::ConnectivityCheck(vec![ConnectivityCheckConfig {
                source_node: node("src"),
                destination_node: node("dst1"),
                check_items: vec![
                    ConnectivityCheckItem::new(Protocol::Tcp, 2379),
                    ConnectivityCheckItem::new(Protocol::Udp, 8472),
                ],
            }]),
        );
        let actions = processor_for(TaskType::ConnectivityCheck)
            .split_task(Some(&task))
            .unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(
            actions[0].log_file_path,
            PathBuf::from(format!("/logs/{}-src", actions[0].name))
        );
        match &actions[0].kind {
            ActionKind::ConnectivityCheck {
                destination_node,
                check_items,
                ..
            } => {
                assert_eq!(destination_node.name, "dst1");
                assert_eq!(check_items.len(), 2);
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn test_spec_mismatch_is_an_error() {
        let task = node_check_task(&["m1"]);
        let err = spec_mismatch(TaskType::HaproxyCheck, &task.spec);
        assert!(matches!(
            err,
            DeployError::TaskTypeMismatch {
                expected: TaskType::HaproxyCheck,
                actual: TaskType::NodeCheck,
            }
        ));
    }

    #[test]
    fn test_split_used_connectivity_task_needs_renewal() {
        let task = Task::new(
            "check-connectivity",
            "/logs",
            TaskSpec::ConnectivityCheck(vec![ConnectivityCheckConfig {
                source_node: node("src"),
                destination_node: node("dst1"),
                check_items: vec![ConnectivityCheckItem::new(Protocol::Tcp, 2379)],
            }]),
        );
        let TaskSpec::ConnectivityCheck(configs) = &task.spec else {
            panic!("expected connectivity spec");
        };
        let item = &configs[0].check_items[0];
        item.result.start().unwrap();
        item.result.succeed().unwrap();

        assert!(matches!(
            ConnectivityCheckProcessor.split_task(Some(&task)),
            Err(DeployError::CheckItemNotPending {
                status: Status::Done,
                ..
            })
        ));

        let renewed = task.renewed();
        let actions = ConnectivityCheckProcessor.split_task(Some(&renewed)).unwrap();
        assert_eq!(actions.len(), 1);
        // The original slot is left untouched
        assert_eq!(item.result.status(), Status::Done);
    }

    #[test]
    fn test_processor_for_each_type() {
        for t in [
            TaskType::NodeCheck,
            TaskType::ConnectivityCheck,
            TaskType::DeployEtcd,
            TaskType::HaproxyCheck,
        ] {
            assert_eq!(processor_for(t).task_type(), t);
        }
    }
}
