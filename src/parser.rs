//! YAML parser with validation for cluster files
//!
//! A cluster file lists the nodes once and references them by name from tasks:
//!
//! ```yaml
//! log_dir: /var/log/deploy
//! nodes:
//!   - name: master-1
//!     ip: 10.0.0.1
//!     ssh:
//!       auth: { username: root, type: private_key, key_path: /root/.ssh/id_rsa }
//!   - name: master-2
//!     ip: 10.0.0.2
//!     ssh:
//!       auth: { username: root, type: password, password: secret }
//! tasks:
//!   - name: check-nodes
//!     type: node_check
//!     nodes: [master-1, master-2]
//!     kernel: { version: "4.19", comparator: ">=" }
//!   - name: check-etcd-ports
//!     type: connectivity_check
//!     checks:
//!       - source: master-1
//!         destination: master-2
//!         items:
//!           - { protocol: tcp, port: 2379 }
//!           - { protocol: tcp, port: 2380 }
//! ```

use crate::action::ConnectivityCheckItem;
use crate::error::{DeployError, Result};
use crate::models::{
    KernelRequirement, Node, Protocol, MAX_NAME_LEN, MAX_NODE_COUNT, MAX_TASK_COUNT,
    MAX_YAML_SIZE,
};
use crate::task::{
    ConnectivityCheckConfig, DeployEtcdConfig, HaproxyCheckConfig, NodeCheckConfig, Task,
    TaskSpec,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Parsed cluster file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Base directory for action logs
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub tasks: Vec<TaskDef>,
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("/var/log/deploy-core")
}

/// One task of the cluster file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDef {
    pub name: String,
    #[serde(flatten)]
    pub spec: TaskDefSpec,
}

/// Task body, tagged by `type`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskDefSpec {
    NodeCheck {
        nodes: Vec<String>,
        #[serde(default)]
        kernel: KernelRequirement,
    },
    ConnectivityCheck {
        checks: Vec<ConnectivityCheckDef>,
    },
    DeployEtcd {
        nodes: Vec<String>,
    },
    HaproxyCheck {
        nodes: Vec<String>,
        backends: Vec<String>,
    },
}

impl TaskDefSpec {
    fn node_refs(&self) -> Vec<&str> {
        match self {
            TaskDefSpec::NodeCheck { nodes, .. }
            | TaskDefSpec::DeployEtcd { nodes }
            | TaskDefSpec::HaproxyCheck { nodes, .. } => nodes.iter().map(String::as_str).collect(),
            TaskDefSpec::ConnectivityCheck { checks } => checks
                .iter()
                .flat_map(|c| [c.source.as_str(), c.destination.as_str()])
                .collect(),
        }
    }

    fn target_count(&self) -> usize {
        match self {
            TaskDefSpec::NodeCheck { nodes, .. }
            | TaskDefSpec::DeployEtcd { nodes }
            | TaskDefSpec::HaproxyCheck { nodes, .. } => nodes.len(),
            TaskDefSpec::ConnectivityCheck { checks } => checks.len(),
        }
    }
}

/// Probes from one source node to one destination node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectivityCheckDef {
    pub source: String,
    pub destination: String,
    pub items: Vec<CheckItemDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckItemDef {
    pub protocol: Protocol,
    pub port: u16,
}

/// Parse a cluster file from disk.
///
/// # Errors
///
/// * `DeployError::Io` - If file cannot be read
/// * `DeployError::YamlSizeExceeded` - If file exceeds 1MB
/// * `DeployError::YamlParse` - If YAML is malformed
/// * `DeployError::Validation` - If names, counts or node references are invalid
pub fn parse_cluster_file<P: AsRef<Path>>(path: P) -> Result<ClusterConfig> {
    let content = fs::read_to_string(path)?;
    parse_cluster_yaml(&content)
}

/// Parse and validate a cluster file from a YAML string.
///
/// # Example
///
/// ```
/// use deploy_core::parser::parse_cluster_yaml;
///
/// let yaml = r#"
/// nodes:
///   - name: node-1
///     ip: 10.0.0.1
///     ssh:
///       auth: { username: root, type: password, password: secret }
/// tasks:
///   - name: deploy
///     type: deploy_etcd
///     nodes: [node-1]
/// "#;
///
/// let config = parse_cluster_yaml(yaml)?;
/// assert_eq!(config.nodes.len(), 1);
/// assert_eq!(config.to_tasks()?.len(), 1);
/// # Ok::<(), deploy_core::error::DeployError>(())
/// ```
pub fn parse_cluster_yaml(content: &str) -> Result<ClusterConfig> {
    if content.len() > MAX_YAML_SIZE {
        return Err(DeployError::YamlSizeExceeded(content.len()));
    }

    let config: ClusterConfig = serde_yaml::from_str(content)?;

    if config.nodes.len() > MAX_NODE_COUNT {
        return Err(DeployError::Validation(format!(
            "Node count {} exceeds limit of {}",
            config.nodes.len(),
            MAX_NODE_COUNT
        )));
    }
    if config.tasks.len() > MAX_TASK_COUNT {
        return Err(DeployError::Validation(format!(
            "Task count {} exceeds limit of {}",
            config.tasks.len(),
            MAX_TASK_COUNT
        )));
    }

    validate_nodes(&config.nodes)?;
    validate_tasks(&config)?;

    Ok(config)
}

/// Validate name format and length
fn validate_name(kind: &str, name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(DeployError::Validation(format!(
            "{} name '{}' must be 1 to {} characters",
            kind, name, MAX_NAME_LEN
        )));
    }

    // Names end up in log file names
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
    {
        return Err(DeployError::Validation(format!(
            "Invalid {} name '{}': only alphanumeric, underscore, dash and dot allowed",
            kind, name
        )));
    }
    Ok(())
}

fn validate_nodes(nodes: &[Node]) -> Result<()> {
    let mut seen = HashSet::with_capacity(nodes.len());
    for node in nodes {
        validate_name("node", &node.name)?;
        if !seen.insert(node.name.as_str()) {
            return Err(DeployError::Validation(format!(
                "Duplicate node name '{}'",
                node.name
            )));
        }
        if node.ip.parse::<std::net::IpAddr>().is_err() {
            return Err(DeployError::Validation(format!(
                "Node '{}' has invalid IP address '{}'",
                node.name, node.ip
            )));
        }
        if node.ssh.auth.username.is_empty() {
            return Err(DeployError::Validation(format!(
                "Node '{}' has an empty SSH username",
                node.name
            )));
        }
    }
    Ok(())
}

fn validate_tasks(config: &ClusterConfig) -> Result<()> {
    let node_names: HashSet<&str> = config.nodes.iter().map(|n| n.name.as_str()).collect();
    let mut seen = HashSet::with_capacity(config.tasks.len());

    for task in &config.tasks {
        validate_name("task", &task.name)?;
        if !seen.insert(task.name.as_str()) {
            return Err(DeployError::Validation(format!(
                "Duplicate task name '{}'",
                task.name
            )));
        }

        if task.spec.target_count() == 0 {
            return Err(DeployError::Validation(format!(
                "Task '{}' has no targets",
                task.name
            )));
        }

        for node in task.spec.node_refs() {
            if !node_names.contains(node) {
                return Err(DeployError::Validation(format!(
                    "Task '{}' references unknown node '{}'",
                    task.name, node
                )));
            }
        }

        if let TaskDefSpec::ConnectivityCheck { checks } = &task.spec {
            for check in checks {
                if check.items.iter().any(|i| i.port == 0) {
                    return Err(DeployError::Validation(format!(
                        "Task '{}' checks port 0 from '{}' to '{}'",
                        task.name, check.source, check.destination
                    )));
                }
            }
        }
    }
    Ok(())
}

impl ClusterConfig {
    /// Resolve node references and build the tasks, in file order
    pub fn to_tasks(&self) -> Result<Vec<Task>> {
        let nodes: HashMap<&str, Arc<Node>> = self
            .nodes
            .iter()
            .map(|n| (n.name.as_str(), Arc::new(n.clone())))
            .collect();
        let lookup = |task: &str, name: &str| {
            nodes.get(name).cloned().ok_or_else(|| {
                DeployError::Validation(format!(
                    "Task '{}' references unknown node '{}'",
                    task, name
                ))
            })
        };

        self.tasks
            .iter()
            .map(|def| {
                let spec = match &def.spec {
                    TaskDefSpec::NodeCheck { nodes, kernel } => TaskSpec::NodeCheck(
                        nodes
                            .iter()
                            .map(|n| {
                                Ok(NodeCheckConfig {
                                    node: lookup(&def.name, n)?,
                                    kernel: kernel.clone(),
                                })
                            })
                            .collect::<Result<_>>()?,
                    ),
                    TaskDefSpec::ConnectivityCheck { checks } => TaskSpec::ConnectivityCheck(
                        checks
                            .iter()
                            .map(|c| {
                                Ok(ConnectivityCheckConfig {
                                    source_node: lookup(&def.name, &c.source)?,
                                    destination_node: lookup(&def.name, &c.destination)?,
                                    check_items: c
                                        .items
                                        .iter()
                                        .map(|i| ConnectivityCheckItem::new(i.protocol.clone(), i.port))
                                        .collect(),
                                })
                            })
                            .collect::<Result<_>>()?,
                    ),
                    TaskDefSpec::DeployEtcd { nodes } => TaskSpec::DeployEtcd(
                        nodes
                            .iter()
                            .map(|n| Ok(DeployEtcdConfig { node: lookup(&def.name, n)? }))
                            .collect::<Result<_>>()?,
                    ),
                    TaskDefSpec::HaproxyCheck { nodes, backends } => TaskSpec::HaproxyCheck(
                        nodes
                            .iter()
                            .map(|n| {
                                Ok(HaproxyCheckConfig {
                                    node: lookup(&def.name, n)?,
                                    backend_addresses: backends.clone(),
                                })
                            })
                            .collect::<Result<_>>()?,
                    ),
                };
                Ok(Task::new(def.name.clone(), self.log_dir.join(&def.name), spec))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskType;
    use std::io::Write;

    const CLUSTER: &str = r#"
log_dir: /tmp/deploy-logs
nodes:
  - name: master-1
    ip: 10.0.0.1
    ssh:
      auth: { username: root, type: private_key, key_path: /root/.ssh/id_rsa }
  - name: master-2
    ip: 10.0.0.2
    ssh:
      port: 2222
      auth: { username: root, type: password, password: secret }
tasks:
  - name: check-nodes
    type: node_check
    nodes: [master-1, master-2]
    kernel: { version: "4.19", comparator: ">=" }
  - name: check-etcd-ports
    type: connectivity_check
    checks:
      - source: master-1
        destination: master-2
        items:
          - { protocol: tcp, port: 2379 }
          - { protocol: udp, port: 8472 }
  - name: deploy-etcd
    type: deploy_etcd
    nodes: [master-1]
  - name: check-haproxy
    type: haproxy_check
    nodes: [master-2]
    backends: [10.0.0.1, 10.0.0.2]
"#;

    #[test]
    fn test_parse_cluster() {
        let config = parse_cluster_yaml(CLUSTER).unwrap();
        assert_eq!(config.nodes.len(), 2);
        assert_eq!(config.nodes[1].ssh.port, 2222);
        assert_eq!(config.tasks.len(), 4);
    }

    #[test]
    fn test_to_tasks() {
        let tasks = parse_cluster_yaml(CLUSTER).unwrap().to_tasks().unwrap();
        let types: Vec<_> = tasks.iter().map(|t| t.task_type).collect();
        assert_eq!(
            types,
            vec![
                TaskType::NodeCheck,
                TaskType::ConnectivityCheck,
                TaskType::DeployEtcd,
                TaskType::HaproxyCheck
            ]
        );
        assert_eq!(tasks[0].log_file_path, PathBuf::from("/tmp/deploy-logs/check-nodes"));
        assert_eq!(tasks[0].spec.len(), 2);

        match &tasks[1].spec {
            TaskSpec::ConnectivityCheck(checks) => {
                assert_eq!(checks[0].destination_node.name, "master-2");
                assert_eq!(checks[0].check_items[1].protocol, Protocol::Udp);
            }
            other => panic!("unexpected spec: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_node_reference() {
        let yaml = CLUSTER.replace("nodes: [master-1]", "nodes: [master-9]");
        let err = parse_cluster_yaml(&yaml).unwrap_err();
        assert!(err.to_string().contains("unknown node 'master-9'"));
    }

    #[test]
    fn test_duplicate_node_name() {
        let yaml = CLUSTER.replace("name: master-2", "name: master-1");
        assert!(matches!(
            parse_cluster_yaml(&yaml),
            Err(DeployError::Validation(_))
        ));
    }

    #[test]
    fn test_invalid_node_ip() {
        let yaml = CLUSTER.replace("ip: 10.0.0.2", "ip: not-an-ip");
        assert!(parse_cluster_yaml(&yaml).is_err());
    }

    #[test]
    fn test_invalid_task_name() {
        let yaml = CLUSTER.replace("name: deploy-etcd", "name: \"deploy etcd\"");
        assert!(parse_cluster_yaml(&yaml).is_err());
    }

    #[test]
    fn test_task_without_targets() {
        let yaml = CLUSTER.replace("nodes: [master-1]", "nodes: []");
        let err = parse_cluster_yaml(&yaml).unwrap_err();
        assert!(err.to_string().contains("has no targets"));
    }

    #[test]
    fn test_yaml_size_limit() {
        let yaml = "#".repeat(MAX_YAML_SIZE + 1);
        assert!(matches!(
            parse_cluster_yaml(&yaml),
            Err(DeployError::YamlSizeExceeded(_))
        ));
    }

    #[test]
    fn test_unknown_protocol_is_kept() {
        let yaml = CLUSTER.replace("protocol: udp", "protocol: icmp");
        let config = parse_cluster_yaml(&yaml).unwrap();
        let TaskDefSpec::ConnectivityCheck { checks } = &config.tasks[1].spec else {
            panic!("expected connectivity check");
        };
        assert_eq!(checks[0].items[1].protocol, Protocol::Other("icmp".to_string()));
    }

    #[test]
    fn test_parse_cluster_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(CLUSTER.as_bytes()).unwrap();
        let config = parse_cluster_file(file.path()).unwrap();
        assert_eq!(config.log_dir, PathBuf::from("/tmp/deploy-logs"));
    }
}
