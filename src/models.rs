//! Core data models shared by tasks, actions and executors

use crate::error::{ActionError, DeployError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

// Input validation limits
pub const MAX_YAML_SIZE: usize = 1_048_576; // 1 MB
pub const MAX_NODE_COUNT: usize = 1_000;
pub const MAX_TASK_COUNT: usize = 256;
pub const MAX_NAME_LEN: usize = 64;
pub const MAX_OUTPUT_SIZE: usize = 1_048_576; // 1 MB per remote command

/// A machine of the cluster reachable over SSH
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Node {
    pub name: String,
    pub ip: String,
    pub ssh: SshSettings,
}

impl Node {
    /// `ip:port` of the node's SSH endpoint
    pub fn ssh_target(&self) -> String {
        format!("{}:{}", self.ip, self.ssh.port)
    }
}

/// SSH access settings of a node
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SshSettings {
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub auth: Auth,
}

fn default_ssh_port() -> u16 {
    22
}

/// Credentials used to open a session on a node
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Auth {
    pub username: String,
    #[serde(flatten)]
    pub method: AuthMethod,
}

/// Authentication methods
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthMethod {
    Password { password: String },
    PrivateKey { key_path: String },
}

/// Transport protocol of a connectivity probe
///
/// Unknown names are kept so that the executor can report them instead of
/// failing the whole cluster file at parse time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Protocol {
    Tcp,
    Udp,
    Other(String),
}

impl Protocol {
    pub const SUPPORTED: &'static [Protocol] = &[Protocol::Tcp, Protocol::Udp];
}

impl From<String> for Protocol {
    fn from(s: String) -> Self {
        match s.to_lowercase().as_str() {
            "tcp" => Protocol::Tcp,
            "udp" => Protocol::Udp,
            _ => Protocol::Other(s),
        }
    }
}

impl From<Protocol> for String {
    fn from(p: Protocol) -> Self {
        p.to_string()
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "TCP"),
            Protocol::Udp => write!(f, "UDP"),
            Protocol::Other(name) => write!(f, "{}", name),
        }
    }
}

/// Lifecycle status of an action or of a single check item
///
/// Pending -> Doing -> Done | Failed. Done and Failed are terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Pending,
    Doing,
    Done,
    Failed,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Done | Status::Failed)
    }

    pub fn can_transition_to(self, next: Status) -> bool {
        matches!(
            (self, next),
            (Status::Pending, Status::Doing)
                | (Status::Doing, Status::Done)
                | (Status::Doing, Status::Failed)
        )
    }

    /// Validate and return the next status
    pub fn transition(self, next: Status) -> Result<Status> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(DeployError::InvalidTransition {
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Pending => write!(f, "pending"),
            Status::Doing => write!(f, "doing"),
            Status::Done => write!(f, "done"),
            Status::Failed => write!(f, "failed"),
        }
    }
}

/// Result slot of one check item
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ItemCheckResult {
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ActionError>,
}

impl Default for ItemCheckResult {
    fn default() -> Self {
        Self {
            status: Status::Pending,
            error: None,
        }
    }
}

/// Comparison applied between a node's kernel version and the required one
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum VersionComparator {
    #[serde(rename = ">")]
    Greater,
    #[serde(rename = ">=")]
    GreaterOrEqual,
    #[serde(rename = "=")]
    Equal,
    #[serde(rename = "<=")]
    LessOrEqual,
    #[serde(rename = "<")]
    Less,
}

impl VersionComparator {
    pub fn accepts(self, ordering: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::*;
        match self {
            VersionComparator::Greater => ordering == Greater,
            VersionComparator::GreaterOrEqual => ordering != Less,
            VersionComparator::Equal => ordering == Equal,
            VersionComparator::LessOrEqual => ordering != Greater,
            VersionComparator::Less => ordering == Less,
        }
    }
}

impl fmt::Display for VersionComparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VersionComparator::Greater => ">",
            VersionComparator::GreaterOrEqual => ">=",
            VersionComparator::Equal => "=",
            VersionComparator::LessOrEqual => "<=",
            VersionComparator::Less => "<",
        };
        write!(f, "{}", s)
    }
}

/// Kernel version a node must satisfy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KernelRequirement {
    pub version: String,
    #[serde(default = "default_comparator")]
    pub comparator: VersionComparator,
}

fn default_comparator() -> VersionComparator {
    VersionComparator::GreaterOrEqual
}

impl Default for KernelRequirement {
    fn default() -> Self {
        Self {
            version: "3.10.0".to_string(),
            comparator: default_comparator(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        assert!(Status::Pending.can_transition_to(Status::Doing));
        assert!(Status::Doing.can_transition_to(Status::Done));
        assert!(Status::Doing.can_transition_to(Status::Failed));

        // No skipping Doing, no leaving a terminal state
        assert!(!Status::Pending.can_transition_to(Status::Done));
        assert!(!Status::Pending.can_transition_to(Status::Failed));
        assert!(!Status::Done.can_transition_to(Status::Doing));
        assert!(!Status::Failed.can_transition_to(Status::Done));
        assert!(!Status::Doing.can_transition_to(Status::Doing));
    }

    #[test]
    fn test_status_transition_error() {
        let result = Status::Done.transition(Status::Failed);
        assert!(matches!(result, Err(DeployError::InvalidTransition { .. })));
        assert_eq!(Status::Pending.transition(Status::Doing).unwrap(), Status::Doing);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(Status::Pending.to_string(), "pending");
        assert_eq!(Status::Doing.to_string(), "doing");
        assert_eq!(Status::Done.to_string(), "done");
        assert_eq!(Status::Failed.to_string(), "failed");
    }

    #[test]
    fn test_protocol_serde() {
        let p: Protocol = serde_yaml::from_str("tcp").unwrap();
        assert_eq!(p, Protocol::Tcp);

        let p: Protocol = serde_yaml::from_str("UDP").unwrap();
        assert_eq!(p, Protocol::Udp);

        let p: Protocol = serde_yaml::from_str("icmp").unwrap();
        assert_eq!(p, Protocol::Other("icmp".to_string()));
    }

    #[test]
    fn test_version_comparator() {
        use std::cmp::Ordering;
        assert!(VersionComparator::GreaterOrEqual.accepts(Ordering::Equal));
        assert!(VersionComparator::GreaterOrEqual.accepts(Ordering::Greater));
        assert!(!VersionComparator::GreaterOrEqual.accepts(Ordering::Less));
        assert!(!VersionComparator::Greater.accepts(Ordering::Equal));
        assert!(VersionComparator::Less.accepts(Ordering::Less));

        let c: VersionComparator = serde_yaml::from_str("\">=\"").unwrap();
        assert_eq!(c, VersionComparator::GreaterOrEqual);
        assert_eq!(c.to_string(), ">=");
    }

    #[test]
    fn test_node_serde() {
        let yaml = r#"
name: master-1
ip: 10.0.0.1
ssh:
  auth:
    username: root
    type: private_key
    key_path: /root/.ssh/id_rsa
"#;
        let node: Node = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(node.ssh.port, 22);
        assert_eq!(node.ssh.auth.username, "root");
        assert_eq!(
            node.ssh.auth.method,
            AuthMethod::PrivateKey {
                key_path: "/root/.ssh/id_rsa".to_string()
            }
        );
        assert_eq!(node.ssh_target(), "10.0.0.1:22");
    }
}
