//! Actions: node-scoped units of work produced by splitting a task
//!
//! An [`Action`] carries identity (a generated name), its declared [`ActionType`],
//! a lifecycle [`Status`], the path of its own log file and the node it runs on.
//! Kind-specific data lives in [`ActionKind`]; executors match on it and report a
//! type mismatch when the declared tag and the payload disagree.
//!
//! Constructors never touch the network. They validate the config and fail fast
//! with a descriptive [`DeployError`].

use crate::error::{ActionError, DeployError, Result};
use crate::models::{ItemCheckResult, KernelRequirement, Node, Protocol, Status};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::AsyncWriteExt;
use tracing::{error, warn};
use uuid::Uuid;

/// Closed set of action types
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    NodeCheck,
    ConnectivityCheck,
    DeployEtcd,
    HaproxyCheck,
}

impl ActionType {
    /// Prefix used in generated action names
    pub fn slug(self) -> &'static str {
        match self {
            ActionType::NodeCheck => "node-check",
            ActionType::ConnectivityCheck => "connectivity-check",
            ActionType::DeployEtcd => "deploy-etcd",
            ActionType::HaproxyCheck => "haproxy-check",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActionType::NodeCheck => "NodeCheck",
            ActionType::ConnectivityCheck => "ConnectivityCheck",
            ActionType::DeployEtcd => "DeployEtcd",
            ActionType::HaproxyCheck => "HaproxyCheck",
        };
        write!(f, "{}", s)
    }
}

/// Shared result slot of a check item.
///
/// The executor is the only writer. Callers keep a clone to observe progress.
/// Every update goes through [`Status::transition`], so a slot can never reach
/// Done or Failed without having passed through Doing.
#[derive(Debug, Clone, Default)]
pub struct CheckResultHandle(Arc<Mutex<ItemCheckResult>>);

impl CheckResultHandle {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ItemCheckResult> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Copy of the current result
    pub fn snapshot(&self) -> ItemCheckResult {
        self.lock().clone()
    }

    pub fn status(&self) -> Status {
        self.lock().status
    }

    /// Pending -> Doing
    pub fn start(&self) -> Result<()> {
        let mut result = self.lock();
        result.status = result.status.transition(Status::Doing)?;
        Ok(())
    }

    /// Doing -> Done
    pub fn succeed(&self) -> Result<()> {
        let mut result = self.lock();
        result.status = result.status.transition(Status::Done)?;
        Ok(())
    }

    /// Doing -> Failed, recording the error
    pub fn fail(&self, err: ActionError) -> Result<()> {
        let mut result = self.lock();
        result.status = result.status.transition(Status::Failed)?;
        result.error = Some(err);
        Ok(())
    }
}

/// One (protocol, port) probe of a connectivity check
#[derive(Debug, Clone)]
pub struct ConnectivityCheckItem {
    pub protocol: Protocol,
    pub port: u16,
    pub result: CheckResultHandle,
}

impl ConnectivityCheckItem {
    pub fn new(protocol: Protocol, port: u16) -> Self {
        Self {
            protocol,
            port,
            result: CheckResultHandle::new(),
        }
    }

    /// Same probe with a fresh Pending result slot
    pub fn renewed(&self) -> Self {
        Self::new(self.protocol.clone(), self.port)
    }
}

/// Config of a connectivity check from a source node to a destination node
#[derive(Debug, Clone, Default)]
pub struct ConnectivityCheckActionConfig {
    pub source_node: Option<Arc<Node>>,
    pub destination_node: Option<Arc<Node>>,
    pub check_items: Vec<ConnectivityCheckItem>,
    pub log_file_base_path: PathBuf,
}

/// Config of a node check (kernel version) on one node
#[derive(Debug, Clone, Default)]
pub struct NodeCheckActionConfig {
    pub node: Option<Arc<Node>>,
    pub kernel: KernelRequirement,
    pub log_file_base_path: PathBuf,
}

/// Config of an etcd deployment on one node
#[derive(Debug, Clone, Default)]
pub struct DeployEtcdActionConfig {
    pub node: Option<Arc<Node>>,
    pub log_file_base_path: PathBuf,
}

/// Config of the haproxy parameter validation for one node
#[derive(Debug, Clone, Default)]
pub struct HaproxyCheckActionConfig {
    pub node: Option<Arc<Node>>,
    pub backend_addresses: Vec<String>,
    pub log_file_base_path: PathBuf,
}

/// Kind-specific payload of an action
#[derive(Debug, Clone)]
pub enum ActionKind {
    NodeCheck {
        kernel: KernelRequirement,
    },
    ConnectivityCheck {
        source_node: Arc<Node>,
        destination_node: Arc<Node>,
        check_items: Vec<ConnectivityCheckItem>,
    },
    DeployEtcd,
    HaproxyCheck {
        backend_addresses: Vec<String>,
    },
}

impl ActionKind {
    /// Type tag matching the payload shape
    pub fn action_type(&self) -> ActionType {
        match self {
            ActionKind::NodeCheck { .. } => ActionType::NodeCheck,
            ActionKind::ConnectivityCheck { .. } => ActionType::ConnectivityCheck,
            ActionKind::DeployEtcd => ActionType::DeployEtcd,
            ActionKind::HaproxyCheck { .. } => ActionType::HaproxyCheck,
        }
    }
}

/// A node-scoped unit of executable work
#[derive(Debug, Clone)]
pub struct Action {
    pub name: String,
    pub action_type: ActionType,
    status: Status,
    pub log_file_path: PathBuf,
    pub creation_timestamp: DateTime<Utc>,
    /// Node the action acts on (the source node for connectivity checks)
    pub node: Arc<Node>,
    pub kind: ActionKind,
}

impl Action {
    fn build(node: Arc<Node>, kind: ActionKind, log_file_path: PathBuf, name: String) -> Self {
        Self {
            name,
            action_type: kind.action_type(),
            status: Status::Pending,
            log_file_path,
            creation_timestamp: Utc::now(),
            node,
            kind,
        }
    }

    /// Create an action checking connectivity from source to destination
    pub fn connectivity_check(cfg: Option<&ConnectivityCheckActionConfig>) -> Result<Self> {
        let cfg = cfg.ok_or(DeployError::MissingActionConfig).map_err(log_err)?;
        let source = cfg
            .source_node
            .clone()
            .ok_or(DeployError::MissingNode { role: "source" })
            .map_err(log_err)?;
        let destination = cfg
            .destination_node
            .clone()
            .ok_or(DeployError::MissingNode {
                role: "destination",
            })
            .map_err(log_err)?;
        // Result slots are shared with the caller; a used slot cannot run again
        if let Some(item) = cfg
            .check_items
            .iter()
            .find(|i| i.result.status() != Status::Pending)
        {
            return Err(log_err(DeployError::CheckItemNotPending {
                protocol: item.protocol.to_string(),
                port: item.port,
                status: item.result.status(),
            }));
        }

        let name = gen_action_name(ActionType::ConnectivityCheck);
        let log_file_path =
            gen_action_log_file_path(&cfg.log_file_base_path, &name, Some(&source.name));
        Ok(Self::build(
            source.clone(),
            ActionKind::ConnectivityCheck {
                source_node: source,
                destination_node: destination,
                check_items: cfg.check_items.clone(),
            },
            log_file_path,
            name,
        ))
    }

    /// Create an action checking one node's kernel version
    pub fn node_check(cfg: Option<&NodeCheckActionConfig>) -> Result<Self> {
        let cfg = cfg.ok_or(DeployError::MissingActionConfig).map_err(log_err)?;
        let node = required_node(&cfg.node)?;
        Ok(Self::single_node(
            node,
            ActionKind::NodeCheck {
                kernel: cfg.kernel.clone(),
            },
            &cfg.log_file_base_path,
        ))
    }

    /// Create an action deploying etcd on one node
    pub fn deploy_etcd(cfg: Option<&DeployEtcdActionConfig>) -> Result<Self> {
        let cfg = cfg.ok_or(DeployError::MissingActionConfig).map_err(log_err)?;
        let node = required_node(&cfg.node)?;
        Ok(Self::single_node(
            node,
            ActionKind::DeployEtcd,
            &cfg.log_file_base_path,
        ))
    }

    /// Create an action validating haproxy parameters for one node
    pub fn haproxy_check(cfg: Option<&HaproxyCheckActionConfig>) -> Result<Self> {
        let cfg = cfg.ok_or(DeployError::MissingActionConfig).map_err(log_err)?;
        let node = required_node(&cfg.node)?;
        Ok(Self::single_node(
            node,
            ActionKind::HaproxyCheck {
                backend_addresses: cfg.backend_addresses.clone(),
            },
            &cfg.log_file_base_path,
        ))
    }

    fn single_node(node: Arc<Node>, kind: ActionKind, base: &Path) -> Self {
        let name = gen_action_name(kind.action_type());
        let log_file_path = gen_action_log_file_path(base, &name, None);
        Self::build(node, kind, log_file_path, name)
    }

    pub fn status(&self) -> Status {
        self.status
    }

    /// Move the action to the next status, rejecting illegal transitions
    pub fn set_status(&mut self, next: Status) -> Result<()> {
        self.status = self.status.transition(next)?;
        Ok(())
    }
}

fn required_node(node: &Option<Arc<Node>>) -> Result<Arc<Node>> {
    node.clone()
        .ok_or(DeployError::MissingNode { role: "target" })
        .map_err(log_err)
}

fn log_err(err: DeployError) -> DeployError {
    error!("Invalid action config: {}", err);
    err
}

/// Generate a unique action name prefixed with the action type
pub fn gen_action_name(action_type: ActionType) -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("{}-{}", action_type.slug(), &id[..8])
}

/// `<base>/<action name>[-<node name>]`
pub fn gen_action_log_file_path(base: &Path, action_name: &str, node_name: Option<&str>) -> PathBuf {
    match node_name {
        Some(node) => base.join(format!("{}-{}", action_name, node)),
        None => base.join(action_name),
    }
}

/// Append-only execution log of one action.
///
/// Logging to the file is best effort: if the file cannot be opened the
/// action still runs and lines are dropped.
pub struct ActionLog {
    file: Option<tokio::fs::File>,
}

impl ActionLog {
    pub async fn open(path: &Path) -> Self {
        match Self::try_open(path).await {
            Ok(file) => Self { file: Some(file) },
            Err(e) => {
                warn!("Cannot open action log {}: {}", path.display(), e);
                Self { file: None }
            }
        }
    }

    async fn try_open(path: &Path) -> std::io::Result<tokio::fs::File> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
    }

    pub async fn line(&mut self, message: impl AsRef<str>) {
        let Some(file) = self.file.as_mut() else {
            return;
        };
        let line = format!("{} {}\n", Utc::now().to_rfc3339(), message.as_ref());
        let written = match file.write_all(line.as_bytes()).await {
            Ok(()) => file.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            warn!("Failed to write action log: {}", e);
            self.file = None;
        }
    }
}
