//! Action executors and the executor registry
//!
//! Every action type maps to exactly one [`Executor`]. The mapping is built once
//! at startup through [`ExecutorRegistryBuilder`] (or [`ExecutorRegistry::standard`])
//! and is read-only afterwards; pass it around by `Arc` rather than reaching for
//! a global.

pub mod connectivity;
pub mod etcd;
pub mod haproxy;
pub mod node_check;

use crate::action::{Action, ActionType};
use crate::error::{ActionError, DeployError, ExecuteError, Result};
use crate::models::{Node, Status};
use crate::remote::{RemoteConnector, RemoteSession};
use crate::settings::Settings;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info};

/// Runs one type of action
#[async_trait]
pub trait Executor: Send + Sync {
    /// Execute the action against its node(s).
    ///
    /// Returns [`ExecuteError::TypeMismatch`] when the action payload is not the
    /// shape this executor runs, and [`ExecuteError::Failed`] when the work ran
    /// and failed.
    async fn execute(&self, action: &mut Action) -> std::result::Result<(), ExecuteError>;
}

/// Immutable mapping from action type to executor
#[derive(Clone)]
pub struct ExecutorRegistry {
    executors: HashMap<ActionType, Arc<dyn Executor>>,
}

/// Collects executors before the registry is frozen
#[derive(Default)]
pub struct ExecutorRegistryBuilder {
    executors: HashMap<ActionType, Arc<dyn Executor>>,
}

impl ExecutorRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the executor for an action type; a type can be registered once
    pub fn register(mut self, action_type: ActionType, executor: Arc<dyn Executor>) -> Result<Self> {
        if self.executors.contains_key(&action_type) {
            return Err(DeployError::Validation(format!(
                "executor for action type {} already registered",
                action_type
            )));
        }
        self.executors.insert(action_type, executor);
        Ok(self)
    }

    pub fn build(self) -> ExecutorRegistry {
        ExecutorRegistry {
            executors: self.executors,
        }
    }
}

impl ExecutorRegistry {
    pub fn builder() -> ExecutorRegistryBuilder {
        ExecutorRegistryBuilder::new()
    }

    /// Registry with every built-in executor wired to `connector`
    pub fn standard(connector: Arc<dyn RemoteConnector>, settings: &Settings) -> Result<Self> {
        Ok(Self::builder()
            .register(
                ActionType::NodeCheck,
                Arc::new(node_check::NodeCheckExecutor::new(connector.clone())),
            )?
            .register(
                ActionType::ConnectivityCheck,
                Arc::new(connectivity::ConnectivityCheckExecutor::new(
                    connector.clone(),
                    settings.clone(),
                )),
            )?
            .register(
                ActionType::DeployEtcd,
                Arc::new(etcd::DeployEtcdExecutor::new(connector)),
            )?
            .register(ActionType::HaproxyCheck, Arc::new(haproxy::HaproxyCheckExecutor))?
            .build())
    }

    pub fn get(&self, action_type: ActionType) -> Option<&Arc<dyn Executor>> {
        self.executors.get(&action_type)
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }

    /// Resolve the action's executor and run it, driving the action status
    /// Pending -> Doing -> Done | Failed.
    ///
    /// Runtime failures come back with the action name as `log_id`. An action
    /// that already left Pending is rejected with [`ExecuteError::InvalidState`]
    /// and its executor is not called.
    pub async fn dispatch(&self, action: &mut Action) -> std::result::Result<(), ExecuteError> {
        let executor = self
            .get(action.action_type)
            .cloned()
            .ok_or(ExecuteError::NoExecutor(action.action_type))?;

        if let Err(e) = action.set_status(Status::Doing) {
            error!(action = %action.name, "Refusing to dispatch: {}", e);
            return Err(ExecuteError::InvalidState(action.status()));
        }
        info!(action = %action.name, node = %action.node.name, "Executing {} action", action.action_type);

        let result = executor.execute(action).await.map_err(|e| match e {
            ExecuteError::Failed(err) if err.log_id.is_none() => {
                ExecuteError::Failed(err.with_log_id(action.name.clone()))
            }
            other => other,
        });

        match &result {
            Ok(()) => {
                set_status(action, Status::Done);
                info!(action = %action.name, "Action finished");
            }
            Err(ExecuteError::Failed(err)) => {
                set_status(action, Status::Failed);
                info!(action = %action.name, reason = %err.reason, "Action failed: {}", err.detail);
            }
            Err(e) => {
                set_status(action, Status::Failed);
                error!(action = %action.name, "Action dispatch error: {}", e);
            }
        }
        result
    }
}

fn set_status(action: &mut Action, next: Status) {
    if let Err(e) = action.set_status(next) {
        error!(action = %action.name, "{}", e);
    }
}

const SSH_FIX: &str = "configure no-password ssh login from deploy node";

/// Open a session to `node`, mapping failure to the setup error shown to operators
pub(crate) async fn open_session(
    connector: &dyn RemoteConnector,
    node: &Node,
) -> std::result::Result<Box<dyn RemoteSession>, ActionError> {
    connector.connect(node).await.map_err(|e| {
        ActionError::new(
            "failed to start remote session",
            format!(
                "Failed to create SSH connection to {} by connecting to {}, error {}",
                node.name,
                node.ssh_target(),
                e
            ),
            SSH_FIX,
        )
    })
}
