//! Task orchestrator: split a task, dispatch its actions, collect outcomes
//!
//! Actions of one task are dispatched concurrently, up to `max_parallel` at a
//! time; reports keep the split order. Tasks passed to [`TaskOrchestrator::run_tasks`]
//! run one after the other. Nothing is retried.

use crate::action::{Action, ActionKind, ActionType};
use crate::error::{ActionError, ExecuteError, Result};
use crate::executors::ExecutorRegistry;
use crate::metrics::DeployMetrics;
use crate::models::Status;
use crate::task::{processor_for, Task, TaskType};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Outcome of one connectivity check item
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CheckItemReport {
    pub protocol: String,
    pub port: u16,
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ActionError>,
}

/// Outcome of one action
#[derive(Debug, Clone, Serialize)]
pub struct ActionReport {
    pub name: String,
    pub action_type: ActionType,
    pub node: String,
    pub status: Status,
    pub log_file_path: PathBuf,
    pub duration_ms: u64,
    /// Structured error of a failed action
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ActionError>,
    /// Set when the action could not be dispatched at all
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dispatch_error: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub check_items: Vec<CheckItemReport>,
}

impl ActionReport {
    fn new(action: &Action, result: std::result::Result<(), ExecuteError>, duration_ms: u64) -> Self {
        let (error, dispatch_error) = match result {
            Ok(()) => (None, None),
            Err(ExecuteError::Failed(e)) => (Some(e), None),
            Err(other) => (None, Some(other.to_string())),
        };
        let check_items = match &action.kind {
            ActionKind::ConnectivityCheck { check_items, .. } => check_items
                .iter()
                .map(|item| {
                    let result = item.result.snapshot();
                    CheckItemReport {
                        protocol: item.protocol.to_string(),
                        port: item.port,
                        status: result.status,
                        error: result.error,
                    }
                })
                .collect(),
            _ => Vec::new(),
        };

        Self {
            name: action.name.clone(),
            action_type: action.action_type,
            node: action.node.name.clone(),
            status: action.status(),
            log_file_path: action.log_file_path.clone(),
            duration_ms,
            error,
            dispatch_error,
            check_items,
        }
    }

    /// Done, with no error from the executor or from dispatch
    pub fn succeeded(&self) -> bool {
        self.status == Status::Done && self.error.is_none() && self.dispatch_error.is_none()
    }
}

/// Outcome of one task
#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    pub task: String,
    pub task_type: TaskType,
    pub succeeded: bool,
    pub actions: Vec<ActionReport>,
}

impl TaskReport {
    pub fn failed_actions(&self) -> impl Iterator<Item = &ActionReport> {
        self.actions.iter().filter(|a| !a.succeeded())
    }
}

/// Drives tasks through split and dispatch
pub struct TaskOrchestrator {
    registry: Arc<ExecutorRegistry>,
    max_parallel: usize,
    metrics: Option<DeployMetrics>,
}

impl TaskOrchestrator {
    pub fn new(registry: Arc<ExecutorRegistry>, max_parallel: usize) -> Self {
        Self {
            registry,
            max_parallel: max_parallel.max(1),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: DeployMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Split a task with the processor of its declared type
    pub fn split(&self, task: &Task) -> Result<Vec<Action>> {
        processor_for(task.task_type).split_task(Some(task))
    }

    /// Split and execute one task
    pub async fn run_task(&self, task: &Task) -> Result<TaskReport> {
        let actions = self.split(task)?;
        info!(task = %task.name, "Running {} task with {} actions", task.task_type, actions.len());

        let reports: Vec<ActionReport> = stream::iter(actions)
            .map(|action| self.run_action(action))
            .buffered(self.max_parallel)
            .collect()
            .await;

        let succeeded = reports.iter().all(ActionReport::succeeded);
        if succeeded {
            info!(task = %task.name, "Task completed successfully");
        } else {
            warn!(
                task = %task.name,
                "Task finished with {} failed actions",
                reports.iter().filter(|r| !r.succeeded()).count()
            );
        }

        Ok(TaskReport {
            task: task.name.clone(),
            task_type: task.task_type,
            succeeded,
            actions: reports,
        })
    }

    /// Run tasks one after the other; a failed task does not stop later ones
    pub async fn run_tasks(&self, tasks: &[Task]) -> Result<Vec<TaskReport>> {
        let mut reports = Vec::with_capacity(tasks.len());
        for task in tasks {
            reports.push(self.run_task(task).await?);
        }
        Ok(reports)
    }

    async fn run_action(&self, mut action: Action) -> ActionReport {
        if let Some(metrics) = &self.metrics {
            metrics.inc_active_actions();
        }
        let start = Instant::now();

        let result = self.registry.dispatch(&mut action).await;

        let elapsed = start.elapsed();
        let report = ActionReport::new(&action, result, whole_millis(elapsed));

        if let Some(metrics) = &self.metrics {
            metrics.dec_active_actions();
            metrics.record_action(
                &report.action_type.to_string(),
                &report.status.to_string(),
                elapsed.as_secs_f64(),
            );
            for item in &report.check_items {
                metrics.record_check_item(&item.protocol, &item.status.to_string());
            }
        }
        report
    }
}

/// Milliseconds in `elapsed`, saturating at `u64::MAX`
fn whole_millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}
