//! CLI interface for deploy-core

use crate::executors::ExecutorRegistry;
use crate::logging::{init_logging, LogConfig, LogFormat, LogLevel};
use crate::metrics::DeployMetrics;
use crate::orchestrator::TaskOrchestrator;
use crate::parser::parse_cluster_file;
use crate::remote::ssh::SshConnector;
use crate::settings::Settings;
use crate::task::Task;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};

/// deploy-core - split cluster tasks into actions and run them over SSH
#[derive(Parser, Debug)]
#[command(name = "deploy-core")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run node, connectivity, etcd and haproxy tasks against a cluster", long_about = None)]
pub struct Cli {
    /// Log level
    #[arg(short, long, value_enum, default_value = "info", global = true)]
    pub log_level: LogLevel,

    /// Log format
    #[arg(long, value_enum, default_value = "json", global = true)]
    pub log_format: LogFormat,

    /// Settings file (YAML, TOML or JSON); DEPLOY_* variables override it
    #[arg(long, global = true)]
    pub settings: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Execute the tasks of a cluster file and print a JSON report
    Run {
        /// Path to cluster YAML file
        cluster: PathBuf,

        /// Only run the named task
        #[arg(short, long)]
        task: Option<String>,

        /// Write Prometheus metrics to this file after the run
        #[arg(long)]
        metrics_out: Option<PathBuf>,
    },

    /// Validate a cluster file without connecting to any node
    Validate {
        /// Path to cluster YAML file
        cluster: PathBuf,
    },

    /// Print the actions each task splits into
    Split {
        /// Path to cluster YAML file
        cluster: PathBuf,
    },
}

#[derive(Debug, Serialize)]
struct PlannedAction {
    name: String,
    action_type: String,
    node: String,
    log_file_path: PathBuf,
}

#[derive(Debug, Serialize)]
struct PlannedTask {
    task: String,
    actions: Vec<PlannedAction>,
}

impl Cli {
    pub fn init_logging(&self) -> anyhow::Result<()> {
        init_logging(&LogConfig::new(self.log_level, self.log_format))
    }

    /// Execute the CLI command
    pub async fn execute(&self) -> anyhow::Result<()> {
        match &self.command {
            Commands::Run {
                cluster,
                task,
                metrics_out,
            } => {
                self.run_cluster(cluster, task.as_deref(), metrics_out.as_deref())
                    .await?;
            }
            Commands::Validate { cluster } => {
                self.validate_cluster(cluster)?;
            }
            Commands::Split { cluster } => {
                self.split_cluster(cluster)?;
            }
        }
        Ok(())
    }

    fn load_tasks(&self, cluster_path: &Path) -> anyhow::Result<Vec<Task>> {
        info!("Loading cluster file from: {:?}", cluster_path);
        let config = parse_cluster_file(cluster_path)?;
        let tasks = config.to_tasks()?;
        info!(
            "Cluster file loaded: {} nodes, {} tasks",
            config.nodes.len(),
            tasks.len()
        );
        Ok(tasks)
    }

    async fn run_cluster(
        &self,
        cluster_path: &Path,
        only: Option<&str>,
        metrics_out: Option<&Path>,
    ) -> anyhow::Result<()> {
        let settings = Settings::load(self.settings.as_deref())?;
        let mut tasks = self.load_tasks(cluster_path)?;
        if let Some(name) = only {
            tasks.retain(|t| t.name == name);
            if tasks.is_empty() {
                anyhow::bail!("No task named '{}' in {}", name, cluster_path.display());
            }
        }

        let connector = Arc::new(SshConnector::new(
            settings.ssh_connect_timeout(),
            settings.ssh_session_timeout(),
        ));
        let registry = ExecutorRegistry::standard(connector, &settings)?;
        let metrics = DeployMetrics::new()?;
        let orchestrator = TaskOrchestrator::new(Arc::new(registry), settings.max_parallel_actions)
            .with_metrics(metrics.clone());

        let reports = orchestrator.run_tasks(&tasks).await?;
        println!("{}", serde_json::to_string_pretty(&reports)?);

        if let Some(path) = metrics_out {
            std::fs::write(path, metrics.render()?)?;
            info!("Metrics written to {}", path.display());
        }

        if reports.iter().all(|r| r.succeeded) {
            info!("All tasks completed successfully");
            Ok(())
        } else {
            error!("One or more tasks failed");
            std::process::exit(1);
        }
    }

    fn validate_cluster(&self, cluster_path: &Path) -> anyhow::Result<()> {
        let tasks = self.load_tasks(cluster_path)?;
        let orchestrator = TaskOrchestrator::new(Arc::new(ExecutorRegistry::builder().build()), 1);

        let mut total = 0;
        for task in &tasks {
            total += orchestrator.split(task)?.len();
        }

        println!("Cluster file '{}' is valid", cluster_path.display());
        println!("Tasks: {}", tasks.len());
        println!("Actions: {}", total);
        Ok(())
    }

    fn split_cluster(&self, cluster_path: &Path) -> anyhow::Result<()> {
        let tasks = self.load_tasks(cluster_path)?;
        let orchestrator = TaskOrchestrator::new(Arc::new(ExecutorRegistry::builder().build()), 1);

        let plan = tasks
            .iter()
            .map(|task| {
                let actions = orchestrator
                    .split(task)?
                    .into_iter()
                    .map(|a| PlannedAction {
                        name: a.name,
                        action_type: a.action_type.to_string(),
                        node: a.node.name.clone(),
                        log_file_path: a.log_file_path,
                    })
                    .collect();
                Ok(PlannedTask {
                    task: task.name.clone(),
                    actions,
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        println!("{}", serde_json::to_string_pretty(&plan)?);
        Ok(())
    }
}
