//! Scripted remote hosts for integration tests
//!
//! Hosts are keyed by IP. A reply function decides what each command line does
//! when waited on; every started command is recorded in order.

#![allow(dead_code)]

use async_trait::async_trait;
use deploy_core::error::{DeployError, Result};
use deploy_core::models::{Auth, AuthMethod, Node, SshSettings};
use deploy_core::remote::{CommandOutput, RemoteChannel, RemoteConnector, RemoteSession};
use deploy_core::settings::Settings;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// What a command does once started
#[derive(Debug, Clone)]
pub enum Reply {
    /// Exit 0 with this output
    Output(String),
    /// Exit with this non-zero status
    Exit(i32),
    /// Never finish
    Hang,
}

/// How a capture announces that it is listening
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    /// Prints `listening on` right away
    Prompt,
    /// Never prints it
    Missing,
    /// Prints it long after any ready timeout
    Late,
}

type ReplyFn = dyn Fn(&str, &str) -> Reply + Send + Sync;

#[derive(Clone)]
pub struct FakeCluster {
    unreachable: Arc<HashSet<String>>,
    reply: Arc<ReplyFn>,
    marker: Marker,
    started: Arc<Mutex<Vec<(String, String)>>>,
}

impl FakeCluster {
    /// `reply(host, command)` scripts every command
    pub fn new(reply: impl Fn(&str, &str) -> Reply + Send + Sync + 'static) -> Self {
        Self {
            unreachable: Arc::new(HashSet::new()),
            reply: Arc::new(reply),
            marker: Marker::Prompt,
            started: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Every command succeeds with empty output
    pub fn healthy() -> Self {
        Self::new(|_, _| Reply::Output(String::new()))
    }

    pub fn with_unreachable(mut self, hosts: &[&str]) -> Self {
        self.unreachable = Arc::new(hosts.iter().map(|h| h.to_string()).collect());
        self
    }

    pub fn with_capture_marker(mut self, marker: Marker) -> Self {
        self.marker = marker;
        self
    }

    pub fn connector(&self) -> Arc<dyn RemoteConnector> {
        Arc::new(self.clone())
    }

    /// `(host, command)` pairs in start order
    pub fn started(&self) -> Vec<(String, String)> {
        self.started.lock().unwrap().clone()
    }

    pub fn started_matching(&self, needle: &str) -> Vec<(String, String)> {
        self.started()
            .into_iter()
            .filter(|(_, cmd)| cmd.contains(needle))
            .collect()
    }
}

#[async_trait]
impl RemoteConnector for FakeCluster {
    async fn connect(&self, node: &Node) -> Result<Box<dyn RemoteSession>> {
        if self.unreachable.contains(&node.ip) {
            return Err(DeployError::Connect {
                host: node.ssh_target(),
                message: "connection refused".to_string(),
            });
        }
        Ok(Box::new(FakeSession {
            host: node.ip.clone(),
            cluster: self.clone(),
        }))
    }
}

struct FakeSession {
    host: String,
    cluster: FakeCluster,
}

#[async_trait]
impl RemoteSession for FakeSession {
    fn host(&self) -> &str {
        &self.host
    }

    async fn new_channel(&self) -> Result<Box<dyn RemoteChannel>> {
        Ok(Box::new(FakeChannel {
            host: self.host.clone(),
            cluster: self.cluster.clone(),
            command: None,
        }))
    }
}

struct FakeChannel {
    host: String,
    cluster: FakeCluster,
    command: Option<String>,
}

#[async_trait]
impl RemoteChannel for FakeChannel {
    async fn start(&mut self, command: &str) -> Result<()> {
        self.cluster
            .started
            .lock()
            .unwrap()
            .push((self.host.clone(), command.to_string()));
        self.command = Some(command.to_string());
        Ok(())
    }

    async fn wait_for_output(&mut self, marker: &str) -> Result<()> {
        let announces = matches!(&self.command, Some(cmd) if cmd.contains("tcpdump"))
            && marker == "listening on";
        match (announces, self.cluster.marker) {
            (true, Marker::Prompt) => Ok(()),
            (true, Marker::Late) => {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            }
            _ => Err(DeployError::Remote {
                host: self.host.clone(),
                message: format!("command finished without printing '{}'", marker),
            }),
        }
    }

    async fn wait(&mut self) -> Result<CommandOutput> {
        let command = self.command.clone().unwrap_or_default();
        match (self.cluster.reply)(&self.host, &command) {
            Reply::Output(output) => Ok(CommandOutput {
                exit_code: 0,
                output,
                output_truncated: false,
            }),
            Reply::Exit(exit_code) => Err(DeployError::CommandFailed {
                host: self.host.clone(),
                exit_code,
                output: String::new(),
            }),
            Reply::Hang => std::future::pending().await,
        }
    }
}

pub fn node(name: &str, ip: &str) -> Arc<Node> {
    Arc::new(Node {
        name: name.to_string(),
        ip: ip.to_string(),
        ssh: SshSettings {
            port: 22,
            auth: Auth {
                username: "root".to_string(),
                method: AuthMethod::Password {
                    password: "secret".to_string(),
                },
            },
        },
    })
}

/// Settings with no send delay and short deadlines
pub fn fast_settings() -> Settings {
    Settings {
        capture_ready_timeout_ms: 200,
        send_delay_ms: 0,
        capture_deadline_ms: 300,
        ..Settings::default()
    }
}
