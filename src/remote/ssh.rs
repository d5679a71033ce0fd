//! SSH implementation of the remote execution capability
//!
//! `ssh2` is synchronous, so every blocking libssh2 call runs on tokio's blocking
//! pool. A started command is driven by its own blocking task which forwards
//! output lines as they arrive (for [`RemoteChannel::wait_for_output`]) and sends
//! the exit status through a oneshot once the channel closes.
//!
//! stderr is merged into stdout: tools like `tcpdump` print their status lines on
//! stderr and callers want to see them.
//!
//! # Example
//!
//! ```no_run
//! use deploy_core::remote::ssh::SshConnector;
//! use deploy_core::remote::{run_command, RemoteConnector};
//! use deploy_core::models::{Auth, AuthMethod, Node, SshSettings};
//! use std::time::Duration;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let connector = SshConnector::new(Duration::from_secs(10), Duration::from_secs(30));
//! let node = Node {
//!     name: "master-1".to_string(),
//!     ip: "10.0.0.1".to_string(),
//!     ssh: SshSettings {
//!         port: 22,
//!         auth: Auth {
//!             username: "root".to_string(),
//!             method: AuthMethod::PrivateKey { key_path: "/root/.ssh/id_rsa".to_string() },
//!         },
//!     },
//! };
//!
//! let session = connector.connect(&node).await?;
//! let output = run_command(session.as_ref(), "uname -r").await?;
//! println!("kernel: {}", output.output.trim());
//! # Ok(())
//! # }
//! ```

use crate::error::{DeployError, Result};
use crate::models::{AuthMethod, Node, MAX_OUTPUT_SIZE};
use crate::remote::{truncate_output, CommandOutput, RemoteChannel, RemoteConnector, RemoteSession};
use async_trait::async_trait;
use ssh2::{ExtendedData, Session};
use std::io::{BufRead, BufReader};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Opens SSH sessions with password or private-key authentication
#[derive(Debug, Clone)]
pub struct SshConnector {
    connect_timeout: Duration,
    session_timeout: Duration,
}

impl SshConnector {
    pub fn new(connect_timeout: Duration, session_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            session_timeout,
        }
    }

    /// Establish the TCP connection, handshake and authenticate
    fn create_session(node: &Node, connect_timeout: Duration, session_timeout: Duration) -> Result<Session> {
        let target = node.ssh_target();
        let connect_err = |message: String| DeployError::Connect {
            host: target.clone(),
            message,
        };

        debug!("Creating SSH session to {}", target);

        let addr = target
            .to_socket_addrs()
            .map_err(|e| connect_err(format!("Invalid host address: {}", e)))?
            .next()
            .ok_or_else(|| connect_err("Host address did not resolve".to_string()))?;

        let tcp = TcpStream::connect_timeout(&addr, connect_timeout)
            .map_err(|e| connect_err(format!("Failed to connect: {}", e)))?;

        let mut session =
            Session::new().map_err(|e| connect_err(format!("Failed to create SSH session: {}", e)))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(session_timeout.as_millis().min(u32::MAX as u128) as u32);
        session
            .handshake()
            .map_err(|e| connect_err(format!("SSH handshake failed: {}", e)))?;

        let auth = &node.ssh.auth;
        match &auth.method {
            AuthMethod::Password { password } => session
                .userauth_password(&auth.username, password)
                .map_err(|e| connect_err(format!("Authentication failed: {}", e)))?,
            AuthMethod::PrivateKey { key_path } => {
                debug!("Authenticating with key: {}", key_path);
                session
                    .userauth_pubkey_file(&auth.username, None, Path::new(key_path), None)
                    .map_err(|e| connect_err(format!("Authentication failed: {}", e)))?
            }
        }

        if !session.authenticated() {
            return Err(connect_err("Authentication failed".to_string()));
        }

        info!("SSH session established to {}", target);
        Ok(session)
    }
}

#[async_trait]
impl RemoteConnector for SshConnector {
    async fn connect(&self, node: &Node) -> Result<Box<dyn RemoteSession>> {
        let node = node.clone();
        let host = node.ip.clone();
        let (connect_timeout, session_timeout) = (self.connect_timeout, self.session_timeout);

        let session = tokio::task::spawn_blocking(move || {
            Self::create_session(&node, connect_timeout, session_timeout)
        })
        .await
        .map_err(|e| DeployError::Connect {
            host: host.clone(),
            message: format!("Task join error: {}", e),
        })??;

        Ok(Box::new(SshSession { host, session }))
    }
}

/// Authenticated SSH session to one node
pub struct SshSession {
    host: String,
    session: Session,
}

#[async_trait]
impl RemoteSession for SshSession {
    fn host(&self) -> &str {
        &self.host
    }

    async fn new_channel(&self) -> Result<Box<dyn RemoteChannel>> {
        Ok(Box::new(SshChannel {
            host: self.host.clone(),
            session: self.session.clone(),
            lines: None,
            done: None,
        }))
    }
}

/// One command on an SSH exec channel
pub struct SshChannel {
    host: String,
    session: Session,
    lines: Option<mpsc::UnboundedReceiver<String>>,
    done: Option<oneshot::Receiver<Result<CommandOutput>>>,
}

impl SshChannel {
    fn remote_err(&self, message: impl Into<String>) -> DeployError {
        DeployError::Remote {
            host: self.host.clone(),
            message: message.into(),
        }
    }
}

/// Blocking body of a started command: exec, stream lines, collect exit status
fn drive_command(
    session: Session,
    host: String,
    command: String,
    started: oneshot::Sender<Result<()>>,
    lines: mpsc::UnboundedSender<String>,
    done: oneshot::Sender<Result<CommandOutput>>,
) {
    let remote_err = |message: String| DeployError::Remote {
        host: host.clone(),
        message,
    };

    let opened = session
        .channel_session()
        .and_then(|mut channel| {
            channel.handle_extended_data(ExtendedData::Merge)?;
            channel.exec(&command)?;
            Ok(channel)
        })
        .map_err(|e| remote_err(format!("Failed to execute command: {}", e)));

    let mut channel = match opened {
        Ok(channel) => {
            let _ = started.send(Ok(()));
            channel
        }
        Err(e) => {
            let _ = started.send(Err(e));
            return;
        }
    };

    let mut output = String::new();
    let mut reader = BufReader::new(&mut channel);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {
                if output.len() < MAX_OUTPUT_SIZE {
                    output.push_str(&line);
                }
                // The receiver may be gone if nobody waits for markers
                let _ = lines.send(line.trim_end().to_string());
            }
            Err(e) => {
                let _ = done.send(Err(remote_err(format!("Failed to read output: {}", e))));
                return;
            }
        }
    }
    drop(reader);
    drop(lines);

    let result = channel
        .wait_close()
        .and_then(|_| channel.exit_status())
        .map_err(|e| remote_err(format!("Failed to get exit status: {}", e)))
        .and_then(|exit_code| {
            let (output, output_truncated) = truncate_output(&output, MAX_OUTPUT_SIZE);
            if output_truncated {
                warn!("Output truncated to {} bytes", MAX_OUTPUT_SIZE);
            }
            if exit_code == 0 {
                Ok(CommandOutput {
                    exit_code,
                    output,
                    output_truncated,
                })
            } else {
                Err(DeployError::CommandFailed {
                    host: host.clone(),
                    exit_code,
                    output,
                })
            }
        });

    debug!("Command on {} finished: {:?}", host, result.as_ref().map(|o| o.exit_code));
    let _ = done.send(result);
}

#[async_trait]
impl RemoteChannel for SshChannel {
    async fn start(&mut self, command: &str) -> Result<()> {
        if self.done.is_some() {
            return Err(self.remote_err("channel already started"));
        }

        debug!("Executing command on {}: {}", self.host, command);

        let (started_tx, started_rx) = oneshot::channel();
        let (line_tx, line_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = oneshot::channel();
        let session = self.session.clone();
        let host = self.host.clone();
        let command = command.to_string();

        tokio::task::spawn_blocking(move || {
            drive_command(session, host, command, started_tx, line_tx, done_tx)
        });

        started_rx
            .await
            .map_err(|_| self.remote_err("command runner stopped before start"))??;

        self.lines = Some(line_rx);
        self.done = Some(done_rx);
        Ok(())
    }

    async fn wait_for_output(&mut self, marker: &str) -> Result<()> {
        let host = self.host.clone();
        let lines = self.lines.as_mut().ok_or_else(|| DeployError::Remote {
            host: host.clone(),
            message: "channel not started".to_string(),
        })?;

        while let Some(line) = lines.recv().await {
            if line.contains(marker) {
                return Ok(());
            }
        }
        Err(DeployError::Remote {
            host,
            message: format!("command finished before printing '{}'", marker),
        })
    }

    async fn wait(&mut self) -> Result<CommandOutput> {
        let done = self
            .done
            .take()
            .ok_or_else(|| self.remote_err("channel not started"))?;
        done.await
            .map_err(|_| self.remote_err("command runner stopped unexpectedly"))?
    }
}
