//! Connectivity check executor
//!
//! Verifies that packets of a given protocol and port can travel from a source
//! node to a destination node, using only `tcpdump` and `nc` on the hosts.
//!
//! Per check item:
//! 1. Pick a random ephemeral source port. It tags this probe's packets so the
//!    capture filter cannot match unrelated traffic.
//! 2. Start `tcpdump` on the destination, limited to one matching packet and a
//!    hard timeout.
//! 3. Wait (bounded) until the capture prints `listening on`, then pause for the
//!    configured send delay.
//! 4. Send one connect/datagram with `nc` from the source, bound to the
//!    ephemeral port.
//! 5. Wait for the capture to finish, bounded by an outer deadline. A capture
//!    that saw the packet exits 0; a timeout or any error marks the item Failed.
//!
//! Items run strictly one after the other and a failed item never stops the
//! remaining ones. Each item keeps its own outcome in its result slot; the
//! action-level error aggregates every failed item.

use crate::action::{Action, ActionKind, ActionLog, ActionType, ConnectivityCheckItem};
use crate::error::{ActionError, ExecuteError};
use crate::executors::{open_session, Executor};
use crate::models::{Node, Protocol};
use crate::remote::{exit_code_of, RemoteChannel, RemoteConnector, RemoteSession};
use crate::settings::Settings;
use async_trait::async_trait;
use rand::Rng;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Line printed by tcpdump once the capture is armed
pub const CAPTURE_READY_MARKER: &str = "listening on";

const CHECK_FAILED: &str = "check connectivity failed";
const CHECK_FIX: &str = "configure network or firewall to allow these packets";

/// Command lines of one probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeCommands {
    /// Runs on the destination node
    pub capture: String,
    /// Runs on the source node
    pub send: String,
}

/// Build the capture and send commands for one probe.
///
/// Fails with `protocol not supported` for anything but TCP and UDP.
pub fn build_probe_commands(
    source: &Node,
    destination: &Node,
    protocol: &Protocol,
    port: u16,
    source_port: u16,
    capture_timeout_secs: u64,
) -> Result<ProbeCommands, ActionError> {
    let (filter_proto, nc_flags) = match protocol {
        Protocol::Tcp => ("tcp", "-zv"),
        Protocol::Udp => ("udp", "-zuv"),
        Protocol::Other(name) => {
            let supported: Vec<String> = Protocol::SUPPORTED.iter().map(|p| p.to_string()).collect();
            return Err(ActionError::new(
                "protocol not supported",
                format!(
                    "protocol {} is not supported. supported protocols are: {}",
                    name,
                    supported.join(", ")
                ),
                "Use a supported protocol",
            ));
        }
    };

    let capture = format!(
        "timeout {} tcpdump -nni any -c 1 src {} and dst {} and {} dst port {} and src port {}",
        capture_timeout_secs, source.ip, destination.ip, filter_proto, port, source_port
    );
    let send = format!(
        "nc -w {} -p {} -s {} {} {} {}",
        capture_timeout_secs, source_port, source.ip, nc_flags, destination.ip, port
    );
    Ok(ProbeCommands { capture, send })
}

pub struct ConnectivityCheckExecutor {
    connector: Arc<dyn RemoteConnector>,
    settings: Settings,
}

impl ConnectivityCheckExecutor {
    pub fn new(connector: Arc<dyn RemoteConnector>, settings: Settings) -> Self {
        Self {
            connector,
            settings,
        }
    }

    /// Random port in `[base, base + span)`
    fn pick_source_port(&self) -> u16 {
        let base = u32::from(self.settings.ephemeral_port_base);
        let span = u32::from(self.settings.ephemeral_port_span.max(1));
        let port = rand::thread_rng().gen_range(base..base + span);
        u16::try_from(port).unwrap_or(self.settings.ephemeral_port_base)
    }

    /// Run one item through Doing to Done or Failed
    async fn check_item(
        &self,
        sessions: (&dyn RemoteSession, &dyn RemoteSession),
        nodes: (&Node, &Node),
        item: &ConnectivityCheckItem,
        log: &mut ActionLog,
    ) -> Result<(), ActionError> {
        let (source, destination) = nodes;
        if let Err(e) = item.result.start() {
            warn!(
                "Cannot start {} {} check from {} to {}: {}",
                item.protocol, item.port, source.name, destination.name, e
            );
            let err = ActionError::new(
                CHECK_FAILED,
                format!(
                    "{} check from {} to {}:{} was not run: {}",
                    item.protocol, source.name, destination.name, item.port, e
                ),
                "split the task again with fresh check items",
            );
            log.line(format!("not run: {}", err)).await;
            return Err(err);
        }

        log.line(format!(
            "checking {} {}:{} from {}",
            item.protocol, destination.name, item.port, source.name
        ))
        .await;

        let outcome = self.probe(sessions, nodes, item).await;
        let recorded = match &outcome {
            Ok(()) => {
                log.line("passed").await;
                item.result.succeed()
            }
            Err(e) => {
                log.line(format!("failed: {}", e)).await;
                item.result.fail(e.clone())
            }
        };
        if let Err(e) = recorded {
            warn!("Cannot record check item result: {}", e);
        }
        outcome
    }

    async fn probe(
        &self,
        sessions: (&dyn RemoteSession, &dyn RemoteSession),
        nodes: (&Node, &Node),
        item: &ConnectivityCheckItem,
    ) -> Result<(), ActionError> {
        let (src_session, dst_session) = sessions;
        let (source, destination) = nodes;

        let source_port = self.pick_source_port();
        let commands = build_probe_commands(
            source,
            destination,
            &item.protocol,
            item.port,
            source_port,
            self.settings.capture_timeout_secs,
        )?;
        debug!("Capture command on {}: {}", destination.name, commands.capture);
        debug!("Send command on {}: {}", source.name, commands.send);

        let mut capture = dst_session
            .new_channel()
            .await
            .map_err(|e| channel_error(destination, e))?;
        let mut sender = src_session
            .new_channel()
            .await
            .map_err(|e| channel_error(source, e))?;

        capture
            .start(&commands.capture)
            .await
            .map_err(|e| channel_error(destination, e))?;

        self.wait_until_armed(capture.as_mut(), destination).await;

        let (tx, rx) = oneshot::channel();
        let waiter = tokio::spawn(async move {
            let _ = tx.send(capture.wait().await);
        });

        tokio::time::sleep(self.settings.send_delay()).await;

        if let Err(e) = sender.start(&commands.send).await {
            waiter.abort();
            return Err(channel_error(source, e));
        }

        let deadline = self.settings.capture_deadline();
        let outcome = timeout(deadline, rx).await;
        waiter.abort();

        let blocked = |cause: String| {
            ActionError::new(
                CHECK_FAILED,
                format!(
                    "{} cannot connect to {} {}:{} ({})",
                    source.name, item.protocol, destination.name, item.port, cause
                ),
                CHECK_FIX,
            )
        };

        match outcome {
            Ok(Ok(Ok(_))) => {
                info!(
                    "{} can reach {} {}:{}",
                    source.name, item.protocol, destination.name, item.port
                );
                Ok(())
            }
            Ok(Ok(Err(e))) => {
                debug!("Capture on {} failed: {}", destination.name, e);
                let cause = match exit_code_of(&e) {
                    Some(124) => "no matching packet captured before timeout".to_string(),
                    _ => format!("capture failed: {}", e),
                };
                Err(blocked(cause))
            }
            Ok(Err(_)) => Err(blocked("capture stopped without a result".to_string())),
            Err(_) => {
                warn!(
                    "Capture on {} did not finish within {:?}",
                    destination.name, deadline
                );
                Err(blocked(format!(
                    "capture did not finish within {:?}",
                    deadline
                )))
            }
        }
    }

    /// Wait for the capture to report it is listening. Best effort: on timeout
    /// the probe goes ahead after the fixed send delay only.
    async fn wait_until_armed(&self, capture: &mut dyn RemoteChannel, destination: &Node) {
        let ready_timeout = self.settings.capture_ready_timeout();
        match timeout(ready_timeout, capture.wait_for_output(CAPTURE_READY_MARKER)).await {
            Ok(Ok(())) => debug!("Capture armed on {}", destination.name),
            Ok(Err(e)) => warn!("Capture on {} never reported ready: {}", destination.name, e),
            Err(_) => warn!(
                "Capture on {} not ready after {:?}, sending anyway",
                destination.name, ready_timeout
            ),
        }
    }
}

fn channel_error(node: &Node, err: impl std::fmt::Display) -> ActionError {
    ActionError::new(
        "failed to start remote session",
        format!("Failed to run command on {} ({}): {}", node.name, node.ip, err),
        "configure no-password ssh login from deploy node",
    )
}

#[async_trait]
impl Executor for ConnectivityCheckExecutor {
    async fn execute(&self, action: &mut Action) -> Result<(), ExecuteError> {
        let ActionKind::ConnectivityCheck {
            source_node,
            destination_node,
            check_items,
        } = &action.kind
        else {
            return Err(ExecuteError::TypeMismatch {
                executor: ActionType::ConnectivityCheck,
                actual: action.kind.action_type(),
            });
        };
        let mut log = ActionLog::open(&action.log_file_path).await;

        // Capture side first, then sender; either failing aborts before any probe
        let dst_session = open_session(self.connector.as_ref(), destination_node).await?;
        let src_session = open_session(self.connector.as_ref(), source_node).await?;

        let mut failures = Vec::new();
        for item in check_items {
            if let Err(e) = self
                .check_item(
                    (src_session.as_ref(), dst_session.as_ref()),
                    (source_node.as_ref(), destination_node.as_ref()),
                    item,
                    &mut log,
                )
                .await
            {
                failures.push(e);
            }
        }

        info!(
            action = %action.name,
            "Connectivity check {} -> {}: {}/{} items failed",
            source_node.name,
            destination_node.name,
            failures.len(),
            check_items.len()
        );

        match ActionError::aggregate(&failures) {
            None => Ok(()),
            Some(err) => Err(err.into()),
        }
    }
}
