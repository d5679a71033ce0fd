//! Node check executor: kernel version comparison on a single node

use crate::action::{Action, ActionKind, ActionLog, ActionType};
use crate::error::{ActionError, ExecuteError};
use crate::executors::{open_session, Executor};
use crate::models::KernelRequirement;
use crate::remote::{run_command, RemoteConnector};
use async_trait::async_trait;
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::debug;

const KERNEL_VERSION_COMMAND: &str = "uname -r";

pub struct NodeCheckExecutor {
    connector: Arc<dyn RemoteConnector>,
}

impl NodeCheckExecutor {
    pub fn new(connector: Arc<dyn RemoteConnector>) -> Self {
        Self { connector }
    }
}

/// Leading numeric components of a version string.
///
/// `3.10.0-1062.el7.x86_64` parses as `[3, 10, 0]`. Returns `None` when the
/// string does not start with a number.
pub fn parse_version(version: &str) -> Option<Vec<u64>> {
    let numeric = version
        .trim()
        .split(|c: char| !(c.is_ascii_digit() || c == '.'))
        .next()?;
    let parts: Vec<u64> = numeric
        .split('.')
        .take_while(|p| !p.is_empty())
        .map(|p| p.parse().ok())
        .collect::<Option<_>>()?;
    if parts.is_empty() {
        None
    } else {
        Some(parts)
    }
}

/// Compare two parsed versions, padding the shorter one with zeros
pub fn compare_versions(a: &[u64], b: &[u64]) -> Ordering {
    let len = a.len().max(b.len());
    for i in 0..len {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        match x.cmp(&y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// Check a kernel version against a requirement
pub fn check_kernel_version(
    node_name: &str,
    kernel_version: &str,
    requirement: &KernelRequirement,
) -> Result<(), ActionError> {
    let unparsable = |v: &str| {
        ActionError::new(
            "kernel version check failed",
            format!("cannot parse version '{}' on {}", v, node_name),
            "check the kernel release reported by `uname -r`",
        )
    };
    let actual = parse_version(kernel_version).ok_or_else(|| unparsable(kernel_version))?;
    let required = parse_version(&requirement.version).ok_or_else(|| unparsable(&requirement.version))?;

    if requirement
        .comparator
        .accepts(compare_versions(&actual, &required))
    {
        Ok(())
    } else {
        Err(ActionError::new(
            "kernel version check failed",
            format!(
                "kernel version {} on {} does not satisfy {} {}",
                kernel_version.trim(),
                node_name,
                requirement.comparator,
                requirement.version
            ),
            format!(
                "install a kernel with version {} {}",
                requirement.comparator, requirement.version
            ),
        ))
    }
}

#[async_trait]
impl Executor for NodeCheckExecutor {
    async fn execute(&self, action: &mut Action) -> Result<(), ExecuteError> {
        let ActionKind::NodeCheck { kernel } = &action.kind else {
            return Err(ExecuteError::TypeMismatch {
                executor: ActionType::NodeCheck,
                actual: action.kind.action_type(),
            });
        };
        let node = action.node.clone();
        let mut log = ActionLog::open(&action.log_file_path).await;

        let session = open_session(self.connector.as_ref(), &node).await?;
        let output = run_command(session.as_ref(), KERNEL_VERSION_COMMAND)
            .await
            .map_err(|e| {
                ActionError::new(
                    "kernel version check failed",
                    format!("failed to run '{}' on {}: {}", KERNEL_VERSION_COMMAND, node.name, e),
                    "make sure the node runs Linux and the login user can run uname",
                )
            })?;

        let version = output.output.trim();
        debug!(node = %node.name, "Kernel version: {}", version);
        log.line(format!("kernel version: {}", version)).await;

        let result = check_kernel_version(&node.name, version, kernel);
        match &result {
            Ok(()) => log.line("kernel version check passed").await,
            Err(e) => log.line(format!("kernel version check failed: {}", e)).await,
        }
        result.map_err(ExecuteError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::VersionComparator;

    fn requirement(version: &str, comparator: VersionComparator) -> KernelRequirement {
        KernelRequirement {
            version: version.to_string(),
            comparator,
        }
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("3.10.0-1062.el7.x86_64"), Some(vec![3, 10, 0]));
        assert_eq!(parse_version("5.4\n"), Some(vec![5, 4]));
        assert_eq!(parse_version("4.19.90-23.8.v2101.ky10.aarch64"), Some(vec![4, 19, 90]));
        assert_eq!(parse_version("linux"), None);
        assert_eq!(parse_version(""), None);
    }

    #[test]
    fn test_compare_versions() {
        assert_eq!(compare_versions(&[4, 19], &[4, 19, 0]), Ordering::Equal);
        assert_eq!(compare_versions(&[5, 4], &[4, 19, 90]), Ordering::Greater);
        assert_eq!(compare_versions(&[3, 10, 0], &[4, 0]), Ordering::Less);
    }

    #[test]
    fn test_check_kernel_version_passes() {
        let req = requirement("4.19", VersionComparator::GreaterOrEqual);
        assert!(check_kernel_version("m1", "5.4.0-42-generic", &req).is_ok());
        assert!(check_kernel_version("m1", "4.19.0", &req).is_ok());
    }

    #[test]
    fn test_check_kernel_version_too_low() {
        let req = requirement("4.19", VersionComparator::GreaterOrEqual);
        let err = check_kernel_version("m1", "3.10.0-1062.el7.x86_64", &req).unwrap_err();
        assert_eq!(err.reason, "kernel version check failed");
        assert!(err.detail.contains("m1"));
        assert!(err.fix_methods.contains(">= 4.19"));
    }

    #[test]
    fn test_check_kernel_version_unparsable() {
        let req = requirement("4.19", VersionComparator::Equal);
        let err = check_kernel_version("m1", "unknown", &req).unwrap_err();
        assert!(err.detail.contains("cannot parse"));
    }
}
