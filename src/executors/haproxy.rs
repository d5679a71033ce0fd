//! Haproxy parameter validation
//!
//! Checks the backend address list handed to haproxy before anything is
//! deployed. Purely local; no node is contacted.

use crate::action::{Action, ActionKind, ActionLog, ActionType};
use crate::error::{ActionError, ExecuteError};
use crate::executors::Executor;
use async_trait::async_trait;
use std::net::IpAddr;
use tracing::error;

const REASON: &str = "invalid haproxy parameter";

#[derive(Debug, Clone, Default)]
pub struct HaproxyCheckExecutor;

/// Validate the backend addresses: non-empty and every entry a valid IP
pub fn check_haproxy_parameter(addresses: &[String]) -> Result<(), ActionError> {
    if addresses.is_empty() {
        return Err(ActionError::new(
            REASON,
            "haproxy backend address list is empty",
            "provide at least one backend IP address",
        ));
    }

    for address in addresses {
        if address.trim().parse::<IpAddr>().is_err() {
            return Err(ActionError::new(
                REASON,
                format!("'{}' is not a valid IP address", address),
                "use IPv4 or IPv6 addresses for haproxy backends",
            ));
        }
    }
    Ok(())
}

#[async_trait]
impl Executor for HaproxyCheckExecutor {
    async fn execute(&self, action: &mut Action) -> Result<(), ExecuteError> {
        let ActionKind::HaproxyCheck { backend_addresses } = &action.kind else {
            return Err(ExecuteError::TypeMismatch {
                executor: ActionType::HaproxyCheck,
                actual: action.kind.action_type(),
            });
        };

        let mut log = ActionLog::open(&action.log_file_path).await;
        log.line(format!("checking haproxy backends: {:?}", backend_addresses))
            .await;

        match check_haproxy_parameter(backend_addresses) {
            Ok(()) => {
                log.line("haproxy parameters are valid").await;
                Ok(())
            }
            Err(e) => {
                error!(error_reason = REASON, "{}", e.detail);
                log.line(format!("check failed: {}", e)).await;
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addrs(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_valid_addresses() {
        assert!(check_haproxy_parameter(&addrs(&["10.0.0.1", "fe80::1"])).is_ok());
    }

    #[test]
    fn test_empty_addresses() {
        let err = check_haproxy_parameter(&[]).unwrap_err();
        assert_eq!(err.reason, REASON);
        assert!(err.detail.contains("empty"));
    }

    #[test]
    fn test_invalid_address() {
        let err = check_haproxy_parameter(&addrs(&["10.0.0.1", "10.0.0.300"])).unwrap_err();
        assert!(err.detail.contains("10.0.0.300"));
    }
}
