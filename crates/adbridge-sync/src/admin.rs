//! Configuration test operations for the control surface
//!
//! These run against a forest configuration that may not be persisted yet,
//! so they take the directory client directly and keep their own throwaway
//! sync context.

use adbridge_core::domain::entity::AdGroup;
use adbridge_core::domain::forest::Forest;
use adbridge_core::domain::sync_context::SyncContext;
use adbridge_core::ports::{DirectoryError, IDirectoryClient};
use serde::Serialize;
use serde_json::json;
use tracing::debug;

/// Result of a credentials probe against a forest's controllers
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum CredentialsTestStatus {
    /// A controller answered and accepted the bind
    #[serde(rename_all = "camelCase")]
    Ok { dns_name: String },
    /// A controller answered but rejected the bind
    #[serde(rename_all = "camelCase")]
    InvalidCredentials { symbolic: String, message: String },
    /// No controller answered at all
    #[serde(rename_all = "camelCase")]
    ServerUnreachable { message: String },
    /// Some other directory failure
    #[serde(rename_all = "camelCase")]
    Error { message: String },
}

/// Probes the forest's controllers in order and classifies the outcome.
///
/// Unreachable controllers are skipped; the first one that answers decides
/// the result, so a bad password is reported even when only the secondary
/// controller is up.
pub async fn test_admin_credentials(
    directory: &dyn IDirectoryClient,
    forest: &Forest,
) -> CredentialsTestStatus {
    let mut last_unreachable = String::from("no domain controllers configured");

    for controller in &forest.domain_controllers {
        let credentials = forest.credentials_for(controller);
        debug!(host = %controller.host, "Testing admin credentials");
        match directory.server_info(&credentials).await {
            Ok(info) => {
                return CredentialsTestStatus::Ok {
                    dns_name: info.dns_host_name,
                }
            }
            Err(DirectoryError::InvalidCredentials(detail)) => {
                return CredentialsTestStatus::InvalidCredentials {
                    symbolic: detail.symbolic,
                    message: detail.message,
                }
            }
            Err(DirectoryError::ServerUnreachable(reason)) => {
                last_unreachable = format!("{}: {reason}", controller.host);
            }
            Err(other) => {
                return CredentialsTestStatus::Error {
                    message: other.to_string(),
                }
            }
        }
    }

    CredentialsTestStatus::ServerUnreachable {
        message: last_unreachable,
    }
}

/// Result of a main-group lookup test
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MainGroupTestResult {
    pub status: String,
    pub error_message: String,
    pub sample_results: Vec<serde_json::Value>,
}

fn group_summary(group: &AdGroup) -> serde_json::Value {
    json!({
        "objectGuid": group.entity.object_guid,
        "cn": group.entity.cn,
        "distinguishedName": group.entity.distinguished_name,
    })
}

/// Looks up the configured main group on the first reachable controller,
/// streaming each match to `on_partial` as it arrives. Exactly one match
/// is a pass; zero or several are configuration errors.
pub async fn test_main_group(
    directory: &dyn IDirectoryClient,
    forest: &Forest,
    page_size: u32,
    mut on_partial: impl FnMut(&AdGroup) + Send,
) -> MainGroupTestResult {
    if forest.sync_group.trim().is_empty() {
        return MainGroupTestResult {
            status: "error".to_string(),
            error_message: "no main group configured".to_string(),
            sample_results: Vec::new(),
        };
    }

    let filter = format!("(&(objectClass=group)(CN={}))", forest.sync_group);
    let mut last_error = String::from("no domain controller is reachable");

    for controller in &forest.domain_controllers {
        let credentials = forest.credentials_for(controller);
        let mut ctx = SyncContext::new(forest.object_guid.as_str(), controller.host.clone());

        let mut pages = match directory
            .open_group_search(&credentials, page_size, &filter, &mut ctx)
            .await
        {
            Ok(pages) => pages,
            Err(DirectoryError::ServerUnreachable(reason)) => {
                last_error = format!("{}: {reason}", controller.host);
                continue;
            }
            Err(e) => {
                return MainGroupTestResult {
                    status: "error".to_string(),
                    error_message: e.to_string(),
                    sample_results: Vec::new(),
                }
            }
        };

        let mut samples = Vec::new();
        loop {
            match pages.next_page().await {
                Ok(Some(page)) => {
                    for group in &page {
                        on_partial(group);
                        samples.push(group_summary(group));
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    return MainGroupTestResult {
                        status: "error".to_string(),
                        error_message: e.to_string(),
                        sample_results: samples,
                    }
                }
            }
        }

        let (status, error_message) = match samples.len() {
            1 => ("ok".to_string(), String::new()),
            0 => (
                "error".to_string(),
                format!("group '{}' was not found", forest.sync_group),
            ),
            n => (
                "error".to_string(),
                format!("group name '{}' is ambiguous, {n} matches", forest.sync_group),
            ),
        };
        return MainGroupTestResult {
            status,
            error_message,
            sample_results: samples,
        };
    }

    MainGroupTestResult {
        status: "error".to_string(),
        error_message: last_error,
        sample_results: Vec::new(),
    }
}
