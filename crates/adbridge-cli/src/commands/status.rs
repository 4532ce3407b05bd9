//! Status command - display synchronization and anomaly status

use anyhow::Result;
use clap::Args;

use crate::output::{get_formatter, OutputFormat};

#[derive(Debug, Args)]
pub struct StatusCommand {}

impl StatusCommand {
    pub async fn execute(&self, format: OutputFormat) -> Result<()> {
        let formatter = get_formatter(matches!(format, OutputFormat::Json));

        let proxy = super::sync_controller().await?;
        let status_json: String = proxy.call("GetSyncStatus", &()).await?;
        let status: serde_json::Value = serde_json::from_str(&status_json)?;

        if matches!(format, OutputFormat::Json) {
            formatter.print_json(&status);
            return Ok(());
        }

        let yes_no = |field: &str| {
            if status[field].as_bool().unwrap_or(false) {
                "yes"
            } else {
                "no"
            }
        };
        println!("Directory sync in progress: {}", yes_no("isAdSyncInProgress"));
        println!("Cloud push in progress:     {}", yes_no("isWebPushInProgress"));

        let ad_text = status["adSyncProgress"]["text"].as_str().unwrap_or("");
        if !ad_text.is_empty() {
            println!("Sync:  {ad_text}");
        }
        let push_text = status["webPushProgress"]["text"].as_str().unwrap_or("");
        if !push_text.is_empty() {
            println!("Push:  {push_text}");
        }

        if status["isAnomalyDetected"].as_bool().unwrap_or(false) {
            formatter.error(&format!(
                "Anomaly detected: {} users, {} groups missing",
                status["anomalyNotPresentUserCount"],
                status["anomalyNotPresentGroupCount"]
            ));
            let message = status["anomalyMessage"].as_str().unwrap_or("");
            if !message.is_empty() {
                formatter.info(message);
            }
        }

        Ok(())
    }
}
