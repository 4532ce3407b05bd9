//! Anomaly command - inspect or clear the mass-deletion guard

use anyhow::Result;
use clap::Subcommand;

use crate::output::{get_formatter, OutputFormat};

#[derive(Debug, Subcommand)]
pub enum AnomalyCommand {
    /// Show the current anomaly state
    Show,
    /// Clear the anomaly latch and run a verification sync
    Clear,
}

impl AnomalyCommand {
    pub async fn execute(&self, format: OutputFormat) -> Result<()> {
        let formatter = get_formatter(matches!(format, OutputFormat::Json));
        let proxy = super::sync_controller().await?;

        match self {
            AnomalyCommand::Show => {
                let status_json: String = proxy.call("GetSyncStatus", &()).await?;
                let status: serde_json::Value = serde_json::from_str(&status_json)?;

                if matches!(format, OutputFormat::Json) {
                    formatter.print_json(&serde_json::json!({
                        "isAnomalyDetected": status["isAnomalyDetected"],
                        "anomalyMessage": status["anomalyMessage"],
                        "anomalyNotPresentUserCount": status["anomalyNotPresentUserCount"],
                        "anomalyNotPresentGroupCount": status["anomalyNotPresentGroupCount"],
                    }));
                    return Ok(());
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
                } else {
                    formatter.success("No anomaly detected");
                }
            }
            AnomalyCommand::Clear => {
                proxy.call::<_, _, ()>("ClearAnomalyFlag", &()).await?;
                formatter.success("Anomaly flag cleared, verification sync requested");
            }
        }
        Ok(())
    }
}
