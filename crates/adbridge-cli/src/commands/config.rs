//! Config command - reload, reset and connectivity tests

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};

use crate::output::{get_formatter, OutputFormat};

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Re-read the daemon's configuration file and apply it
    Reload,
    /// Wipe the sync database; the next cycle starts from scratch
    ResetDb,
    /// Test the service-account credentials of a forest configuration
    TestCredentials(ForestArgs),
    /// Test the main-group lookup of a forest configuration
    TestGroup(TestGroupArgs),
}

#[derive(Debug, Args)]
pub struct ForestArgs {
    /// Path to a JSON file holding one forest configuration map
    pub forest_file: PathBuf,
}

#[derive(Debug, Args)]
pub struct TestGroupArgs {
    /// Path to a JSON file holding one forest configuration map
    pub forest_file: PathBuf,

    /// Page size for the lookup
    #[arg(long, default_value_t = 10)]
    pub page_size: u32,
}

fn read_forest_json(path: &PathBuf) -> Result<String> {
    std::fs::read_to_string(path)
        .with_context(|| format!("cannot read forest file {}", path.display()))
}

impl ConfigCommand {
    pub async fn execute(&self, format: OutputFormat) -> Result<()> {
        let formatter = get_formatter(matches!(format, OutputFormat::Json));

        match self {
            ConfigCommand::Reload => {
                let proxy = super::sync_controller().await?;
                let result: String = proxy.call("ReloadConfig", &()).await?;
                let result: serde_json::Value = serde_json::from_str(&result)?;
                if result["ok"].as_bool().unwrap_or(false) {
                    formatter.success("Configuration reloaded");
                } else {
                    formatter.error("Configuration rejected:");
                    for error in result["errors"].as_array().cloned().unwrap_or_default() {
                        formatter.info(error.as_str().unwrap_or(""));
                    }
                }
            }
            ConfigCommand::ResetDb => {
                let proxy = super::sync_controller().await?;
                proxy.call::<_, _, ()>("ResetSyncDatabase", &()).await?;
                formatter.success("Sync database reset");
            }
            ConfigCommand::TestCredentials(args) => {
                let forest_json = read_forest_json(&args.forest_file)?;
                let proxy = super::admin_tools().await?;
                let result: String = proxy
                    .call("TestAdminCredentials", &(forest_json.as_str(),))
                    .await?;
                let result: serde_json::Value = serde_json::from_str(&result)?;

                if matches!(format, OutputFormat::Json) {
                    formatter.print_json(&result);
                    return Ok(());
                }
                match result["status"].as_str().unwrap_or("error") {
                    "ok" => formatter.success(&format!(
                        "Credentials accepted by {}",
                        result["dnsName"].as_str().unwrap_or("the directory")
                    )),
                    other => formatter.error(&format!(
                        "{other}: {}",
                        result["message"].as_str().unwrap_or("unknown failure")
                    )),
                }
            }
            ConfigCommand::TestGroup(args) => {
                let forest_json = read_forest_json(&args.forest_file)?;
                let proxy = super::admin_tools().await?;
                let result: String = proxy
                    .call("TestMainGroup", &(forest_json.as_str(), args.page_size))
                    .await?;
                let result: serde_json::Value = serde_json::from_str(&result)?;

                if matches!(format, OutputFormat::Json) {
                    formatter.print_json(&result);
                    return Ok(());
                }
                if result["status"].as_str() == Some("ok") {
                    formatter.success("Main group found");
                } else {
                    formatter.error(result["errorMessage"].as_str().unwrap_or("lookup failed"));
                }
                for sample in result["sampleResults"].as_array().cloned().unwrap_or_default() {
                    formatter.info(&format!(
                        "{} ({})",
                        sample["cn"].as_str().unwrap_or("?"),
                        sample["distinguishedName"].as_str().unwrap_or("?")
                    ));
                }
            }
        }
        Ok(())
    }
}
