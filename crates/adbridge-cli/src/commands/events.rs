//! Events command - inspect or clear the operator event log

use anyhow::Result;
use clap::{Args, Subcommand};

use crate::output::{get_formatter, OutputFormat};

#[derive(Debug, Subcommand)]
pub enum EventsCommand {
    /// List recent events, newest first
    List(ListArgs),
    /// Delete the whole event log
    Clear,
}

#[derive(Debug, Args)]
pub struct ListArgs {
    /// Number of entries to skip
    #[arg(long, default_value_t = 0)]
    pub offset: i64,

    /// Number of entries to show
    #[arg(long, default_value_t = 30)]
    pub count: i64,
}

impl EventsCommand {
    pub async fn execute(&self, format: OutputFormat) -> Result<()> {
        let formatter = get_formatter(matches!(format, OutputFormat::Json));
        let proxy = super::event_log().await?;

        match self {
            EventsCommand::List(args) => {
                let page: String = proxy
                    .call("LoadEventLog", &(args.offset, args.count))
                    .await?;
                let events: serde_json::Value = serde_json::from_str(&page)?;

                if matches!(format, OutputFormat::Json) {
                    formatter.print_json(&events);
                    return Ok(());
                }

                let entries = events.as_array().cloned().unwrap_or_default();
                if entries.is_empty() {
                    formatter.info("No events");
                    return Ok(());
                }
                for event in entries {
                    println!(
                        "{}  [{}/{}]  {}",
                        event["timestamp"].as_str().unwrap_or(""),
                        event["type"].as_str().unwrap_or("?"),
                        event["category"].as_str().unwrap_or("?"),
                        event["message"].as_str().unwrap_or("")
                    );
                }
            }
            EventsCommand::Clear => {
                let deleted: bool = proxy.call("DeleteEventLog", &()).await?;
                if deleted {
                    formatter.success("Event log cleared");
                } else {
                    formatter.error("Could not clear the event log");
                }
            }
        }
        Ok(())
    }
}
