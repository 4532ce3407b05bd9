//! Sync command - trigger a synchronization cycle

use anyhow::Result;
use clap::Args;

use crate::output::{get_formatter, OutputFormat};

#[derive(Debug, Args)]
pub struct SyncCommand {
    /// Force a full enumeration instead of a delta sync
    #[arg(long)]
    pub full: bool,

    /// Lift the persistent-anomaly gate for this one cycle
    #[arg(long)]
    pub resume: bool,
}

impl SyncCommand {
    pub async fn execute(&self, format: OutputFormat) -> Result<()> {
        let formatter = get_formatter(matches!(format, OutputFormat::Json));

        let proxy = super::sync_controller().await?;
        proxy
            .call::<_, _, ()>("ForceSync", &(self.resume, self.full))
            .await?;

        let kind = match (self.resume, self.full) {
            (true, _) => "resume",
            (false, true) => "full",
            (false, false) => "delta",
        };
        formatter.success(&format!("Requested a {kind} sync"));
        Ok(())
    }
}
