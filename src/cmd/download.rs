use crate::app::download::{ChatReport, RunEnd};
use crate::app::App;
use crate::config::ConfigStore;
use crate::out;
use crate::shutdown::ShutdownController;
use crate::Cli;
use anyhow::Result;
use clap::Args;
use std::sync::Arc;

#[derive(Args, Debug, Clone)]
pub struct DownloadArgs {
    /// Make a single pass even if refresh_interval is set
    #[arg(long)]
    pub once: bool,
}

pub async fn run(cli: &Cli, args: &DownloadArgs, shutdown: ShutdownController) -> Result<()> {
    let app = App::new(cli, shutdown).await?;
    let store: Arc<dyn ConfigStore> = app.config.clone();
    let output = cli.output;

    app.orchestrator
        .run(store, args.once, |reports| {
            if let Err(e) = print_reports(output, reports) {
                log::warn!("Failed to write report: {:#}", e);
            }
        })
        .await?;
    Ok(())
}

fn print_reports(output: out::OutputMode, reports: &[ChatReport]) -> Result<()> {
    if output.is_none() {
        return Ok(());
    }
    if output.is_json() {
        return out::write_json(&reports);
    }

    println!(
        "{:<30} {:>10} {:>8} {:>7} {:>10} {:>6}  END",
        "CHAT", "DOWNLOADED", "SKIPPED", "FAILED", "LAST READ", "RETRY"
    );
    for r in reports {
        let end = match (&r.error, r.end) {
            (Some(e), _) => format!("error: {}", e),
            (None, RunEnd::Interrupted) => "interrupted".to_string(),
            (None, RunEnd::Done) => "done".to_string(),
        };
        println!(
            "{:<30} {:>10} {:>8} {:>7} {:>10} {:>6}  {}",
            out::truncate(&r.chat, 28),
            r.downloaded,
            r.skipped,
            r.failed,
            r.last_read_message_id,
            r.ids_to_retry.len(),
            end
        );
    }
    Ok(())
}
