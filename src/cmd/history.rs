use crate::out;
use crate::store::{RecentDownloadsParams, SortColumn, Store};
use crate::Cli;
use anyhow::{Context, Result};
use clap::Subcommand;
use std::io::{self, Write};

#[derive(Subcommand, Debug, Clone)]
pub enum HistoryCommand {
    /// List recent downloads
    List {
        /// Match file name or chat
        #[arg(long)]
        search: Option<String>,
        /// Only this media type (photo, video, document, ...)
        #[arg(long)]
        media_type: Option<String>,
        /// Sort column
        #[arg(long, value_enum, default_value = "date")]
        sort: SortColumn,
        /// Oldest / smallest first
        #[arg(long)]
        asc: bool,
        /// Limit results
        #[arg(long, default_value = "50")]
        limit: i64,
        /// Skip this many results
        #[arg(long, default_value = "0")]
        offset: i64,
    },
    /// Delete the download history (downloaded files and chat progress are kept)
    Reset {
        /// Skip confirmation prompt
        #[arg(long, short = 'y')]
        confirm: bool,
    },
}

pub async fn run(cli: &Cli, cmd: &HistoryCommand) -> Result<()> {
    let store = Store::open(&cli.store_dir())
        .await
        .context("Failed to open download history database")?;

    match cmd {
        HistoryCommand::List {
            search,
            media_type,
            sort,
            asc,
            limit,
            offset,
        } => {
            let params = RecentDownloadsParams {
                limit: *limit,
                offset: *offset,
                search: search.clone(),
                media_type: media_type.clone(),
                sort: *sort,
                desc: !*asc,
            };
            let (records, total) = store.recent_downloads(&params).await?;

            if cli.output.is_json() {
                out::write_json(&serde_json::json!({
                    "total": total,
                    "records": records,
                }))?;
            } else if !cli.output.is_none() {
                println!(
                    "{:<19} {:<16} {:>8} {:<10} {:>10} FILE",
                    "DOWNLOADED", "CHAT", "MESSAGE", "TYPE", "SIZE"
                );
                for r in &records {
                    println!(
                        "{:<19} {:<16} {:>8} {:<10} {:>10} {}",
                        r.downloaded_at.format("%Y-%m-%d %H:%M:%S"),
                        out::truncate(&r.chat_id, 16),
                        r.message_id,
                        r.media_type,
                        out::human_size(r.file_size),
                        r.file_path
                    );
                }
                println!("{} of {} download(s)", records.len(), total);
            }
        }
        HistoryCommand::Reset { confirm } => {
            if !cli.output.is_json() && !confirm {
                print!("This deletes the whole download history. Are you sure? [y/N] ");
                io::stdout().flush()?;

                let mut input = String::new();
                io::stdin().read_line(&mut input)?;
                let input = input.trim().to_lowercase();
                if input != "y" && input != "yes" {
                    println!("Aborted.");
                    return Ok(());
                }
            }

            let deleted = store.reset().await?;
            if cli.output.is_json() {
                out::write_json(&serde_json::json!({ "cleared": true, "deleted": deleted }))?;
            } else if !cli.output.is_none() {
                println!("Cleared {} history record(s).", deleted);
            }
        }
    }
    Ok(())
}
