use crate::config::{resolve, ConfigStore, YamlFileStore};
use crate::error::TgErrorContext;
use crate::out;
use crate::Cli;
use anyhow::Result;
use serde::Serialize;

#[derive(Serialize)]
struct ChatSummary {
    chat_id: String,
    name: Option<String>,
    last_read_message_id: i64,
    ids_to_retry: Vec<i64>,
    download_directory: String,
}

/// Configured chats with their stored progress. Reads the configuration only.
pub fn run(cli: &Cli) -> Result<()> {
    let doc = YamlFileStore::new(&cli.config)
        .load()
        .context_config_load(&cli.config)?;

    let mut chats = Vec::with_capacity(doc.chats.len());
    for entry in &doc.chats {
        let config = resolve::resolve(&doc, entry)?;
        chats.push(ChatSummary {
            chat_id: entry.chat_id.to_string(),
            name: entry.name.clone(),
            last_read_message_id: entry.last_read_message_id,
            ids_to_retry: entry.ids_to_retry.clone(),
            download_directory: config.download_directory.display().to_string(),
        });
    }

    if cli.output.is_json() {
        out::write_json(&chats)?;
    } else if !cli.output.is_none() {
        println!(
            "{:<20} {:<28} {:>10} {:>6}  DIRECTORY",
            "CHAT", "NAME", "LAST READ", "RETRY"
        );
        for c in &chats {
            println!(
                "{:<20} {:<28} {:>10} {:>6}  {}",
                out::truncate(&c.chat_id, 20),
                out::truncate(c.name.as_deref().unwrap_or(""), 26),
                c.last_read_message_id,
                c.ids_to_retry.len(),
                c.download_directory
            );
        }
    }
    Ok(())
}
