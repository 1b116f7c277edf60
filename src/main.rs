mod app;
mod cmd;
mod config;
mod error;
mod filter;
mod ledger;
mod out;
mod scheduler;
mod shutdown;
mod sink;
mod source;
mod store;
#[cfg(test)]
mod testing;
mod tg;

use clap::Parser;
use shutdown::SignalAction;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "tgmedia",
    version,
    about = "Download media from Telegram chats (pure Rust, no TDLib)"
)]
pub struct Cli {
    /// Configuration file; chat progress is written back to it
    #[arg(long, global = true, default_value = "config.yaml")]
    pub config: String,

    /// Session and history directory (default: ~/.tgmedia)
    #[arg(long, global = true, default_value = "~/.tgmedia")]
    pub store: String,

    /// Output mode: text (default), json, or none
    #[arg(long, global = true, value_enum, default_value = "text")]
    pub output: out::OutputMode,

    #[command(subcommand)]
    pub command: cmd::Command,
}

impl Cli {
    pub fn store_dir(&self) -> String {
        let s = &self.store;
        if s.starts_with("~/") {
            if let Some(home) = dirs_home() {
                return format!("{}{}", home, &s[1..]);
            }
        }
        s.clone()
    }
}

fn dirs_home() -> Option<String> {
    std::env::var("HOME").ok()
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Downloads report progress through the log unless told otherwise.
    let default_filter = match cli.command {
        cmd::Command::Download(_) => "tgmedia=info",
        _ => "error",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let shutdown = shutdown::ShutdownController::new();

    let signals = shutdown.clone();
    tokio::spawn(async move {
        while let Ok(()) = tokio::signal::ctrl_c().await {
            match signals.on_signal() {
                SignalAction::Drain => {
                    log::info!("Received Ctrl+C, finishing the current batch (press again to quit now)...");
                }
                SignalAction::Terminate => {
                    eprintln!("Second interrupt, exiting without a final commit");
                    std::process::exit(130);
                }
            }
        }
    });

    if let Err(e) = cmd::run(cli, shutdown.clone()).await {
        // Don't report error if we're shutting down gracefully
        if shutdown.is_triggered() {
            std::process::exit(0);
        }
        let msg = format!("{e:#}");
        eprintln!("Error: {msg}");
        std::process::exit(1);
    }
}
