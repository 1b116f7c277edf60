pub mod chats;
pub mod download;
pub mod history;

use crate::shutdown::ShutdownController;
use crate::Cli;
use clap::Subcommand;

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Download media from the configured chats
    Download(download::DownloadArgs),
    /// Browse or reset the download history
    History {
        #[command(subcommand)]
        cmd: history::HistoryCommand,
    },
    /// Show configured chats and their progress
    Chats,
}

pub async fn run(cli: Cli, shutdown: ShutdownController) -> anyhow::Result<()> {
    match &cli.command {
        Command::Download(args) => download::run(&cli, args, shutdown).await,
        Command::History { cmd } => history::run(&cli, cmd).await,
        Command::Chats => chats::run(&cli),
    }
}
