pub mod download;

use crate::config::{ConfigStore, YamlFileStore};
use crate::error::TgErrorContext;
use crate::shutdown::ShutdownController;
use crate::sink::FsSink;
use crate::store::Store;
use crate::tg::{TelegramSource, TgClient, DEFAULT_API_ID};
use crate::Cli;
use anyhow::Result;
use download::Orchestrator;
use std::sync::Arc;
use tokio::sync::Mutex;

pub struct App {
    pub config: Arc<YamlFileStore>,
    pub orchestrator: Orchestrator,
}

impl App {
    pub async fn new(cli: &Cli, shutdown: ShutdownController) -> Result<Self> {
        let config = Arc::new(YamlFileStore::new(&cli.config));
        let doc = config.load().context_config_load(&cli.config)?;
        log::debug!(
            "Loaded {} chat(s) from {}",
            doc.chats.len(),
            config.path().display()
        );

        let store_dir = cli.store_dir();
        std::fs::create_dir_all(&store_dir)?;
        let session_path = format!("{}/session.db", store_dir);
        let tg = TgClient::connect(&session_path, doc.api_id.unwrap_or(DEFAULT_API_ID))?;

        if !tg.client.is_authorized().await.context_auth_check()? {
            anyhow::bail!(
                "Session at {} is not authorized. Sign in with a client sharing this session file first.",
                session_path
            );
        }

        // History is a convenience; downloads go ahead without it.
        let history = match Store::open(&store_dir).await {
            Ok(store) => Some(Arc::new(Mutex::new(store))),
            Err(e) => {
                log::warn!("Download history disabled: {:#}", e);
                None
            }
        };

        let orchestrator = Orchestrator::new(
            Arc::new(TelegramSource::new(tg)),
            Arc::new(FsSink::new()),
            shutdown,
        )
        .with_history(history);

        Ok(App {
            config,
            orchestrator,
        })
    }
}
