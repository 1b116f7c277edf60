use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;
use turso::{Builder, Connection, Database, Row, Value};

/// Download history database. Purely informational: the configuration
/// document stays the source of truth for what still needs fetching.
pub struct Store {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadRecord {
    pub id: i64,
    pub chat_id: String,
    pub message_id: i64,
    pub file_name: String,
    pub file_size: i64,
    pub file_path: String,
    pub media_type: String,
    pub downloaded_at: DateTime<Utc>,
}

pub struct RecordDownloadParams<'a> {
    pub chat_id: &'a str,
    pub message_id: i64,
    pub file_path: &'a Path,
    pub file_size: u64,
    pub media_type: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum SortColumn {
    #[default]
    Date,
    Size,
    Name,
    Chat,
}

impl SortColumn {
    fn column(&self) -> &'static str {
        match self {
            SortColumn::Date => "downloaded_at",
            SortColumn::Size => "file_size",
            SortColumn::Name => "file_name",
            SortColumn::Chat => "chat_id",
        }
    }
}

pub struct RecentDownloadsParams {
    pub limit: i64,
    pub offset: i64,
    /// Substring matched against file name and chat.
    pub search: Option<String>,
    pub media_type: Option<String>,
    pub sort: SortColumn,
    pub desc: bool,
}

impl Default for RecentDownloadsParams {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
            search: None,
            media_type: None,
            sort: SortColumn::Date,
            desc: true,
        }
    }
}

impl Store {
    pub async fn open(store_dir: &str) -> Result<Self> {
        std::fs::create_dir_all(store_dir)?;
        let db_path = Path::new(store_dir).join("history.db");
        let db_path_str = db_path.to_string_lossy();
        let db: Database = Builder::new_local(&db_path_str)
            .build()
            .await
            .context("Failed to open database")?;
        let conn = db.connect().context("Failed to connect to database")?;

        // PRAGMAs that set values return the new value, so use query and ignore results
        let _ = conn.query("PRAGMA journal_mode=WAL", ()).await;
        let _ = conn.query("PRAGMA busy_timeout=5000", ()).await;

        let store = Store { conn };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        self.conn
            .execute(
                "CREATE TABLE IF NOT EXISTS download_history (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    chat_id TEXT NOT NULL,
                    message_id INTEGER NOT NULL,
                    file_name TEXT NOT NULL DEFAULT '',
                    file_size INTEGER NOT NULL DEFAULT 0,
                    file_path TEXT NOT NULL DEFAULT '',
                    media_type TEXT NOT NULL DEFAULT '',
                    downloaded_at TEXT NOT NULL
                )",
                (),
            )
            .await
            .context("Failed to create download_history table")?;

        self.conn
            .execute(
                "CREATE INDEX IF NOT EXISTS idx_download_history_ts
                 ON download_history (downloaded_at)",
                (),
            )
            .await
            .context("Failed to create download_history index")?;
        Ok(())
    }

    pub async fn record_download(&self, p: RecordDownloadParams<'_>) -> Result<()> {
        let file_name = p
            .file_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let file_path = p.file_path.to_string_lossy();
        let ts_str = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO download_history
                    (chat_id, message_id, file_name, file_size, file_path, media_type, downloaded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                (
                    p.chat_id,
                    p.message_id,
                    file_name.as_str(),
                    p.file_size as i64,
                    file_path.as_ref(),
                    p.media_type,
                    ts_str.as_str(),
                ),
            )
            .await?;
        Ok(())
    }

    /// One page of history plus the total number of matching rows.
    pub async fn recent_downloads(
        &self,
        p: &RecentDownloadsParams,
    ) -> Result<(Vec<DownloadRecord>, i64)> {
        let mut conditions = vec!["1=1".to_string()];
        let mut params: Vec<Value> = Vec::new();

        if let Some(search) = p.search.as_deref().filter(|s| !s.is_empty()) {
            params.push(Value::Text(format!("%{}%", search)));
            let idx = params.len();
            conditions.push(format!("(file_name LIKE ?{idx} OR chat_id LIKE ?{idx})"));
        }
        if let Some(media_type) = p.media_type.as_deref().filter(|s| !s.is_empty()) {
            params.push(Value::Text(media_type.to_string()));
            conditions.push(format!("media_type = ?{}", params.len()));
        }
        let where_clause = conditions.join(" AND ");

        let count_sql = format!("SELECT COUNT(*) FROM download_history WHERE {}", where_clause);
        let mut rows = self
            .conn
            .query(&count_sql, turso::params_from_iter(params.clone()))
            .await?;
        let total: i64 = match rows.next().await? {
            Some(row) => row.get(0)?,
            None => 0,
        };

        params.push(Value::Integer(p.limit));
        let limit_idx = params.len();
        params.push(Value::Integer(p.offset));
        let offset_idx = params.len();
        let sql = format!(
            "SELECT id, chat_id, message_id, file_name, file_size, file_path, media_type, downloaded_at
             FROM download_history
             WHERE {} ORDER BY {} {}, id {} LIMIT ?{} OFFSET ?{}",
            where_clause,
            p.sort.column(),
            if p.desc { "DESC" } else { "ASC" },
            if p.desc { "DESC" } else { "ASC" },
            limit_idx,
            offset_idx
        );
        let mut rows = self
            .conn
            .query(&sql, turso::params_from_iter(params))
            .await?;

        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            records.push(row_to_record(&row)?);
        }
        Ok((records, total))
    }

    /// Delete every history row. Returns the number removed.
    pub async fn reset(&self) -> Result<u64> {
        let affected = self
            .conn
            .execute("DELETE FROM download_history", ())
            .await?;
        Ok(affected)
    }
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn row_to_record(row: &Row) -> Result<DownloadRecord> {
    Ok(DownloadRecord {
        id: row.get(0)?,
        chat_id: row.get(1)?,
        message_id: row.get(2)?,
        file_name: row.get(3)?,
        file_size: row.get(4)?,
        file_path: row.get(5)?,
        media_type: row.get(6)?,
        downloaded_at: row.get::<String>(7).map(|s| parse_ts(&s))?,
    })
}
