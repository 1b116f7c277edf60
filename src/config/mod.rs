//! Configuration document and its persisted store.
//!
//! The document mirrors `config.yaml`: global settings, Telegram credentials
//! and one record per chat. Keys this program does not know about are kept in
//! `extra` so writing state back never drops a user's settings.

pub mod resolve;

use crate::error::DownloadError;
use crate::source::{ChatId, ChatTarget, MediaKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub use resolve::{EffectiveChatConfig, RunSettings};

/// Options that may be set globally and overridden per chat.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_types: Option<Vec<MediaKind>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_formats: Option<BTreeMap<MediaKind, Vec<String>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_directory: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_messages: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_concurrent_downloads: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_delay: Option<DelaySetting>,
}

/// `download_delay` as written: seconds, or a `[min, max]` range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DelaySetting {
    Fixed(f64),
    Range(Vec<f64>),
}

/// What happens to the watermark when an item fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPolicy {
    /// The failed id goes to `ids_to_retry` and the watermark moves past it.
    #[default]
    Defer,
    /// The failed id is a gap; the watermark stops right before it.
    Block,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatEntry {
    #[serde(alias = "id")]
    pub chat_id: ChatId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub last_read_message_id: i64,
    #[serde(default)]
    pub ids_to_retry: Vec<i64>,
    #[serde(flatten)]
    pub overrides: Settings,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

impl ChatEntry {
    pub fn new(chat_id: ChatId) -> Self {
        Self {
            chat_id,
            name: None,
            last_read_message_id: 0,
            ids_to_retry: Vec::new(),
            overrides: Settings::default(),
            extra: BTreeMap::new(),
        }
    }

    pub fn target(&self) -> ChatTarget {
        ChatTarget {
            chat_id: self.chat_id.clone(),
            name: self.name.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_id: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_chats: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pagination_limit: Option<i64>,
    /// Minutes between passes; 0 runs once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_interval: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_transfer_attempts: Option<i64>,
    /// Seconds to wait between transfer attempts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_backoff: Option<f64>,
    #[serde(flatten)]
    pub settings: Settings,
    #[serde(default)]
    pub chats: Vec<ChatEntry>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

impl ConfigDocument {
    pub fn from_yaml(text: &str) -> Result<Self, DownloadError> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text).map_err(|e| DownloadError::config(e.to_string()))
    }

    pub fn to_yaml(&self) -> Result<String, DownloadError> {
        serde_yaml::to_string(self).map_err(|e| DownloadError::config(e.to_string()))
    }
}

/// Durable home of the configuration document.
pub trait ConfigStore: Send + Sync {
    fn load(&self) -> Result<ConfigDocument, DownloadError>;
    fn save(&self, doc: &ConfigDocument) -> Result<(), DownloadError>;
}

/// `config.yaml` on disk. Saves go through a sibling temporary file and a
/// rename, so readers see either the old or the new document.
pub struct YamlFileStore {
    path: PathBuf,
}

impl YamlFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "config.yaml".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl ConfigStore for YamlFileStore {
    fn load(&self) -> Result<ConfigDocument, DownloadError> {
        let text = std::fs::read_to_string(&self.path)
            .map_err(|e| DownloadError::filesystem(&self.path, e))?;
        ConfigDocument::from_yaml(&text)
    }

    fn save(&self, doc: &ConfigDocument) -> Result<(), DownloadError> {
        let text = doc.to_yaml()?;
        let tmp = self.temp_path();
        std::fs::write(&tmp, text).map_err(|e| DownloadError::filesystem(&tmp, e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| DownloadError::filesystem(&self.path, e))?;
        log::debug!("Saved configuration to {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
api_id: 123
api_hash: hasw5Tgawsuj67
media_types: [audio, voice]
file_formats:
  audio: [all]
  video: [mp4, MKV]
download_delay: [1, 3]
parallel_chats: true
theme: dark
chats:
  - chat_id: 8654123
    last_read_message_id: 10
    ids_to_retry: [4, 7]
    max_messages: 5
    note: keep me
  - id: some_channel
    name: Pics
    download_delay: 2
"#;

    #[test]
    fn test_parse_document() {
        let doc = ConfigDocument::from_yaml(SAMPLE).unwrap();
        assert_eq!(doc.api_id, Some(123));
        assert_eq!(doc.parallel_chats, Some(true));
        assert_eq!(
            doc.settings.media_types,
            Some(vec![MediaKind::Audio, MediaKind::Voice])
        );
        assert_eq!(
            doc.settings.download_delay,
            Some(DelaySetting::Range(vec![1.0, 3.0]))
        );
        assert_eq!(doc.chats.len(), 2);
        assert_eq!(doc.chats[0].chat_id, ChatId::Id(8654123));
        assert_eq!(doc.chats[0].ids_to_retry, vec![4, 7]);
        assert_eq!(doc.chats[0].overrides.max_messages, Some(5));
        assert_eq!(doc.chats[1].chat_id, ChatId::Username("some_channel".into()));
        assert_eq!(doc.chats[1].last_read_message_id, 0);
        assert_eq!(
            doc.chats[1].overrides.download_delay,
            Some(DelaySetting::Fixed(2.0))
        );
    }

    #[test]
    fn test_unknown_keys_survive_round_trip() {
        let doc = ConfigDocument::from_yaml(SAMPLE).unwrap();
        assert!(doc.extra.contains_key("theme"));
        assert!(doc.chats[0].extra.contains_key("note"));
        assert!(!doc.extra.contains_key("media_types"));

        let again = ConfigDocument::from_yaml(&doc.to_yaml().unwrap()).unwrap();
        assert_eq!(again, doc);
    }

    #[test]
    fn test_empty_document() {
        let doc = ConfigDocument::from_yaml("").unwrap();
        assert!(doc.chats.is_empty());
        assert!(ConfigDocument::from_yaml("chats: 5").is_err());
    }

    #[test]
    fn test_file_store_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, SAMPLE).unwrap();

        let store = YamlFileStore::new(&path);
        let mut doc = store.load().unwrap();
        doc.chats[0].last_read_message_id = 99;
        doc.chats[0].ids_to_retry.clear();
        store.save(&doc).unwrap();

        let reloaded = store.load().unwrap();
        assert_eq!(reloaded.chats[0].last_read_message_id, 99);
        assert!(reloaded.chats[0].ids_to_retry.is_empty());
        assert!(!store.temp_path().exists());
    }

    #[test]
    fn test_file_store_missing_file() {
        let store = YamlFileStore::new("/nonexistent/path/config.yaml");
        assert!(matches!(
            store.load(),
            Err(DownloadError::Filesystem { .. })
        ));
    }
}
