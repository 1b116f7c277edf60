//! Remote chat-history collaborator and the types that flow out of it.

use crate::error::DownloadError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Byte chunks of one attachment, in order.
pub type MediaStream = BoxStream<'static, Result<Vec<u8>, DownloadError>>;

/// Media kinds the downloader knows how to store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Audio,
    Document,
    Photo,
    Video,
    Voice,
    VideoNote,
}

impl MediaKind {
    pub const ALL: [MediaKind; 6] = [
        MediaKind::Audio,
        MediaKind::Document,
        MediaKind::Photo,
        MediaKind::Video,
        MediaKind::Voice,
        MediaKind::VideoNote,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Document => "document",
            MediaKind::Photo => "photo",
            MediaKind::Video => "video",
            MediaKind::Voice => "voice",
            MediaKind::VideoNote => "video_note",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Chat identifier as written in the configuration: numeric id or public username.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChatId {
    Id(i64),
    Username(String),
}

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatId::Id(id) => write!(f, "{}", id),
            ChatId::Username(name) => write!(f, "@{}", name.trim_start_matches('@')),
        }
    }
}

/// Identity of a remote chat for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatTarget {
    pub chat_id: ChatId,
    pub name: Option<String>,
}

impl ChatTarget {
    pub fn new(chat_id: ChatId) -> Self {
        Self {
            chat_id,
            name: None,
        }
    }

    /// Name fit for logs and directory names: display name, else the id.
    pub fn label(&self) -> String {
        match &self.name {
            Some(name) if !name.trim().is_empty() => name.clone(),
            _ => match &self.chat_id {
                ChatId::Id(id) => id.to_string(),
                ChatId::Username(name) => name.trim_start_matches('@').to_string(),
            },
        }
    }
}

impl fmt::Display for ChatTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} ({})", name, self.chat_id),
            None => write!(f, "{}", self.chat_id),
        }
    }
}

/// Attachment metadata known before any bytes are transferred.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaInfo {
    pub kind: MediaKind,
    /// Lower-case extension without the dot, if one could be derived.
    pub extension: Option<String>,
    pub file_name: Option<String>,
    pub mime_type: Option<String>,
    pub size: Option<u64>,
}

/// One message as listed by the remote service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMessage {
    pub id: i64,
    pub date: DateTime<Utc>,
    pub media: Option<MediaInfo>,
}

impl RemoteMessage {
    /// The message as a download candidate, if it carries an attachment.
    pub fn candidate(&self) -> Option<MediaCandidate> {
        self.media.as_ref().map(|media| MediaCandidate {
            message_id: self.id,
            date: self.date,
            media: media.clone(),
        })
    }
}

/// A fetched message carrying an attachment, prior to admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaCandidate {
    pub message_id: i64,
    pub date: DateTime<Utc>,
    pub media: MediaInfo,
}

impl MediaCandidate {
    pub fn kind(&self) -> MediaKind {
        self.media.kind
    }
}

/// One page of history, ascending by id.
#[derive(Debug, Clone, Default)]
pub struct HistoryPage {
    pub messages: Vec<RemoteMessage>,
    /// Highest id this page accounts for; ids up to it that are missing from
    /// `messages` do not exist. `None` when nothing newer exists.
    pub through_id: Option<i64>,
}

impl HistoryPage {
    /// Build a page whose coverage ends at its last message.
    pub fn from_messages(mut messages: Vec<RemoteMessage>) -> Self {
        messages.sort_by_key(|m| m.id);
        let through_id = messages.last().map(|m| m.id);
        Self {
            messages,
            through_id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedChat {
    pub title: Option<String>,
}

#[async_trait]
pub trait HistorySource: Send + Sync {
    /// Check the chat is reachable and look up its title.
    async fn resolve(&self, chat: &ChatTarget) -> Result<ResolvedChat, DownloadError>;

    /// Messages with id greater than `after_id`, oldest first, at most `limit`.
    async fn list_messages(
        &self,
        chat: &ChatTarget,
        after_id: i64,
        limit: usize,
    ) -> Result<HistoryPage, DownloadError>;

    /// Specific messages by id; ids that no longer exist are left out.
    async fn get_messages(
        &self,
        chat: &ChatTarget,
        ids: &[i64],
    ) -> Result<Vec<RemoteMessage>, DownloadError>;

    async fn open_media_stream(
        &self,
        chat: &ChatTarget,
        candidate: &MediaCandidate,
    ) -> Result<MediaStream, DownloadError>;
}
