use crate::error::DownloadError;
use crate::source::{
    ChatId, ChatTarget, HistoryPage, HistorySource, MediaCandidate, MediaInfo, MediaKind,
    MediaStream, RemoteMessage, ResolvedChat,
};
use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use grammers_client::types::{Media, Message, Peer};
use grammers_client::{Client, PeerMap};
use grammers_mtsender::{InvocationError, SenderPool};
use grammers_session::defs::PeerRef;
use grammers_session::storages::SqliteSession;
use grammers_tl_types as tl;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub const DEFAULT_API_ID: i32 = 32529142;

/// RPC errors after which the chat as a whole cannot be read.
const INACCESSIBLE: &[&str] = &[
    "CHANNEL_PRIVATE",
    "CHANNEL_INVALID",
    "CHAT_FORBIDDEN",
    "CHAT_ADMIN_REQUIRED",
    "PEER_ID_INVALID",
    "USER_BANNED_IN_CHANNEL",
    "CHAT_ID_INVALID",
    "USERNAME_NOT_OCCUPIED",
    "USERNAME_INVALID",
];

/// A connected Telegram client with its pool runner handle.
pub struct TgClient {
    pub client: Client,
    pool_handle: tokio::task::JoinHandle<()>,
}

impl TgClient {
    /// Connect to Telegram using a SQLite session file.
    pub fn connect(session_path: &str, api_id: i32) -> Result<Self> {
        let session = Arc::new(
            SqliteSession::open(session_path)
                .map_err(|e| anyhow::anyhow!("Failed to open session: {}", e))?,
        );

        let pool = SenderPool::new(Arc::clone(&session) as Arc<SqliteSession>, api_id);
        let client = Client::new(&pool);

        // Updates are not consumed by the downloader.
        let SenderPool {
            runner, updates: _, ..
        } = pool;

        let pool_handle = tokio::spawn(async move {
            runner.run().await;
        });

        Ok(TgClient {
            client,
            pool_handle,
        })
    }
}

impl Drop for TgClient {
    fn drop(&mut self) {
        self.client.disconnect();
        self.pool_handle.abort();
    }
}

/// `messages.getHistory` returns at most this many messages per call.
const MAX_HISTORY_PAGE: usize = 100;

/// [`HistorySource`] backed by a logged-in grammers client.
pub struct TelegramSource {
    tg: TgClient,
    peers: Mutex<HashMap<String, (PeerRef, Option<String>)>>,
    /// Media handles from each chat's latest listing, keyed by chat and
    /// message id. A download needs the original file reference; the entry is
    /// taken by the download and the rest is replaced by the next listing.
    media: Mutex<PageMedia<Media>>,
}

impl TelegramSource {
    pub fn new(tg: TgClient) -> Self {
        Self {
            tg,
            peers: Mutex::new(HashMap::new()),
            media: Mutex::new(PageMedia::default()),
        }
    }

    async fn peer(&self, chat: &ChatTarget) -> Result<(PeerRef, Option<String>), DownloadError> {
        let key = chat.chat_id.to_string();
        if let Some(found) = lock(&self.peers)?.get(&key).cloned() {
            return Ok(found);
        }

        let found = match &chat.chat_id {
            ChatId::Username(name) => {
                let name = name.trim_start_matches('@');
                match self.tg.client.resolve_username(name).await.map_err(classify)? {
                    Some(peer) => (PeerRef::from(&peer), peer_title(&peer)),
                    None => {
                        return Err(DownloadError::Authorization(format!(
                            "USERNAME_NOT_OCCUPIED (@{})",
                            name
                        )))
                    }
                }
            }
            ChatId::Id(id) => {
                let wanted = bare_id(*id);
                let mut dialogs = self.tg.client.iter_dialogs();
                let mut found = None;
                while let Some(dialog) = dialogs.next().await.map_err(classify)? {
                    let peer = dialog.peer();
                    if peer.id().bare_id() == wanted {
                        found = Some((PeerRef::from(peer), peer_title(peer)));
                        break;
                    }
                }
                found.ok_or_else(|| {
                    DownloadError::Authorization(format!("PEER_ID_INVALID ({} not in dialogs)", id))
                })?
            }
        };

        lock(&self.peers)?.insert(key, found.clone());
        Ok(found)
    }

    /// Convert a listing and make it the chat's cached media.
    fn remember_page(
        &self,
        chat: &ChatTarget,
        messages: Vec<Message>,
    ) -> Result<Vec<RemoteMessage>, DownloadError> {
        let key = chat.chat_id.to_string();
        let mut held = Vec::new();
        let listed = messages
            .iter()
            .map(|msg| {
                let id = msg.id() as i64;
                let media = msg.media().and_then(|media| {
                    let info = media_info(&media)?;
                    held.push((id, media));
                    Some(info)
                });
                RemoteMessage {
                    id,
                    date: msg.date(),
                    media,
                }
            })
            .collect();
        lock(&self.media)?.replace(&key, held);
        Ok(listed)
    }

    async fn fetch_by_id(&self, peer: PeerRef, ids: &[i64]) -> Result<Vec<Message>, DownloadError> {
        let ids: Vec<i32> = ids
            .iter()
            .filter_map(|&id| i32::try_from(id).ok())
            .collect();
        let found = self
            .tg
            .client
            .get_messages_by_id(peer, &ids)
            .await
            .map_err(classify)?;
        Ok(found.into_iter().flatten().collect())
    }

    /// Up to `limit` messages right after `after_id`, newest first as the
    /// server returns them.
    async fn history_after(
        &self,
        peer: PeerRef,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<Message>, DownloadError> {
        let request = history_request(peer, after_id, limit);
        let after = request.min_id;

        use tl::enums::messages::Messages;
        let (messages, users, chats) = match self.tg.client.invoke(&request).await.map_err(classify)? {
            Messages::Messages(m) => (m.messages, m.users, m.chats),
            Messages::Slice(m) => (m.messages, m.users, m.chats),
            Messages::ChannelMessages(m) => (m.messages, m.users, m.chats),
            Messages::NotModified(_) => {
                return Err(DownloadError::Transport(
                    "history reported as not modified".to_string(),
                ))
            }
        };
        let peers = PeerMap::new(users, chats);
        Ok(messages
            .into_iter()
            .map(|m| Message::from_raw(&self.tg.client, m, Some(peer), &peers))
            .filter(|m| m.id() > after)
            .collect())
    }
}

#[async_trait]
impl HistorySource for TelegramSource {
    async fn resolve(&self, chat: &ChatTarget) -> Result<ResolvedChat, DownloadError> {
        let (_, title) = self.peer(chat).await?;
        Ok(ResolvedChat { title })
    }

    async fn list_messages(
        &self,
        chat: &ChatTarget,
        after_id: i64,
        limit: usize,
    ) -> Result<HistoryPage, DownloadError> {
        let (peer, _) = self.peer(chat).await?;
        let found = self.history_after(peer, after_id, limit).await?;
        // The server hands back the oldest messages above `after_id`, so
        // every id up to the last one returned is accounted for.
        Ok(HistoryPage::from_messages(self.remember_page(chat, found)?))
    }

    async fn get_messages(
        &self,
        chat: &ChatTarget,
        ids: &[i64],
    ) -> Result<Vec<RemoteMessage>, DownloadError> {
        let (peer, _) = self.peer(chat).await?;
        let found = self.fetch_by_id(peer, ids).await?;
        self.remember_page(chat, found)
    }

    async fn open_media_stream(
        &self,
        chat: &ChatTarget,
        candidate: &MediaCandidate,
    ) -> Result<MediaStream, DownloadError> {
        let cached = lock(&self.media)?
            .take(&chat.chat_id.to_string(), candidate.message_id);
        let media = match cached {
            Some(media) => media,
            // Taken by an earlier attempt: fetch a fresh file reference.
            None => {
                let (peer, _) = self.peer(chat).await?;
                self.fetch_by_id(peer, &[candidate.message_id])
                    .await?
                    .first()
                    .and_then(Message::media)
                    .ok_or_else(|| {
                        DownloadError::Transport(format!(
                            "message {} no longer carries media",
                            candidate.message_id
                        ))
                    })?
            }
        };

        let download = self.tg.client.iter_download(&media);
        let stream = futures::stream::unfold(Some(download), |state| async move {
            let mut download = state?;
            match download.next().await {
                Ok(Some(chunk)) => Some((Ok(chunk), Some(download))),
                Ok(None) => None,
                Err(e) => Some((Err(classify(e)), None)),
            }
        });
        Ok(stream.boxed())
    }
}

/// Media handles from the latest listing of each chat. A download takes its
/// entry, so at most one page per chat is held.
#[derive(Debug)]
struct PageMedia<V> {
    entries: HashMap<(String, i64), V>,
}

impl<V> Default for PageMedia<V> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<V> PageMedia<V> {
    fn replace(&mut self, chat: &str, listed: Vec<(i64, V)>) {
        self.entries.retain(|(cached_chat, _), _| cached_chat != chat);
        self.entries
            .extend(listed.into_iter().map(|(id, v)| ((chat.to_string(), id), v)));
    }

    fn take(&mut self, chat: &str, message_id: i64) -> Option<V> {
        self.entries.remove(&(chat.to_string(), message_id))
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// The oldest `limit` messages with id above `after_id`: start just past it
/// and shift the window forward by a full page.
fn history_request(
    peer: PeerRef,
    after_id: i64,
    limit: usize,
) -> tl::functions::messages::GetHistory {
    let after = i32::try_from(after_id.max(0)).unwrap_or(i32::MAX);
    let limit = limit.clamp(1, MAX_HISTORY_PAGE) as i32;
    tl::functions::messages::GetHistory {
        peer: peer.into(),
        offset_id: after.saturating_add(1),
        offset_date: 0,
        add_offset: -limit,
        limit,
        max_id: 0,
        min_id: after,
        hash: 0,
    }
}

fn lock<T>(m: &Mutex<T>) -> Result<std::sync::MutexGuard<'_, T>, DownloadError> {
    m.lock()
        .map_err(|_| DownloadError::Transport("telegram cache lock poisoned".to_string()))
}

fn classify(e: InvocationError) -> DownloadError {
    match &e {
        InvocationError::Rpc(rpc) if INACCESSIBLE.contains(&rpc.name.as_str()) => {
            DownloadError::Authorization(e.to_string())
        }
        _ => DownloadError::Transport(e.to_string()),
    }
}

/// Configured ids may use the Bot API form (`-100…` for channels, negative
/// for basic groups); dialogs are matched on the bare id.
fn bare_id(id: i64) -> i64 {
    let s = id.to_string();
    match s.strip_prefix("-100") {
        Some(rest) if !rest.is_empty() => rest.parse().unwrap_or(id.abs()),
        _ => id.abs(),
    }
}

fn peer_title(peer: &Peer) -> Option<String> {
    let title = match peer {
        Peer::User(user) => user.full_name(),
        Peer::Group(group) => group.title().map(|s| s.to_string()).unwrap_or_default(),
        Peer::Channel(channel) => channel.title().to_string(),
    };
    (!title.trim().is_empty()).then_some(title)
}

fn media_info(media: &Media) -> Option<MediaInfo> {
    match media {
        Media::Photo(_) => Some(MediaInfo {
            kind: MediaKind::Photo,
            extension: Some("jpg".to_string()),
            file_name: None,
            mime_type: Some("image/jpeg".to_string()),
            size: None,
        }),
        Media::Document(doc) => {
            let name = Some(doc.name()).filter(|n| !n.is_empty());
            let mime = doc.mime_type();
            let extension = name
                .and_then(|n| n.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase()))
                .or_else(|| mime.map(extension_from_mime));
            Some(MediaInfo {
                kind: kind_from_mime(mime, name),
                extension,
                file_name: name.map(str::to_string),
                mime_type: mime.map(str::to_string),
                size: u64::try_from(doc.size()).ok().filter(|&s| s > 0),
            })
        }
        _ => None,
    }
}

fn kind_from_mime(mime: Option<&str>, name: Option<&str>) -> MediaKind {
    let mime = mime.unwrap_or_default().to_ascii_lowercase();
    if mime.starts_with("video/") {
        MediaKind::Video
    } else if mime == "audio/ogg" && name.is_none() {
        MediaKind::Voice
    } else if mime.starts_with("audio/") {
        MediaKind::Audio
    } else {
        MediaKind::Document
    }
}

fn extension_from_mime(mime: &str) -> String {
    let mime = mime.to_ascii_lowercase();
    match mime.as_str() {
        "audio/mpeg" => "mp3".to_string(),
        "audio/mp4" | "audio/x-m4a" => "m4a".to_string(),
        "video/quicktime" => "mov".to_string(),
        "image/jpeg" => "jpg".to_string(),
        "text/plain" => "txt".to_string(),
        "application/octet-stream" => "bin".to_string(),
        other => other
            .rsplit('/')
            .next()
            .map(|sub| sub.trim_start_matches("x-").to_string())
            .unwrap_or_else(|| "bin".to_string()),
    }
}
