//! In-memory collaborators for tests.

use crate::config::{ConfigDocument, ConfigStore};
use crate::error::DownloadError;
use crate::source::{
    ChatTarget, HistoryPage, HistorySource, MediaCandidate, MediaInfo, MediaKind, MediaStream,
    RemoteMessage, ResolvedChat,
};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn media_message(id: i64, kind: MediaKind) -> RemoteMessage {
    RemoteMessage {
        id,
        date: Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap() + chrono::Duration::minutes(id),
        media: Some(MediaInfo {
            kind,
            extension: Some("jpg".to_string()),
            file_name: None,
            mime_type: None,
            size: Some(media_bytes(id).len() as u64),
        }),
    }
}

pub fn text_message(id: i64) -> RemoteMessage {
    RemoteMessage {
        id,
        date: Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap() + chrono::Duration::minutes(id),
        media: None,
    }
}

pub fn media_bytes(id: i64) -> Vec<u8> {
    format!("media-{id}").into_bytes()
}

#[derive(Default)]
struct Counters {
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

struct InFlight(Arc<Counters>);

impl InFlight {
    fn enter(counters: &Arc<Counters>) -> Self {
        let now = counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        counters.max_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlight(Arc::clone(counters))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

type OpenHook = Box<dyn Fn(i64) + Send + Sync>;

/// Scripted chat history. Chats are keyed by their `chat_id` display form.
#[derive(Default)]
pub struct FakeSource {
    chats: Mutex<HashMap<String, BTreeMap<i64, RemoteMessage>>>,
    inaccessible: Mutex<HashSet<String>>,
    /// Remaining failures per message id.
    failures: Mutex<HashMap<i64, usize>>,
    /// Remaining failures of `get_messages`.
    lookup_failures: AtomicUsize,
    transfer_time: Duration,
    counters: Arc<Counters>,
    opened: Mutex<Vec<i64>>,
    opened_at: Mutex<Vec<tokio::time::Instant>>,
    pages: AtomicUsize,
    on_open: Mutex<Option<OpenHook>>,
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_transfer_time(mut self, transfer_time: Duration) -> Self {
        self.transfer_time = transfer_time;
        self
    }

    /// Add a message to the default chat `1`.
    pub fn add(&self, msg: &RemoteMessage) {
        self.add_to("1", msg);
    }

    pub fn add_to(&self, chat: &str, msg: &RemoteMessage) {
        self.chats
            .lock()
            .unwrap()
            .entry(chat.to_string())
            .or_default()
            .insert(msg.id, msg.clone());
    }

    pub fn deny(&self, chat: &str) {
        self.inaccessible.lock().unwrap().insert(chat.to_string());
    }

    pub fn fail_always(&self, id: i64) {
        self.failures.lock().unwrap().insert(id, usize::MAX);
    }

    pub fn fail_times(&self, id: i64, times: usize) {
        self.failures.lock().unwrap().insert(id, times);
    }

    pub fn fail_lookups(&self, times: usize) {
        self.lookup_failures.store(times, Ordering::SeqCst);
    }

    pub fn on_open(&self, hook: impl Fn(i64) + Send + Sync + 'static) {
        *self.on_open.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn max_in_flight(&self) -> usize {
        self.counters.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn opened(&self) -> Vec<i64> {
        self.opened.lock().unwrap().clone()
    }

    pub fn opened_at(&self) -> Vec<tokio::time::Instant> {
        self.opened_at.lock().unwrap().clone()
    }

    /// Number of forward history pages served.
    pub fn pages_served(&self) -> usize {
        self.pages.load(Ordering::SeqCst)
    }

    fn check_access(&self, chat: &ChatTarget) -> Result<String, DownloadError> {
        let key = chat.chat_id.to_string();
        if self.inaccessible.lock().unwrap().contains(&key) {
            return Err(DownloadError::Authorization(format!("CHANNEL_PRIVATE ({key})")));
        }
        Ok(key)
    }
}

#[async_trait]
impl HistorySource for FakeSource {
    async fn resolve(&self, chat: &ChatTarget) -> Result<ResolvedChat, DownloadError> {
        self.check_access(chat)?;
        Ok(ResolvedChat { title: None })
    }

    async fn list_messages(
        &self,
        chat: &ChatTarget,
        after_id: i64,
        limit: usize,
    ) -> Result<HistoryPage, DownloadError> {
        let key = self.check_access(chat)?;
        self.pages.fetch_add(1, Ordering::SeqCst);
        let chats = self.chats.lock().unwrap();
        let messages: Vec<RemoteMessage> = chats
            .get(&key)
            .map(|history| {
                history
                    .range(after_id + 1..)
                    .take(limit)
                    .map(|(_, m)| m.clone())
                    .collect()
            })
            .unwrap_or_default();
        Ok(HistoryPage::from_messages(messages))
    }

    async fn get_messages(
        &self,
        chat: &ChatTarget,
        ids: &[i64],
    ) -> Result<Vec<RemoteMessage>, DownloadError> {
        let key = self.check_access(chat)?;
        let failing = self
            .lookup_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(DownloadError::Transport("timeout".into()));
        }
        let chats = self.chats.lock().unwrap();
        Ok(ids
            .iter()
            .filter_map(|id| chats.get(&key).and_then(|h| h.get(id)).cloned())
            .collect())
    }

    async fn open_media_stream(
        &self,
        chat: &ChatTarget,
        candidate: &MediaCandidate,
    ) -> Result<MediaStream, DownloadError> {
        self.check_access(chat)?;
        let id = candidate.message_id;
        self.opened.lock().unwrap().push(id);
        self.opened_at.lock().unwrap().push(tokio::time::Instant::now());
        if let Some(hook) = self.on_open.lock().unwrap().as_ref() {
            hook(id);
        }
        {
            let mut failures = self.failures.lock().unwrap();
            if let Some(left) = failures.get_mut(&id) {
                if *left > 0 {
                    *left = left.saturating_sub(1);
                    return Err(DownloadError::Transport(format!("timeout fetching {id}")));
                }
            }
        }

        let guard = InFlight::enter(&self.counters);
        let transfer_time = self.transfer_time;
        let stream = futures::stream::once(async move {
            let _guard = guard;
            if !transfer_time.is_zero() {
                tokio::time::sleep(transfer_time).await;
            }
            Ok(media_bytes(id))
        });
        Ok(stream.boxed())
    }
}

/// Configuration store that keeps the last saved document in memory.
pub struct MemoryConfigStore {
    doc: Mutex<ConfigDocument>,
    saves: AtomicUsize,
}

impl MemoryConfigStore {
    pub fn new(doc: ConfigDocument) -> Self {
        Self {
            doc: Mutex::new(doc),
            saves: AtomicUsize::new(0),
        }
    }

    pub fn current(&self) -> ConfigDocument {
        self.doc.lock().unwrap().clone()
    }

    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl ConfigStore for MemoryConfigStore {
    fn load(&self) -> Result<ConfigDocument, DownloadError> {
        Ok(self.current())
    }

    fn save(&self, doc: &ConfigDocument) -> Result<(), DownloadError> {
        *self.doc.lock().unwrap() = doc.clone();
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
