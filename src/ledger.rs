//! Per-chat record of what has been downloaded, what must be retried, and how
//! far the watermark may safely advance.

use crate::config::{ChatEntry, ConfigDocument, ConfigStore, RetryPolicy};
use crate::error::DownloadError;
use crate::filter::Rejection;
use crate::source::MediaKind;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

/// A file that landed on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedFile {
    pub path: PathBuf,
    pub bytes: u64,
    pub kind: MediaKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The message carries nothing downloadable.
    NoMedia,
    /// The message no longer exists on the remote side.
    Missing,
    Filtered(Rejection),
    /// The target already holds the same content.
    AlreadyExists(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    Succeeded { message_id: i64, file: SavedFile },
    Skipped { message_id: i64, reason: SkipReason },
    Failed { message_id: i64, reason: String },
}

impl DownloadOutcome {
    pub fn message_id(&self) -> i64 {
        match self {
            DownloadOutcome::Succeeded { message_id, .. }
            | DownloadOutcome::Skipped { message_id, .. }
            | DownloadOutcome::Failed { message_id, .. } => *message_id,
        }
    }
}

/// Persisted per-chat state plus the working set of the current batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatState {
    pub last_read_message_id: i64,
    pub ids_to_retry: BTreeSet<i64>,
    /// Cleared at every commit.
    pub downloaded_ids: BTreeSet<i64>,
}

/// Writes chat state back into the shared configuration document.
///
/// Chats never share a record; the lock only serialises whole-document saves.
pub struct StatePersister {
    store: Arc<dyn ConfigStore>,
    doc: Mutex<ConfigDocument>,
}

impl StatePersister {
    pub fn new(store: Arc<dyn ConfigStore>, doc: ConfigDocument) -> Self {
        Self {
            store,
            doc: Mutex::new(doc),
        }
    }

    /// Saves run on the blocking pool, one at a time, in the order chats
    /// commit.
    pub async fn persist(&self, index: usize, state: &ChatState) -> Result<(), DownloadError> {
        let mut doc = self.doc.lock().await;
        let entry = doc.chats.get_mut(index).ok_or_else(|| {
            DownloadError::config(format!("no chat at position {} in configuration", index))
        })?;
        entry.last_read_message_id = state.last_read_message_id;
        entry.ids_to_retry = state.ids_to_retry.iter().copied().collect();

        let snapshot = doc.clone();
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || store.save(&snapshot))
            .await
            .map_err(|e| DownloadError::config(format!("saving configuration failed: {}", e)))?
    }
}

pub struct ChatLedger {
    index: usize,
    policy: RetryPolicy,
    state: ChatState,
    /// Highest id forward pagination has fully accounted for this run.
    covered_through: i64,
    /// Dispatched, outcome not yet recorded.
    pending: BTreeSet<i64>,
    /// Ids taken from `ids_to_retry` and attempted this run.
    replayed: BTreeSet<i64>,
}

impl ChatLedger {
    pub fn new(index: usize, entry: &ChatEntry, policy: RetryPolicy) -> Self {
        let state = ChatState {
            last_read_message_id: entry.last_read_message_id.max(0),
            ids_to_retry: entry.ids_to_retry.iter().copied().collect(),
            downloaded_ids: BTreeSet::new(),
        };
        Self {
            index,
            policy,
            covered_through: state.last_read_message_id,
            state,
            pending: BTreeSet::new(),
            replayed: BTreeSet::new(),
        }
    }

    pub fn state(&self) -> &ChatState {
        &self.state
    }

    pub fn watermark(&self) -> i64 {
        self.state.last_read_message_id
    }

    /// Where forward pagination resumes. Ahead of the watermark when a
    /// blocking failure holds the watermark back.
    pub fn cursor(&self) -> i64 {
        self.covered_through
    }

    /// Retry backlog, oldest first.
    pub fn retry_ids(&self) -> Vec<i64> {
        self.state.ids_to_retry.iter().copied().collect()
    }

    pub fn is_downloaded(&self, id: i64) -> bool {
        self.state.downloaded_ids.contains(&id)
    }

    pub fn mark_replayed(&mut self, id: i64) {
        self.replayed.insert(id);
    }

    pub fn was_replayed(&self, id: i64) -> bool {
        self.replayed.contains(&id)
    }

    /// Note that `id` has been handed to the scheduler.
    pub fn expect(&mut self, id: i64) {
        self.pending.insert(id);
    }

    pub fn record(&mut self, outcome: &DownloadOutcome) {
        let id = outcome.message_id();
        self.pending.remove(&id);
        match outcome {
            DownloadOutcome::Succeeded { .. } => {
                self.state.downloaded_ids.insert(id);
                self.state.ids_to_retry.remove(&id);
            }
            DownloadOutcome::Skipped { .. } => {
                self.state.ids_to_retry.remove(&id);
            }
            DownloadOutcome::Failed { .. } => {
                self.state.ids_to_retry.insert(id);
            }
        }
    }

    /// Forward pagination has recorded an outcome, or established absence,
    /// for every id up to `through_id`.
    pub fn cover(&mut self, through_id: i64) {
        self.covered_through = self.covered_through.max(through_id);
    }

    /// Highest id reachable from the stored watermark without crossing an
    /// unhandled id. Never lower than the stored watermark.
    pub fn compute_contiguous_watermark(&self) -> i64 {
        let current = self.state.last_read_message_id;
        let pending_gap = self.pending.range(current + 1..).next().copied();
        let retry_gap = match self.policy {
            RetryPolicy::Defer => None,
            RetryPolicy::Block => self.state.ids_to_retry.range(current + 1..).next().copied(),
        };
        let limit = [pending_gap, retry_gap]
            .into_iter()
            .flatten()
            .min()
            .map(|gap| gap - 1)
            .unwrap_or(i64::MAX);
        self.covered_through.min(limit).max(current)
    }

    /// Advance the watermark, persist, and drop the batch working set.
    pub async fn commit(&mut self, persister: &StatePersister) -> Result<i64, DownloadError> {
        let watermark = self.compute_contiguous_watermark();
        self.state.last_read_message_id = watermark;
        persister.persist(self.index, &self.state).await?;
        self.state.downloaded_ids.clear();
        Ok(watermark)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::ChatId;
    use crate::testing::MemoryConfigStore;

    fn saved(id: i64) -> DownloadOutcome {
        DownloadOutcome::Succeeded {
            message_id: id,
            file: SavedFile {
                path: PathBuf::from(format!("/tmp/{id}")),
                bytes: 1,
                kind: MediaKind::Photo,
            },
        }
    }

    fn skipped(id: i64) -> DownloadOutcome {
        DownloadOutcome::Skipped {
            message_id: id,
            reason: SkipReason::NoMedia,
        }
    }

    fn failed(id: i64) -> DownloadOutcome {
        DownloadOutcome::Failed {
            message_id: id,
            reason: "timeout".into(),
        }
    }

    fn setup(entry: ChatEntry, policy: RetryPolicy) -> (ChatLedger, StatePersister, Arc<MemoryConfigStore>) {
        let doc = ConfigDocument {
            chats: vec![entry.clone()],
            ..Default::default()
        };
        let store = Arc::new(MemoryConfigStore::new(doc.clone()));
        let persister = StatePersister::new(store.clone(), doc);
        (ChatLedger::new(0, &entry, policy), persister, store)
    }

    #[tokio::test]
    async fn test_all_handled_advances_to_coverage() {
        let (mut ledger, persister, store) = setup(ChatEntry::new(ChatId::Id(1)), RetryPolicy::Defer);
        for outcome in [saved(1), skipped(2), saved(3), skipped(4), saved(5)] {
            ledger.record(&outcome);
        }
        ledger.cover(5);
        assert_eq!(ledger.commit(&persister).await.unwrap(), 5);
        let doc = store.current();
        assert_eq!(doc.chats[0].last_read_message_id, 5);
        assert!(doc.chats[0].ids_to_retry.is_empty());
        assert!(ledger.state().downloaded_ids.is_empty());
    }

    #[tokio::test]
    async fn test_failure_is_deferred() {
        let (mut ledger, persister, store) = setup(ChatEntry::new(ChatId::Id(1)), RetryPolicy::Defer);
        for outcome in [saved(1), skipped(2), failed(3), skipped(4), saved(5)] {
            ledger.record(&outcome);
        }
        ledger.cover(5);
        assert_eq!(ledger.commit(&persister).await.unwrap(), 5);
        assert_eq!(store.current().chats[0].ids_to_retry, vec![3]);
    }

    #[tokio::test]
    async fn test_failure_blocks_watermark() {
        let (mut ledger, persister, store) = setup(ChatEntry::new(ChatId::Id(1)), RetryPolicy::Block);
        for outcome in [saved(1), skipped(2), failed(3), skipped(4), saved(5)] {
            ledger.record(&outcome);
        }
        ledger.cover(5);
        assert_eq!(ledger.commit(&persister).await.unwrap(), 2);
        assert_eq!(store.current().chats[0].ids_to_retry, vec![3]);

        // A later batch in the same run cannot jump the gap either.
        assert_eq!(ledger.cursor(), 5);
        ledger.record(&saved(6));
        ledger.cover(6);
        assert_eq!(ledger.commit(&persister).await.unwrap(), 2);
        assert_eq!(ledger.cursor(), 6);
    }

    #[test]
    fn test_pending_item_is_a_gap() {
        let (mut ledger, _persister, _store) = setup(ChatEntry::new(ChatId::Id(1)), RetryPolicy::Defer);
        ledger.expect(2);
        ledger.record(&saved(1));
        ledger.expect(3);
        ledger.record(&saved(3));
        ledger.cover(3);
        assert_eq!(ledger.compute_contiguous_watermark(), 1);
        ledger.record(&saved(2));
        assert_eq!(ledger.compute_contiguous_watermark(), 3);
    }

    #[tokio::test]
    async fn test_watermark_never_decreases() {
        let mut entry = ChatEntry::new(ChatId::Id(1));
        entry.last_read_message_id = 40;
        entry.ids_to_retry = vec![12];
        let (mut ledger, persister, store) = setup(entry, RetryPolicy::Block);
        // Replaying an old id below the watermark fails again.
        ledger.record(&failed(12));
        assert_eq!(ledger.commit(&persister).await.unwrap(), 40);
        assert_eq!(store.current().chats[0].last_read_message_id, 40);
        assert_eq!(store.current().chats[0].ids_to_retry, vec![12]);
    }

    #[tokio::test]
    async fn test_retry_cleared_by_later_success() {
        let mut entry = ChatEntry::new(ChatId::Id(1));
        entry.last_read_message_id = 10;
        entry.ids_to_retry = vec![3, 7];
        let (mut ledger, persister, store) = setup(entry, RetryPolicy::Defer);
        assert_eq!(ledger.retry_ids(), vec![3, 7]);
        ledger.record(&saved(7));
        ledger.record(&skipped(3));
        ledger.commit(&persister).await.unwrap();
        assert!(store.current().chats[0].ids_to_retry.is_empty());
        assert_eq!(store.saves(), 1);
    }

    #[tokio::test]
    async fn test_downloaded_set_cleared_on_commit() {
        let (mut ledger, persister, _store) = setup(ChatEntry::new(ChatId::Id(1)), RetryPolicy::Defer);
        ledger.record(&saved(1));
        assert!(ledger.is_downloaded(1));
        ledger.cover(1);
        ledger.commit(&persister).await.unwrap();
        assert!(!ledger.is_downloaded(1));
        assert_eq!(ledger.watermark(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_chats_both_persisted() {
        let doc = ConfigDocument {
            chats: vec![ChatEntry::new(ChatId::Id(1)), ChatEntry::new(ChatId::Id(2))],
            ..Default::default()
        };
        let store = Arc::new(MemoryConfigStore::new(doc.clone()));
        let persister = Arc::new(StatePersister::new(store.clone(), doc.clone()));

        let mut tasks = Vec::new();
        for (index, entry) in doc.chats.iter().enumerate() {
            let persister = Arc::clone(&persister);
            let mut ledger = ChatLedger::new(index, entry, RetryPolicy::Defer);
            let top = 10 * (index as i64 + 1);
            tasks.push(tokio::spawn(async move {
                for id in 1..=top {
                    ledger.record(&saved(id));
                    ledger.cover(id);
                    ledger.commit(&persister).await.unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let saved_doc = store.current();
        assert_eq!(saved_doc.chats[0].last_read_message_id, 10);
        assert_eq!(saved_doc.chats[1].last_read_message_id, 20);
        assert_eq!(store.saves(), 30);
    }
}
