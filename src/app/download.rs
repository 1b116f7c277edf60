//! Batch fetch loop and multi-chat coordinator.
//!
//! Each chat walks its history forward from the stored watermark one page at
//! a time: fetch, filter, download the admitted candidates as one batch,
//! then commit. Ids parked in `ids_to_retry` are replayed before forward
//! pagination starts.

use crate::config::{
    resolve, ChatEntry, ConfigDocument, ConfigStore, EffectiveChatConfig, RunSettings,
};
use crate::error::DownloadError;
use crate::filter::{CandidateFilter, Rejection};
use crate::ledger::{ChatLedger, DownloadOutcome, SavedFile, SkipReason, StatePersister};
use crate::scheduler::Scheduler;
use crate::shutdown::ShutdownController;
use crate::sink::MediaSink;
use crate::source::{ChatTarget, HistoryPage, HistorySource, MediaCandidate, RemoteMessage};
use crate::store::{RecordDownloadParams, Store};
use serde::Serialize;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Fetching,
    Filtering,
    Downloading,
    Persisting,
    Done,
    Interrupted,
}

/// How a chat run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunEnd {
    Done,
    Interrupted,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatReport {
    pub chat: String,
    pub downloaded: u64,
    pub skipped: u64,
    pub failed: u64,
    pub last_read_message_id: i64,
    pub ids_to_retry: Vec<i64>,
    pub end: RunEnd,
    /// Chat-level error that ended the run early.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ChatReport {
    fn new(target: &ChatTarget) -> Self {
        Self {
            chat: target.to_string(),
            downloaded: 0,
            skipped: 0,
            failed: 0,
            last_read_message_id: 0,
            ids_to_retry: Vec::new(),
            end: RunEnd::Done,
            error: None,
        }
    }

    fn count(&mut self, outcome: &DownloadOutcome) {
        match outcome {
            DownloadOutcome::Succeeded { .. } => self.downloaded += 1,
            DownloadOutcome::Skipped { .. } => self.skipped += 1,
            DownloadOutcome::Failed { .. } => self.failed += 1,
        }
    }
}

/// Result of filtering one fetched page.
struct Admission {
    candidates: Vec<MediaCandidate>,
    /// Set when `max_messages` cut the page short: the last id accounted for.
    truncated_at: Option<i64>,
}

/// Per-chat working state for one run.
struct ChatRun<'a> {
    config: &'a EffectiveChatConfig,
    ledger: ChatLedger,
    filter: CandidateFilter,
    report: ChatReport,
    phase: Phase,
}

impl<'a> ChatRun<'a> {
    fn enter(&mut self, next: Phase) {
        log::debug!(
            "Chat {}: {:?} -> {:?}",
            self.config.target,
            self.phase,
            next
        );
        self.phase = next;
    }

    fn record(&mut self, outcome: &DownloadOutcome) {
        self.ledger.record(outcome);
        self.report.count(outcome);
    }

    fn budget_spent(&self) -> bool {
        self.filter.remaining(self.config) == Some(0)
    }

    /// Apply the filter to a page in id order. Messages turned away for good
    /// are recorded as skipped right away; the first one refused only by the
    /// run budget ends the page.
    fn admit(&mut self, messages: Vec<RemoteMessage>, replay: bool) -> Admission {
        let mut candidates = Vec::new();
        for msg in messages {
            if !replay && self.ledger.was_replayed(msg.id) {
                continue;
            }
            let Some(candidate) = msg.candidate() else {
                self.record(&DownloadOutcome::Skipped {
                    message_id: msg.id,
                    reason: SkipReason::NoMedia,
                });
                continue;
            };
            let seen = self.ledger.is_downloaded(msg.id);
            match self.filter.admit(&candidate, self.config, seen) {
                Ok(()) => {
                    if replay {
                        self.ledger.mark_replayed(msg.id);
                    }
                    self.ledger.expect(msg.id);
                    candidates.push(candidate);
                }
                Err(Rejection::LimitReached) => {
                    return Admission {
                        candidates,
                        truncated_at: Some(msg.id - 1),
                    };
                }
                Err(rejection) => {
                    log::debug!("Message[{}]: skipped, {}", msg.id, rejection);
                    self.record(&DownloadOutcome::Skipped {
                        message_id: msg.id,
                        reason: SkipReason::Filtered(rejection),
                    });
                }
            }
        }
        Admission {
            candidates,
            truncated_at: None,
        }
    }
}

pub struct Orchestrator {
    source: Arc<dyn HistorySource>,
    scheduler: Scheduler,
    history: Option<Arc<Mutex<Store>>>,
    shutdown: ShutdownController,
}

impl Orchestrator {
    pub fn new(
        source: Arc<dyn HistorySource>,
        sink: Arc<dyn MediaSink>,
        shutdown: ShutdownController,
    ) -> Self {
        Self {
            scheduler: Scheduler::new(Arc::clone(&source), sink),
            source,
            history: None,
            shutdown,
        }
    }

    pub fn with_history(mut self, history: Option<Arc<Mutex<Store>>>) -> Self {
        self.history = history;
        self
    }

    /// Run passes until shutdown. With `once`, or with no refresh interval
    /// configured, a single pass is made. The configuration is reloaded
    /// before every pass.
    pub async fn run<F>(
        &self,
        store: Arc<dyn ConfigStore>,
        once: bool,
        mut on_pass: F,
    ) -> Result<(), DownloadError>
    where
        F: FnMut(&[ChatReport]),
    {
        loop {
            let doc = store.load()?;
            let settings = RunSettings::from_document(&doc)?;
            let reports = self.run_pass(Arc::clone(&store), doc).await?;
            on_pass(&reports);

            if once || settings.refresh_interval.is_zero() || self.shutdown.is_triggered() {
                return Ok(());
            }
            log::info!(
                "Next pass in {} minute(s)",
                settings.refresh_interval.as_secs() / 60
            );
            tokio::select! {
                _ = tokio::time::sleep(settings.refresh_interval) => {}
                _ = self.shutdown.cancelled() => return Ok(()),
            }
        }
    }

    /// One pass over every configured chat. Invalid settings for any chat
    /// fail the pass before a single chat starts.
    pub async fn run_pass(
        &self,
        store: Arc<dyn ConfigStore>,
        doc: ConfigDocument,
    ) -> Result<Vec<ChatReport>, DownloadError> {
        let configs = resolve::resolve_all(&doc)?;
        let settings = RunSettings::from_document(&doc)?;
        let persister = StatePersister::new(store, doc.clone());
        let chats = doc.chats.iter().zip(configs.iter()).enumerate();

        if settings.parallel_chats {
            let runs = chats.map(|(index, (entry, config))| {
                self.run_chat(index, entry, config, &persister)
            });
            return Ok(futures::future::join_all(runs).await);
        }

        let mut reports = Vec::with_capacity(configs.len());
        for (index, (entry, config)) in chats {
            if self.shutdown.is_triggered() {
                log::info!("Shutdown requested, not starting chat {}", config.target);
                break;
            }
            reports.push(self.run_chat(index, entry, config, &persister).await);
        }
        Ok(reports)
    }

    async fn run_chat(
        &self,
        index: usize,
        entry: &ChatEntry,
        config: &EffectiveChatConfig,
        persister: &StatePersister,
    ) -> ChatReport {
        let mut run = ChatRun {
            config,
            ledger: ChatLedger::new(index, entry, config.retry_policy),
            filter: CandidateFilter::new(),
            report: ChatReport::new(&config.target),
            phase: Phase::Idle,
        };

        let end = self.drive(&mut run, persister).await;
        let state = run.ledger.state();
        run.report.last_read_message_id = state.last_read_message_id;
        run.report.ids_to_retry = state.ids_to_retry.iter().copied().collect();
        match end {
            Ok(end) => run.report.end = end,
            Err(e) => {
                if e.is_chat_fatal() {
                    log::error!("Chat {}: giving up on this chat: {}", config.target, e);
                } else {
                    log::error!("Chat {}: stopped: {}", config.target, e);
                }
                run.report.error = Some(e.to_string());
                run.report.end = RunEnd::Done;
            }
        }
        log::info!(
            "Chat {}: finished ({} admitted, {} downloaded, {} skipped, {} failed, watermark {})",
            config.target,
            run.filter.admitted(),
            run.report.downloaded,
            run.report.skipped,
            run.report.failed,
            run.report.last_read_message_id
        );
        run.report
    }

    /// The loop proper. A chat-level error is returned after whatever was
    /// completed has been committed.
    async fn drive(
        &self,
        run: &mut ChatRun<'_>,
        persister: &StatePersister,
    ) -> Result<RunEnd, DownloadError> {
        let config = run.config;
        let target = &config.target;
        let resolved = self.source.resolve(target).await?;
        log::info!(
            "Chat {}{}: resuming after message {}",
            target,
            resolved
                .title
                .as_deref()
                .map(|t| format!(" \"{}\"", t))
                .unwrap_or_default(),
            run.ledger.watermark()
        );

        let retry = run.ledger.retry_ids();
        if !retry.is_empty() && !run.budget_spent() {
            if let Some(end) = self.replay(run, persister, retry).await? {
                return Ok(end);
            }
        }

        loop {
            if run.budget_spent() {
                run.enter(Phase::Done);
                return Ok(RunEnd::Done);
            }

            run.enter(Phase::Fetching);
            let page = match self.fetch_page(run).await {
                Ok(page) => page,
                Err(DownloadError::Interrupted) => return self.interrupt(run, persister).await,
                Err(e) => return Err(self.abort(run, persister, e).await),
            };
            if self.shutdown.is_triggered() {
                return self.interrupt(run, persister).await;
            }
            let Some(through_id) = page.through_id else {
                run.enter(Phase::Done);
                return Ok(RunEnd::Done);
            };

            run.enter(Phase::Filtering);
            let admission = run.admit(page.messages, false);
            let limit_hit = admission.truncated_at.is_some();
            let covered = admission.truncated_at.unwrap_or(through_id);

            self.download(run, admission.candidates).await;
            if let Some(end) = self.persist(run, persister, Some(covered)).await? {
                return Ok(end);
            }
            if limit_hit {
                run.enter(Phase::Done);
                return Ok(RunEnd::Done);
            }
        }
    }

    /// Download the ids parked in `ids_to_retry`, oldest first. If they
    /// cannot even be looked up the list is kept as it is for the next run
    /// and forward pagination goes ahead.
    async fn replay(
        &self,
        run: &mut ChatRun<'_>,
        persister: &StatePersister,
        retry: Vec<i64>,
    ) -> Result<Option<RunEnd>, DownloadError> {
        let config = run.config;
        let target = &config.target;
        run.enter(Phase::Fetching);
        let lookup = self
            .retrying(run, "looking up ids_to_retry", || {
                self.source.get_messages(target, &retry)
            })
            .await;
        let messages = match lookup {
            Ok(messages) => messages,
            Err(DownloadError::Interrupted) => return self.interrupt(run, persister).await.map(Some),
            Err(e) if e.is_chat_fatal() => return Err(self.abort(run, persister, e).await),
            Err(e) => {
                log::warn!(
                    "Chat {}: could not look up {} id(s) to retry, keeping them for the next run: {}",
                    target,
                    retry.len(),
                    e
                );
                return Ok(None);
            }
        };
        if self.shutdown.is_triggered() {
            return self.interrupt(run, persister).await.map(Some);
        }
        log::info!("Chat {}: replaying {} id(s) from ids_to_retry", target, retry.len());

        run.enter(Phase::Filtering);
        let present: BTreeSet<i64> = messages.iter().map(|m| m.id).collect();
        let admission = run.admit(messages, true);
        let settled_through = admission.truncated_at.unwrap_or(i64::MAX);
        for &id in retry.iter().filter(|id| !present.contains(*id)) {
            if id <= settled_through {
                run.record(&DownloadOutcome::Skipped {
                    message_id: id,
                    reason: SkipReason::Missing,
                });
            }
        }
        self.download(run, admission.candidates).await;
        self.persist(run, persister, None).await
    }

    /// Next forward page.
    async fn fetch_page(&self, run: &ChatRun<'_>) -> Result<HistoryPage, DownloadError> {
        let config = run.config;
        let cursor = run.ledger.cursor();
        self.retrying(run, "fetching history", || {
            self.source
                .list_messages(&config.target, cursor, config.pagination_limit)
        })
        .await
    }

    /// Run a history request, retrying transient faults like transfers are.
    /// Shutdown during the backoff yields `Interrupted`.
    async fn retrying<T, F, Fut>(
        &self,
        run: &ChatRun<'_>,
        what: &str,
        mut request: F,
    ) -> Result<T, DownloadError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DownloadError>>,
    {
        let config = run.config;
        let mut attempt = 1;
        loop {
            match request().await {
                Err(e) if e.is_retryable() && attempt < config.max_transfer_attempts => {
                    log::warn!(
                        "Chat {}: {} failed: {} (attempt {}/{})",
                        config.target,
                        what,
                        e,
                        attempt,
                        config.max_transfer_attempts
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(config.retry_backoff) => {}
                        _ = self.shutdown.cancelled() => return Err(DownloadError::Interrupted),
                    }
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn download(&self, run: &mut ChatRun<'_>, candidates: Vec<MediaCandidate>) {
        if candidates.is_empty() {
            return;
        }
        run.enter(Phase::Downloading);
        let outcomes = self.scheduler.run_batch(run.config, candidates).await;
        for outcome in &outcomes {
            run.record(outcome);
            if let DownloadOutcome::Succeeded { message_id, file } = outcome {
                self.remember_download(&run.config.target, *message_id, file).await;
            }
        }
    }

    /// Commit the batch. Returns the terminal state if the loop must stop.
    async fn persist(
        &self,
        run: &mut ChatRun<'_>,
        persister: &StatePersister,
        covered: Option<i64>,
    ) -> Result<Option<RunEnd>, DownloadError> {
        run.enter(Phase::Persisting);
        if let Some(through) = covered {
            run.ledger.cover(through);
        }
        let watermark = run.ledger.commit(persister).await?;
        log::info!(
            "Chat {}: committed, last_read_message_id = {}, {} to retry",
            run.config.target,
            watermark,
            run.ledger.state().ids_to_retry.len()
        );
        if self.shutdown.is_triggered() {
            run.enter(Phase::Interrupted);
            return Ok(Some(RunEnd::Interrupted));
        }
        Ok(None)
    }

    /// Shutdown seen right after a fetch: the page is dropped unrecorded.
    async fn interrupt(
        &self,
        run: &mut ChatRun<'_>,
        persister: &StatePersister,
    ) -> Result<RunEnd, DownloadError> {
        run.enter(Phase::Persisting);
        run.ledger.commit(persister).await?;
        run.enter(Phase::Interrupted);
        Ok(RunEnd::Interrupted)
    }

    /// Persist what was completed before giving up on the chat.
    async fn abort(
        &self,
        run: &mut ChatRun<'_>,
        persister: &StatePersister,
        e: DownloadError,
    ) -> DownloadError {
        run.enter(Phase::Persisting);
        if let Err(persist_err) = run.ledger.commit(persister).await {
            log::error!("Chat {}: {}", run.config.target, persist_err);
        }
        run.enter(Phase::Done);
        e
    }

    async fn remember_download(&self, target: &ChatTarget, message_id: i64, file: &SavedFile) {
        let Some(history) = &self.history else {
            return;
        };
        let chat_id = target.chat_id.to_string();
        let result = history
            .lock()
            .await
            .record_download(RecordDownloadParams {
                chat_id: &chat_id,
                message_id,
                file_path: &file.path,
                file_size: file.bytes,
                media_type: file.kind.as_str(),
            })
            .await;
        if let Err(e) = result {
            log::warn!("Failed to record download history: {:#}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::FsSink;
    use crate::source::MediaKind;
    use crate::testing::{media_message, text_message, FakeSource, MemoryConfigStore};
    use std::path::Path;
    use std::time::Duration;

    struct Harness {
        source: Arc<FakeSource>,
        store: Arc<MemoryConfigStore>,
        shutdown: ShutdownController,
        dir: tempfile::TempDir,
    }

    impl Harness {
        fn new(yaml: &str) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let yaml = format!(
                "download_directory: {}\n{}",
                dir.path().display(),
                yaml
            );
            let doc = ConfigDocument::from_yaml(&yaml).unwrap();
            Self {
                source: Arc::new(FakeSource::new()),
                store: Arc::new(MemoryConfigStore::new(doc)),
                shutdown: ShutdownController::new(),
                dir,
            }
        }

        /// Ids 1-5; 2 and 4 carry no media.
        fn scenario_history(&self) {
            for id in [1, 3, 5] {
                self.source.add(&media_message(id, MediaKind::Photo));
            }
            for id in [2, 4] {
                self.source.add(&text_message(id));
            }
        }

        fn orchestrator(&self) -> Orchestrator {
            Orchestrator::new(
                self.source.clone(),
                Arc::new(FsSink::new()),
                self.shutdown.clone(),
            )
        }

        async fn pass(&self) -> Vec<ChatReport> {
            let doc = self.store.current();
            self.orchestrator()
                .run_pass(self.store.clone(), doc)
                .await
                .unwrap()
        }

        fn chat(&self, index: usize) -> ChatEntry {
            self.store.current().chats[index].clone()
        }

        fn dir(&self) -> &Path {
            self.dir.path()
        }
    }

    #[tokio::test]
    async fn test_all_succeed() {
        let h = Harness::new("chats:\n  - chat_id: 1\n");
        h.scenario_history();
        let reports = h.pass().await;

        assert_eq!(reports[0].downloaded, 3);
        assert_eq!(reports[0].skipped, 2);
        assert_eq!(reports[0].end, RunEnd::Done);
        let chat = h.chat(0);
        assert_eq!(chat.last_read_message_id, 5);
        assert!(chat.ids_to_retry.is_empty());
        assert!(h.dir().join("photo").read_dir().unwrap().count() == 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_deferred() {
        let h = Harness::new("chats:\n  - chat_id: 1\n");
        h.scenario_history();
        h.source.fail_always(3);
        let reports = h.pass().await;

        assert_eq!(reports[0].failed, 1);
        let chat = h.chat(0);
        assert_eq!(chat.last_read_message_id, 5);
        assert_eq!(chat.ids_to_retry, vec![3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_blocks_watermark() {
        let h = Harness::new("retry_policy: block\nchats:\n  - chat_id: 1\n");
        h.scenario_history();
        h.source.fail_always(3);
        h.pass().await;

        let chat = h.chat(0);
        assert_eq!(chat.last_read_message_id, 2);
        assert_eq!(chat.ids_to_retry, vec![3]);

        // Next run: 3 still fails, 5 is already on disk.
        let before = h.source.opened().len();
        let reports = h.pass().await;
        let chat = h.chat(0);
        assert_eq!(chat.last_read_message_id, 2);
        assert_eq!(chat.ids_to_retry, vec![3]);
        assert_eq!(reports[0].downloaded, 0);
        assert!(h.source.opened()[before..].iter().all(|&id| id == 3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_round_trip() {
        let h = Harness::new("chats:\n  - chat_id: 1\n");
        h.scenario_history();
        h.source.fail_times(3, 3);
        h.pass().await;
        assert_eq!(h.chat(0).ids_to_retry, vec![3]);

        h.source.add(&media_message(6, MediaKind::Photo));
        let before = h.source.opened().len();
        let reports = h.pass().await;
        // Replayed before forward pagination picks up 6.
        assert_eq!(h.source.opened()[before..], [3, 6]);
        assert_eq!(reports[0].downloaded, 2);
        let chat = h.chat(0);
        assert!(chat.ids_to_retry.is_empty());
        assert_eq!(chat.last_read_message_id, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_lookup_recovers_after_transient_error() {
        let h = Harness::new(
            "chats:\n  - chat_id: 1\n    last_read_message_id: 5\n    ids_to_retry: [3]\n",
        );
        for id in [3, 6, 7] {
            h.source.add(&media_message(id, MediaKind::Photo));
        }
        h.source.fail_lookups(1);
        let reports = h.pass().await;

        assert!(reports[0].error.is_none());
        assert_eq!(reports[0].downloaded, 3);
        assert_eq!(h.source.opened(), vec![3, 6, 7]);
        let chat = h.chat(0);
        assert_eq!(chat.last_read_message_id, 7);
        assert!(chat.ids_to_retry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_retry_lookup_keeps_ids_and_moves_on() {
        let h = Harness::new(
            "chats:\n  - chat_id: 1\n    last_read_message_id: 5\n    ids_to_retry: [3]\n",
        );
        for id in [3, 6, 7] {
            h.source.add(&media_message(id, MediaKind::Photo));
        }
        h.source.fail_lookups(usize::MAX);
        let reports = h.pass().await;

        assert!(reports[0].error.is_none());
        assert_eq!(reports[0].downloaded, 2);
        assert_eq!(h.source.opened(), vec![6, 7]);
        let chat = h.chat(0);
        assert_eq!(chat.last_read_message_id, 7);
        assert_eq!(chat.ids_to_retry, vec![3]);
    }

    #[tokio::test]
    async fn test_rerun_is_idempotent() {
        let h = Harness::new("chats:\n  - chat_id: 1\n");
        h.scenario_history();
        h.pass().await;
        let opened = h.source.opened().len();

        let reports = h.pass().await;
        assert_eq!(reports[0].downloaded, 0);
        assert_eq!(h.source.opened().len(), opened);
        assert_eq!(h.chat(0).last_read_message_id, 5);
    }

    #[tokio::test]
    async fn test_zero_budget_downloads_nothing() {
        let h = Harness::new("max_messages: 0\nchats:\n  - chat_id: 1\n");
        h.scenario_history();
        let reports = h.pass().await;
        assert_eq!(reports[0].downloaded, 0);
        assert!(h.source.opened().is_empty());
        assert_eq!(h.chat(0).last_read_message_id, 0);
    }

    #[tokio::test]
    async fn test_budget_stops_before_unadmitted_message() {
        let h = Harness::new("max_messages: 2\nchats:\n  - chat_id: 1\n");
        h.scenario_history();
        let reports = h.pass().await;
        assert_eq!(reports[0].downloaded, 2);
        // 5 was turned away by the budget alone, so the watermark stops at 4.
        assert_eq!(h.chat(0).last_read_message_id, 4);

        let reports = h.pass().await;
        assert_eq!(reports[0].downloaded, 1);
        assert_eq!(h.chat(0).last_read_message_id, 5);
    }

    #[tokio::test]
    async fn test_pages_follow_pagination_limit() {
        let h = Harness::new("pagination_limit: 2\nchats:\n  - chat_id: 1\n");
        h.scenario_history();
        h.pass().await;
        // Pages [1,2] [3,4] [5] and the empty one that ends the loop.
        assert_eq!(h.source.pages_served(), 4);
        assert_eq!(h.store.saves(), 3);
        assert_eq!(h.chat(0).last_read_message_id, 5);
    }

    #[tokio::test]
    async fn test_shutdown_drains_current_batch() {
        let h = Harness::new("pagination_limit: 3\nchats:\n  - chat_id: 1\n");
        for id in 1..=6 {
            h.source.add(&media_message(id, MediaKind::Photo));
        }
        let shutdown = h.shutdown.clone();
        h.source.on_open(move |id| {
            if id == 2 {
                shutdown.on_signal();
            }
        });

        let reports = h.pass().await;
        assert_eq!(reports[0].end, RunEnd::Interrupted);
        assert_eq!(reports[0].downloaded, 3);
        assert_eq!(h.source.pages_served(), 1);
        assert_eq!(h.store.saves(), 1);
        assert_eq!(h.chat(0).last_read_message_id, 3);
    }

    #[tokio::test]
    async fn test_inaccessible_chat_leaves_others_alone() {
        let h = Harness::new(
            "parallel_chats: true\nchats:\n  - chat_id: 1\n  - chat_id: 2\n",
        );
        h.scenario_history();
        h.source.deny("2");
        let reports = h.pass().await;

        assert_eq!(reports.len(), 2);
        assert!(reports[0].error.is_none());
        assert_eq!(reports[0].downloaded, 3);
        assert!(reports[1].error.as_deref().unwrap().contains("CHANNEL_PRIVATE"));
        assert_eq!(reports[1].end, RunEnd::Done);
        assert_eq!(h.chat(0).last_read_message_id, 5);
        assert_eq!(h.chat(1).last_read_message_id, 0);
    }

    #[tokio::test]
    async fn test_sequential_chats_in_order() {
        let h = Harness::new("chats:\n  - chat_id: 2\n  - chat_id: 1\n");
        h.source.add_to("2", &media_message(10, MediaKind::Photo));
        h.source.add(&media_message(1, MediaKind::Photo));
        let reports = h.pass().await;
        assert_eq!(reports[0].chat, "2");
        assert_eq!(h.source.opened(), vec![10, 1]);
    }

    #[tokio::test]
    async fn test_invalid_config_fails_before_any_chat() {
        let h = Harness::new(
            "chats:\n  - chat_id: 1\n  - chat_id: 2\n    max_concurrent_downloads: 0\n",
        );
        h.scenario_history();
        let doc = h.store.current();
        let err = h
            .orchestrator()
            .run_pass(h.store.clone(), doc)
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::Config(_)));
        assert!(h.source.opened().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_loop_until_shutdown() {
        let h = Harness::new("refresh_interval: 1\nchats:\n  - chat_id: 1\n");
        h.source.add(&media_message(1, MediaKind::Photo));
        let orchestrator = h.orchestrator();
        let source = h.source.clone();
        let shutdown = h.shutdown.clone();
        let mut passes = 0;

        let started = tokio::time::Instant::now();
        orchestrator
            .run(h.store.clone(), false, |_| {
                passes += 1;
                if passes == 1 {
                    source.add(&media_message(2, MediaKind::Photo));
                } else {
                    shutdown.trigger();
                }
            })
            .await
            .unwrap();

        assert_eq!(passes, 2);
        assert!(started.elapsed() >= Duration::from_secs(60));
        assert_eq!(h.source.opened(), vec![1, 2]);
        assert_eq!(h.chat(0).last_read_message_id, 2);
    }
}
