//! Rate-limited download scheduler.
//!
//! One batch at a time: candidates are dispatched in order, each after the
//! configured pacing delay (except the first), through a counting gate of
//! `max_concurrent_downloads` permits. Every candidate yields exactly one
//! outcome; a failing transfer never affects its siblings.

use crate::config::{resolve::sanitize_component, EffectiveChatConfig};
use crate::error::DownloadError;
use crate::ledger::{DownloadOutcome, SavedFile, SkipReason};
use crate::sink::{MediaSink, WriteOutcome};
use crate::source::{ChatTarget, HistorySource, MediaCandidate, MediaKind};
use futures::FutureExt;
use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

pub struct Scheduler {
    source: Arc<dyn HistorySource>,
    sink: Arc<dyn MediaSink>,
}

struct Transfer {
    source: Arc<dyn HistorySource>,
    sink: Arc<dyn MediaSink>,
    chat: ChatTarget,
    candidate: MediaCandidate,
    path: PathBuf,
    attempts: u32,
    backoff: Duration,
}

impl Scheduler {
    pub fn new(source: Arc<dyn HistorySource>, sink: Arc<dyn MediaSink>) -> Self {
        Self { source, sink }
    }

    pub async fn run_batch(
        &self,
        config: &EffectiveChatConfig,
        candidates: Vec<MediaCandidate>,
    ) -> Vec<DownloadOutcome> {
        let gate = Arc::new(Semaphore::new(config.max_concurrent_downloads.max(1)));
        let mut tasks = JoinSet::new();
        let mut unsettled = BTreeSet::new();
        let mut outcomes = Vec::with_capacity(candidates.len());

        for (i, candidate) in candidates.into_iter().enumerate() {
            if i > 0 {
                let delay = config.download_delay.sample();
                if !delay.is_zero() {
                    log::debug!("Pacing {:?} before message {}", delay, candidate.message_id);
                    tokio::time::sleep(delay).await;
                }
            }

            let message_id = candidate.message_id;
            let permit = match Arc::clone(&gate).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    outcomes.push(DownloadOutcome::Failed {
                        message_id,
                        reason: "download gate closed".to_string(),
                    });
                    continue;
                }
            };

            let transfer = Transfer {
                source: Arc::clone(&self.source),
                sink: Arc::clone(&self.sink),
                chat: config.target.clone(),
                path: target_path(&config.download_directory, &candidate),
                candidate,
                attempts: config.max_transfer_attempts.max(1),
                backoff: config.retry_backoff,
            };
            unsettled.insert(message_id);
            tasks.spawn(async move {
                let _permit = permit;
                match AssertUnwindSafe(transfer.run()).catch_unwind().await {
                    Ok(outcome) => outcome,
                    Err(_) => DownloadOutcome::Failed {
                        message_id,
                        reason: "transfer task panicked".to_string(),
                    },
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => {
                    unsettled.remove(&outcome.message_id());
                    outcomes.push(outcome);
                }
                Err(e) => log::error!("Transfer task ended abnormally: {}", e),
            }
        }
        // Whatever did not report back is a failure, never a silent drop.
        outcomes.extend(unsettled.into_iter().map(|message_id| DownloadOutcome::Failed {
            message_id,
            reason: "transfer task did not report an outcome".to_string(),
        }));
        outcomes
    }
}

impl Transfer {
    async fn run(self) -> DownloadOutcome {
        let message_id = self.candidate.message_id;

        // Only a generated name identifies the message. Files named by the
        // sender can collide across messages and are compared by content
        // after the transfer instead.
        let generated_name = own_file_name(&self.candidate).is_none();
        if let (true, Some(size)) = (generated_name, self.candidate.media.size) {
            if self.sink.existing_len(&self.path).await == Some(size) {
                log::info!(
                    "Message[{}]: {} already present, skipping",
                    message_id,
                    self.path.display()
                );
                return DownloadOutcome::Skipped {
                    message_id,
                    reason: SkipReason::AlreadyExists(self.path),
                };
            }
        }

        let mut attempt = 1;
        loop {
            match self.attempt().await {
                Ok(WriteOutcome::Written { path, bytes }) => {
                    log::info!("Media downloaded - {}", path.display());
                    return DownloadOutcome::Succeeded {
                        message_id,
                        file: SavedFile {
                            path,
                            bytes,
                            kind: self.candidate.kind(),
                        },
                    };
                }
                Ok(WriteOutcome::Duplicate { path }) => {
                    log::info!(
                        "Message[{}]: identical file {} already present",
                        message_id,
                        path.display()
                    );
                    return DownloadOutcome::Skipped {
                        message_id,
                        reason: SkipReason::AlreadyExists(path),
                    };
                }
                Err(e) if e.is_retryable() && attempt < self.attempts => {
                    log::warn!(
                        "Message[{}]: {} (attempt {}/{}), retrying after {:?}",
                        message_id,
                        e,
                        attempt,
                        self.attempts,
                        self.backoff
                    );
                    tokio::time::sleep(self.backoff).await;
                    attempt += 1;
                }
                Err(e) => {
                    log::warn!("Message[{}]: download failed: {}", message_id, e);
                    return DownloadOutcome::Failed {
                        message_id,
                        reason: e.to_string(),
                    };
                }
            }
        }
    }

    async fn attempt(&self) -> Result<WriteOutcome, DownloadError> {
        let stream = self
            .source
            .open_media_stream(&self.chat, &self.candidate)
            .await?;
        self.sink.write_atomic(&self.path, stream).await
    }
}

/// `<dir>/<kind>/<file name>`; unnamed media get a name built from kind,
/// message id and timestamp.
pub fn target_path(dir: &Path, candidate: &MediaCandidate) -> PathBuf {
    let kind = candidate.kind();
    let file_name = own_file_name(candidate)
        .unwrap_or_else(|| {
            let ext = candidate
                .media
                .extension
                .clone()
                .unwrap_or_else(|| default_extension(kind).to_string());
            format!(
                "{}_{}_{}.{}",
                kind,
                candidate.message_id,
                candidate.date.format("%Y-%m-%dT%H-%M-%S"),
                sanitize_component(&ext)
            )
        });
    dir.join(kind.as_str()).join(file_name)
}

/// The sanitized document file name, if the media carries one.
fn own_file_name(candidate: &MediaCandidate) -> Option<String> {
    candidate
        .media
        .file_name
        .as_deref()
        .filter(|n| !n.trim().is_empty())
        .map(sanitize_component)
}

fn default_extension(kind: MediaKind) -> &'static str {
    match kind {
        MediaKind::Photo => "jpg",
        MediaKind::Voice => "ogg",
        MediaKind::Audio => "mp3",
        MediaKind::Video | MediaKind::VideoNote => "mp4",
        MediaKind::Document => "bin",
    }
}
