//! Merge of global settings and per-chat overrides.
//!
//! For every option: chat value if present, else global value, else the
//! built-in default. The result is immutable for the rest of the run; a
//! reload builds new values.

use super::{ChatEntry, ConfigDocument, DelaySetting, RetryPolicy, Settings};
use crate::error::DownloadError;
use crate::source::{ChatTarget, MediaKind};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rand::Rng;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 4;
pub const DEFAULT_PAGINATION_LIMIT: usize = 100;
pub const DEFAULT_MAX_TRANSFER_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(5);

/// Pause inserted before each dispatch after the first one in a batch.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum DownloadDelay {
    #[default]
    None,
    Fixed(Duration),
    /// Uniformly drawn from the inclusive range.
    Range(Duration, Duration),
}

impl DownloadDelay {
    pub fn sample(&self) -> Duration {
        match *self {
            DownloadDelay::None => Duration::ZERO,
            DownloadDelay::Fixed(d) => d,
            DownloadDelay::Range(min, max) if min == max => min,
            DownloadDelay::Range(min, max) => {
                let secs = rand::rng().random_range(min.as_secs_f64()..=max.as_secs_f64());
                Duration::from_secs_f64(secs)
            }
        }
    }
}

/// Allowed extensions for one media kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormatRule {
    Any,
    Only(BTreeSet<String>),
}

impl FormatRule {
    fn from_list(list: &[String]) -> Self {
        let exts: BTreeSet<String> = list.iter().map(|e| normalize_extension(e)).collect();
        if exts.is_empty() || exts.contains("all") {
            FormatRule::Any
        } else {
            FormatRule::Only(exts)
        }
    }

    pub fn allows(&self, extension: Option<&str>) -> bool {
        match self {
            FormatRule::Any => true,
            FormatRule::Only(exts) => {
                extension.is_some_and(|ext| exts.contains(&normalize_extension(ext)))
            }
        }
    }
}

pub fn normalize_extension(ext: &str) -> String {
    ext.trim().trim_start_matches('.').to_ascii_lowercase()
}

#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveChatConfig {
    pub target: ChatTarget,
    pub media_types: BTreeSet<MediaKind>,
    pub file_formats: BTreeMap<MediaKind, FormatRule>,
    pub download_directory: PathBuf,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub max_messages: Option<u64>,
    pub max_concurrent_downloads: usize,
    pub download_delay: DownloadDelay,
    pub parallel_chats: bool,
    pub pagination_limit: usize,
    pub retry_policy: RetryPolicy,
    pub max_transfer_attempts: u32,
    pub retry_backoff: Duration,
}

impl EffectiveChatConfig {
    pub fn format_rule(&self, kind: MediaKind) -> &FormatRule {
        self.file_formats.get(&kind).unwrap_or(&FormatRule::Any)
    }
}

/// Settings that apply to a whole pass rather than to one chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSettings {
    pub parallel_chats: bool,
    pub refresh_interval: Duration,
}

impl RunSettings {
    pub fn from_document(doc: &ConfigDocument) -> Result<Self, DownloadError> {
        let minutes = doc.refresh_interval.unwrap_or(0);
        let secs = minutes.checked_mul(60).ok_or_else(|| {
            DownloadError::config(format!("refresh_interval {} minutes is too large", minutes))
        })?;
        Ok(Self {
            parallel_chats: doc.parallel_chats.unwrap_or(false),
            refresh_interval: Duration::from_secs(secs),
        })
    }
}

/// Resolve every configured chat. Any invalid chat fails the whole run.
pub fn resolve_all(doc: &ConfigDocument) -> Result<Vec<EffectiveChatConfig>, DownloadError> {
    doc.chats.iter().map(|chat| resolve(doc, chat)).collect()
}

pub fn resolve(doc: &ConfigDocument, chat: &ChatEntry) -> Result<EffectiveChatConfig, DownloadError> {
    let global = &doc.settings;
    let local = &chat.overrides;
    let target = chat.target();
    let ctx = |msg: String| DownloadError::config(format!("chat {}: {}", target, msg));

    let media_types: BTreeSet<MediaKind> = pick(local, global, |s| s.media_types.as_ref())
        .map(|kinds| kinds.iter().copied().collect())
        .unwrap_or_else(|| MediaKind::ALL.into_iter().collect());

    let file_formats = MediaKind::ALL
        .into_iter()
        .filter_map(|kind| {
            let list = local
                .file_formats
                .as_ref()
                .and_then(|m| m.get(&kind))
                .or_else(|| global.file_formats.as_ref().and_then(|m| m.get(&kind)))?;
            Some((kind, FormatRule::from_list(list)))
        })
        .collect();

    let download_directory = pick(local, global, |s| s.download_directory.as_ref())
        .cloned()
        .unwrap_or_else(|| default_directory(&target));

    let start_date = pick(local, global, |s| s.start_date.as_deref())
        .map(|s| parse_date(s, false))
        .transpose()
        .map_err(ctx)?;
    let end_date = pick(local, global, |s| s.end_date.as_deref())
        .map(|s| parse_date(s, true))
        .transpose()
        .map_err(ctx)?;
    if let (Some(start), Some(end)) = (start_date, end_date) {
        if start > end {
            return Err(ctx(format!("start_date {} is after end_date {}", start, end)));
        }
    }

    let max_messages = match pick(local, global, |s| s.max_messages) {
        Some(n) if n < 0 => return Err(ctx(format!("max_messages must not be negative, got {}", n))),
        Some(n) => Some(n as u64),
        None => None,
    };

    let max_concurrent_downloads = match pick(local, global, |s| s.max_concurrent_downloads) {
        Some(n) if n < 1 => {
            return Err(ctx(format!("max_concurrent_downloads must be at least 1, got {}", n)))
        }
        Some(n) => n as usize,
        None => DEFAULT_MAX_CONCURRENT_DOWNLOADS,
    };

    let download_delay = match pick(local, global, |s| s.download_delay.as_ref()) {
        Some(setting) => parse_delay(setting).map_err(ctx)?,
        None => DownloadDelay::None,
    };

    let pagination_limit = match doc.pagination_limit {
        Some(n) if n < 1 => return Err(ctx(format!("pagination_limit must be at least 1, got {}", n))),
        Some(n) => n as usize,
        None => DEFAULT_PAGINATION_LIMIT,
    };
    let max_transfer_attempts = match doc.max_transfer_attempts {
        Some(n) if n < 1 => {
            return Err(ctx(format!("max_transfer_attempts must be at least 1, got {}", n)))
        }
        Some(n) => n as u32,
        None => DEFAULT_MAX_TRANSFER_ATTEMPTS,
    };
    let retry_backoff = match doc.retry_backoff {
        Some(s) => seconds(s).map_err(|e| ctx(format!("retry_backoff {}", e)))?,
        None => DEFAULT_RETRY_BACKOFF,
    };

    Ok(EffectiveChatConfig {
        target,
        media_types,
        file_formats,
        download_directory,
        start_date,
        end_date,
        max_messages,
        max_concurrent_downloads,
        download_delay,
        parallel_chats: doc.parallel_chats.unwrap_or(false),
        pagination_limit,
        retry_policy: doc.retry_policy.unwrap_or_default(),
        max_transfer_attempts,
        retry_backoff,
    })
}

fn pick<'a, T>(local: &'a Settings, global: &'a Settings, f: impl Fn(&'a Settings) -> Option<T>) -> Option<T> {
    f(local).or_else(|| f(global))
}

fn parse_delay(setting: &DelaySetting) -> Result<DownloadDelay, String> {
    match setting {
        DelaySetting::Fixed(s) => Ok(DownloadDelay::Fixed(
            seconds(*s).map_err(|e| format!("download_delay {}", e))?,
        )),
        DelaySetting::Range(bounds) => {
            let [min, max] = bounds.as_slice() else {
                return Err(format!(
                    "download_delay range needs exactly two values [min, max], got {}",
                    bounds.len()
                ));
            };
            let min = seconds(*min).map_err(|e| format!("download_delay {}", e))?;
            let max = seconds(*max).map_err(|e| format!("download_delay {}", e))?;
            if min > max {
                return Err(format!(
                    "download_delay range min {:?} is greater than max {:?}",
                    min, max
                ));
            }
            Ok(DownloadDelay::Range(min, max))
        }
    }
}

fn seconds(value: f64) -> Result<Duration, String> {
    if !value.is_finite() || value < 0.0 {
        return Err(format!("must be a non-negative number of seconds, got {}", value));
    }
    Duration::try_from_secs_f64(value)
        .map_err(|_| format!("is too large a number of seconds, got {}", value))
}

/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS` (UTC) or `YYYY-MM-DD`. A bare date
/// used as an end bound covers the whole day.
fn parse_date(s: &str, end_of_day: bool) -> Result<DateTime<Utc>, String> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Ok(dt.and_utc());
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        let time = if end_of_day {
            NaiveTime::from_hms_nano_opt(23, 59, 59, 999_999_999)
        } else {
            NaiveTime::from_hms_opt(0, 0, 0)
        };
        if let Some(time) = time {
            return Ok(date.and_time(time).and_utc());
        }
    }
    Err(format!(
        "invalid date '{}'. Use YYYY-MM-DD, 'YYYY-MM-DD HH:MM:SS' or RFC3339",
        s
    ))
}

fn default_directory(target: &ChatTarget) -> PathBuf {
    Path::new("downloads").join(sanitize_component(&target.label()))
}

/// Make a string safe to use as a single path component.
pub fn sanitize_component(s: &str) -> String {
    let cleaned: String = s
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim().trim_matches('.').to_string();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}
