//! Admission rules for download candidates.

use crate::config::EffectiveChatConfig;
use crate::source::MediaCandidate;
use std::fmt;

/// Why a candidate was not admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    MediaType,
    Extension,
    OutsideDateRange,
    /// The per-run `max_messages` budget is used up.
    LimitReached,
    AlreadyDownloaded,
}

impl Rejection {
    /// Rejections that settle the message for good. A candidate turned away
    /// only by the run budget is still pending.
    pub fn is_final(&self) -> bool {
        !matches!(self, Rejection::LimitReached)
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Rejection::MediaType => "media type not selected",
            Rejection::Extension => "file format not selected",
            Rejection::OutsideDateRange => "outside date range",
            Rejection::LimitReached => "max_messages reached",
            Rejection::AlreadyDownloaded => "already downloaded",
        };
        f.write_str(s)
    }
}

/// Stateful filter for one chat run; counts admissions against `max_messages`.
#[derive(Debug, Default)]
pub struct CandidateFilter {
    admitted: u64,
}

impl CandidateFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn admitted(&self) -> u64 {
        self.admitted
    }

    /// Admissions left before `max_messages`, `None` when unbounded.
    pub fn remaining(&self, config: &EffectiveChatConfig) -> Option<u64> {
        config
            .max_messages
            .map(|max| max.saturating_sub(self.admitted))
    }

    /// Admit `candidate` or say why not. Only admissions count against
    /// `max_messages`.
    pub fn admit(
        &mut self,
        candidate: &MediaCandidate,
        config: &EffectiveChatConfig,
        already_seen: bool,
    ) -> Result<(), Rejection> {
        let kind = candidate.kind();
        if !config.media_types.contains(&kind) {
            return Err(Rejection::MediaType);
        }
        if !config
            .format_rule(kind)
            .allows(candidate.media.extension.as_deref())
        {
            return Err(Rejection::Extension);
        }
        if config.start_date.is_some_and(|start| candidate.date < start)
            || config.end_date.is_some_and(|end| candidate.date > end)
        {
            return Err(Rejection::OutsideDateRange);
        }
        if already_seen {
            return Err(Rejection::AlreadyDownloaded);
        }
        if self.remaining(config) == Some(0) {
            return Err(Rejection::LimitReached);
        }
        self.admitted += 1;
        Ok(())
    }
}
