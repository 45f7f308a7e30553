//! Core domain model for mapsnap harvest runs.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "mapsnap-core";

/// Outcome name used when the catalog itself could not be listed.
pub const GLOBAL_OUTCOME: &str = "global";

/// Outcome name used when the collected tree could not be packed.
pub const PACK_OUTCOME: &str = "pack";

/// One fetchable unit discovered in the upstream listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogItem {
    pub name: String,
    pub source_url: String,
}

impl CatalogItem {
    pub fn new(name: impl Into<String>, source_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source_url: source_url.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ItemStatus {
    Ok,
    FetchFailed { code: u16 },
    ExtractFailed,
    LinkMissing,
    Other { message: String },
}

impl ItemStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, ItemStatus::Ok)
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemStatus::Ok => f.write_str("ok"),
            ItemStatus::FetchFailed { code } => write!(f, "archive fetch failed ({code})"),
            ItemStatus::ExtractFailed => f.write_str("extraction failed"),
            ItemStatus::LinkMissing => f.write_str("download link missing"),
            ItemStatus::Other { message } => f.write_str(message),
        }
    }
}

/// Per-item status record; created once per item per run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemOutcome {
    pub name: String,
    pub status: ItemStatus,
}

impl ItemOutcome {
    pub fn new(name: impl Into<String>, status: ItemStatus) -> Self {
        Self {
            name: name.into(),
            status,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunLabel {
    First,
    Second,
}

impl RunLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunLabel::First => "first",
            RunLabel::Second => "second",
        }
    }
}

impl fmt::Display for RunLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Complete output of one collection pass.
///
/// `fingerprint` is present exactly when the pass produced its archive, which can happen
/// even when `has_error` is set (partial collections are still packed).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub label: RunLabel,
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total_items: usize,
    pub outcomes: Vec<ItemOutcome>,
    pub has_error: bool,
    pub archive_path: PathBuf,
    pub fingerprint: Option<String>,
}

impl RunResult {
    pub fn failed_outcomes(&self) -> impl Iterator<Item = &ItemOutcome> {
        self.outcomes.iter().filter(|o| !o.status.is_ok())
    }

    pub fn archive_produced(&self) -> bool {
        self.fingerprint.is_some()
    }
}

/// Terminal artifact of a reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationDecision {
    pub accepted: bool,
    pub final_archive_path: Option<PathBuf>,
    pub final_fingerprint: Option<String>,
    pub first: RunResult,
    pub second: Option<RunResult>,
}

impl ReconciliationDecision {
    pub fn accepted(run: &RunResult, first: RunResult, second: Option<RunResult>) -> Self {
        Self {
            accepted: true,
            final_archive_path: Some(run.archive_path.clone()),
            final_fingerprint: run.fingerprint.clone(),
            first,
            second,
        }
    }

    pub fn rejected(first: RunResult, second: Option<RunResult>) -> Self {
        Self {
            accepted: false,
            final_archive_path: None,
            final_fingerprint: None,
            first,
            second,
        }
    }

    pub fn exit_code(&self) -> i32 {
        if self.accepted {
            0
        } else {
            1
        }
    }
}
