//! Core domain model for Podium: canonical opportunities and run logs.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "podium-core";

/// Reserved source tag for the aggregate "all sources" run log entry.
/// Real fetchers must never register under this tag.
pub const AGGREGATE_SOURCE_TAG: &str = "all-sources";

/// Canonical persisted listing: one row per real-world event/CFP slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    pub id: Uuid,
    /// Dedup key. `None` means this row can never be matched by a later
    /// sighting and duplicates are possible (known gap, preserved as-is).
    pub source_url: Option<String>,
    pub name: String,
    pub organizer_name: Option<String>,
    pub organizer_email: Option<String>,
    pub description: Option<String>,
    pub location: Option<String>,
    pub audience_size: Option<u32>,
    pub fee_min: Option<f64>,
    pub fee_max: Option<f64>,
    pub event_date: Option<NaiveDate>,
    pub submission_deadline: Option<NaiveDate>,
    pub source_tag: String,
    pub first_seen_at: DateTime<Utc>,
    pub active: bool,
}

/// Source-normalized listing produced by a fetcher, not yet deduplicated
/// or persisted. Unknown fields stay `None` rather than failing the
/// candidate.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Candidate {
    pub source_url: Option<String>,
    pub name: String,
    pub organizer_name: Option<String>,
    pub organizer_email: Option<String>,
    pub description: Option<String>,
    pub location: Option<String>,
    pub audience_size: Option<u32>,
    pub fee_min: Option<f64>,
    pub fee_max: Option<f64>,
    pub event_date: Option<NaiveDate>,
    pub submission_deadline: Option<NaiveDate>,
    pub source_tag: String,
}

impl Candidate {
    /// Promote into a brand-new canonical row.
    pub fn into_opportunity(self, id: Uuid, first_seen_at: DateTime<Utc>) -> Opportunity {
        Opportunity {
            id,
            source_url: self.source_url,
            name: self.name,
            organizer_name: self.organizer_name,
            organizer_email: self.organizer_email,
            description: self.description,
            location: self.location,
            audience_size: self.audience_size,
            fee_min: self.fee_min,
            fee_max: self.fee_max,
            event_date: self.event_date,
            submission_deadline: self.submission_deadline,
            source_tag: self.source_tag,
            first_seen_at,
            active: true,
        }
    }

    /// Overwrite an existing row's fields with this sighting's values.
    /// Full replace, not merge; identity and first-seen provenance are the
    /// only survivors of the old row.
    pub fn apply_to(self, existing: &Opportunity) -> Opportunity {
        let mut refreshed = self.into_opportunity(existing.id, existing.first_seen_at);
        refreshed.active = true;
        refreshed
    }
}

/// Terminal-or-running state of one ingestion attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Partial,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Partial => "partial",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }

    /// Aggregate classification from the multiset of per-source outcomes.
    /// Order-independent. Zero configured sources classifies as success.
    pub fn classify(succeeded: usize, failed: usize) -> RunStatus {
        match (succeeded, failed) {
            (_, 0) => RunStatus::Success,
            (0, _) => RunStatus::Failed,
            _ => RunStatus::Partial,
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "success" => Ok(RunStatus::Success),
            "partial" => Ok(RunStatus::Partial),
            "failed" => Ok(RunStatus::Failed),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// One persisted ingestion attempt, for a single source or for the
/// aggregate run (tagged [`AGGREGATE_SOURCE_TAG`]).
///
/// Invariant: `completed_at` is set iff `status` is terminal, and the row
/// transitions exactly once from running to a terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeRun {
    pub id: Uuid,
    pub source_tag: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub found: u32,
    pub inserted: u32,
    pub updated: u32,
    /// Single failure reason for source runs; comma-joined failed source
    /// tags for the aggregate run.
    pub error: Option<String>,
}

impl ScrapeRun {
    pub fn begin(source_tag: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_tag: source_tag.into(),
            status: RunStatus::Running,
            started_at,
            completed_at: None,
            found: 0,
            inserted: 0,
            updated: 0,
            error: None,
        }
    }

    /// Transition into a terminal state. Metrics only become meaningful
    /// here, alongside `completed_at`.
    pub fn complete(
        mut self,
        status: RunStatus,
        completed_at: DateTime<Utc>,
        found: u32,
        inserted: u32,
        updated: u32,
        error: Option<String>,
    ) -> Self {
        debug_assert!(status.is_terminal());
        self.status = status;
        self.completed_at = Some(completed_at);
        self.found = found;
        self.inserted = inserted;
        self.updated = updated;
        self.error = error;
        self
    }
}
