//! Resync run state and the report a finished run produces.

use crate::reconciler::{DeleteReport, UpsertOutcome};
use chrono::{DateTime, Utc};
use ocean_types::{EntityKey, IntegrationId, RunId, RunStatus};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tracing::warn;

/// Counters for one resource kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindStatistics {
    pub pages: usize,
    /// Raw objects received.
    pub objects: usize,
    /// Entities the mapper produced.
    pub mapped: usize,
    pub mapping_failures: usize,
    pub created: usize,
    pub updated: usize,
    pub upsert_failures: usize,
    /// Every page was fetched and reconciled.
    pub completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl KindStatistics {
    pub fn record_upserts(&mut self, outcomes: &[(EntityKey, UpsertOutcome)]) {
        for (_, outcome) in outcomes {
            match outcome {
                UpsertOutcome::Created => self.created += 1,
                UpsertOutcome::Updated => self.updated += 1,
                UpsertOutcome::Failed(_) => self.upsert_failures += 1,
            }
        }
    }
}

/// Counters for a whole run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStatistics {
    pub kinds: BTreeMap<String, KindStatistics>,
    /// Whether the deletion phase ran at all.
    pub deletion_ran: bool,
    pub deleted: usize,
    pub dependents_deleted: usize,
    pub delete_failures: usize,
    /// Stale entities kept because the deletion guard tripped.
    pub deletion_skipped: usize,
}

impl RunStatistics {
    pub fn objects(&self) -> usize {
        self.kinds.values().map(|k| k.objects).sum()
    }

    pub fn upserted(&self) -> usize {
        self.kinds.values().map(|k| k.created + k.updated).sum()
    }

    pub fn mapping_failures(&self) -> usize {
        self.kinds.values().map(|k| k.mapping_failures).sum()
    }

    pub fn upsert_failures(&self) -> usize {
        self.kinds.values().map(|k| k.upsert_failures).sum()
    }

    pub fn record_deletion(&mut self, report: &DeleteReport) {
        self.deletion_ran = true;
        self.deleted += report.deleted;
        self.dependents_deleted += report.dependents_deleted;
        self.delete_failures += report.failed;
        self.deletion_skipped += report.skipped;
    }
}

/// A resync in progress. Owned by the coordinator task driving it.
#[derive(Debug)]
pub struct ResyncRun {
    pub run_id: RunId,
    pub integration: IntegrationId,
    pub kinds: Vec<String>,
    pub started_at: DateTime<Utc>,
    status: RunStatus,
    observed: HashSet<EntityKey>,
    statistics: RunStatistics,
    failed_kinds: Vec<String>,
    error: Option<String>,
}

impl ResyncRun {
    pub fn new(integration: IntegrationId, kinds: Vec<String>) -> Self {
        Self {
            run_id: RunId::new(),
            integration,
            kinds,
            started_at: Utc::now(),
            status: RunStatus::Pending,
            observed: HashSet::new(),
            statistics: RunStatistics::default(),
            failed_kinds: Vec::new(),
            error: None,
        }
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    /// Moves to `next` if the lifecycle allows it.
    pub fn transition(&mut self, next: RunStatus) -> bool {
        if self.status.can_transition_to(next) {
            self.status = next;
            true
        } else {
            warn!(
                run_id = %self.run_id,
                from = %self.status,
                to = %next,
                "ignoring invalid run transition"
            );
            false
        }
    }

    /// Folds in the result of one kind.
    pub fn record_kind(&mut self, kind: &str, stats: KindStatistics, observed: HashSet<EntityKey>) {
        if !stats.completed {
            self.failed_kinds.push(kind.to_string());
        }
        self.observed.extend(observed);
        self.statistics.kinds.insert(kind.to_string(), stats);
    }

    pub fn record_deletion(&mut self, report: &DeleteReport) {
        self.statistics.record_deletion(report);
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.error = Some(error.into());
        self.transition(RunStatus::Failed);
    }

    pub fn observed(&self) -> &HashSet<EntityKey> {
        &self.observed
    }

    /// Kinds that fetched every page.
    pub fn completed_kinds(&self) -> impl Iterator<Item = &str> {
        self.statistics
            .kinds
            .iter()
            .filter(|(_, s)| s.completed)
            .map(|(k, _)| k.as_str())
    }

    pub fn statistics(&self) -> &RunStatistics {
        &self.statistics
    }

    pub fn into_report(self) -> ResyncReport {
        let partial_failure = !self.failed_kinds.is_empty()
            || self.statistics.mapping_failures() > 0
            || self.statistics.upsert_failures() > 0
            || self.statistics.delete_failures > 0;
        ResyncReport {
            run_id: self.run_id,
            integration: self.integration,
            status: self.status,
            started_at: self.started_at,
            finished_at: Utc::now(),
            statistics: self.statistics,
            failed_kinds: self.failed_kinds,
            partial_failure,
            error: self.error,
        }
    }
}

/// Outcome of a resync run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResyncReport {
    pub run_id: RunId,
    pub integration: IntegrationId,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub statistics: RunStatistics,
    /// Kinds that could not be fetched completely.
    pub failed_kinds: Vec<String>,
    /// Some kind, object, or write failed while the run itself went on.
    pub partial_failure: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResyncReport {
    pub fn is_completed(&self) -> bool {
        self.status == RunStatus::Completed
    }
}
