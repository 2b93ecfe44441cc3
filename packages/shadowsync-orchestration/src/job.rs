use crate::error::{OrchestratorError, Result};
use serde::{Deserialize, Serialize};
use shadowsync_storage::{JobEntry, TaskStatus};
use std::collections::BTreeSet;

/// Pipeline stage, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Stage {
    IngestRaw,
    Invalidate,
    ReIngestRaw,
    PopulateShadow,
    PopulateMembership,
    SyncReal,
    UpdateFields,
    DownstreamAggregates,
}

impl Stage {
    pub const ALL: [Stage; 8] = [
        Stage::IngestRaw,
        Stage::Invalidate,
        Stage::ReIngestRaw,
        Stage::PopulateShadow,
        Stage::PopulateMembership,
        Stage::SyncReal,
        Stage::UpdateFields,
        Stage::DownstreamAggregates,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::IngestRaw => "ingest-raw",
            Stage::Invalidate => "invalidate",
            Stage::ReIngestRaw => "re-ingest-raw",
            Stage::PopulateShadow => "populate-shadow",
            Stage::PopulateMembership => "populate-membership",
            Stage::SyncReal => "sync-real",
            Stage::UpdateFields => "update-fields",
            Stage::DownstreamAggregates => "downstream-aggregates",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        Stage::ALL
            .iter()
            .copied()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| OrchestratorError::UnknownStage(s.to_string()))
    }

    /// This stage and every later one
    pub fn and_following(&self) -> &'static [Stage] {
        let index = STAGE_ORDER.iter().position(|s| s == self).unwrap_or(0);
        &STAGE_ORDER[index..]
    }
}

static STAGE_ORDER: [Stage; 8] = Stage::ALL;

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A recorded job plus the stages it has already completed.
#[derive(Debug, Clone)]
pub struct JobProgress {
    pub job: JobEntry,
    pub completed: BTreeSet<Stage>,
}

impl JobProgress {
    pub fn new(job: JobEntry, tasks: &[TaskStatus]) -> Self {
        // unknown task names come from other tools sharing the ledger
        let completed = tasks
            .iter()
            .filter_map(|task| Stage::from_str(&task.task_name).ok())
            .collect();
        Self { job, completed }
    }

    pub fn is_complete(&self) -> bool {
        Stage::ALL.iter().all(|s| self.completed.contains(s))
    }

    /// Stages still to run. With `from_stage`, everything from that stage on
    /// runs regardless of what was recorded.
    pub fn pending(&self, from_stage: Option<Stage>) -> Vec<Stage> {
        match from_stage {
            Some(from) => from.and_following().to_vec(),
            None => Stage::ALL
                .iter()
                .copied()
                .filter(|s| !self.completed.contains(s))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use shadowsync_storage::DiffResult;

    fn progress(done: &[&str]) -> JobProgress {
        let now = Utc::now();
        let job = JobEntry {
            job_id: 1,
            job_date: now.date_naive(),
            timezone: "UTC".to_string(),
            current_snapshot_ts: now,
            previous_snapshot_ts: None,
            diff: DiffResult::default(),
            created_at: now,
        };
        let tasks: Vec<TaskStatus> = done
            .iter()
            .map(|name| TaskStatus::new(1, *name, now, now))
            .collect();
        JobProgress::new(job, &tasks)
    }

    #[test]
    fn test_stage_roundtrip() {
        for stage in Stage::ALL {
            assert_eq!(Stage::from_str(stage.as_str()).unwrap(), stage);
        }
        assert!(matches!(
            Stage::from_str("populate"),
            Err(OrchestratorError::UnknownStage(_))
        ));
    }

    #[test]
    fn test_stage_order_matches_declaration() {
        let mut sorted = Stage::ALL.to_vec();
        sorted.sort();
        assert_eq!(sorted, Stage::ALL.to_vec());
    }

    #[test]
    fn test_and_following() {
        assert_eq!(
            Stage::UpdateFields.and_following(),
            &[Stage::UpdateFields, Stage::DownstreamAggregates]
        );
        assert_eq!(Stage::IngestRaw.and_following().len(), 8);
    }

    #[test]
    fn test_pending_skips_recorded_stages() {
        let p = progress(&["ingest-raw", "invalidate", "legacy-task"]);
        assert!(!p.is_complete());
        let pending = p.pending(None);
        assert_eq!(pending.first(), Some(&Stage::ReIngestRaw));
        assert_eq!(pending.len(), 6);
    }

    #[test]
    fn test_from_stage_forces_rerun() {
        let all: Vec<&str> = Stage::ALL.iter().map(|s| s.as_str()).collect();
        let p = progress(&all);
        assert!(p.is_complete());
        assert!(p.pending(None).is_empty());
        assert_eq!(
            p.pending(Some(Stage::SyncReal)),
            vec![Stage::SyncReal, Stage::UpdateFields, Stage::DownstreamAggregates]
        );
    }
}
