//! Stale build job collection
//!
//! Deletes a caller's completed build jobs once they are older than the
//! retention window. Runs at the start of every build and on demand.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use sdk::errors::{BuildError, BuildStep, ValidationError};
use sdk::types::JobRecord;
use uuid::Uuid;

use crate::gateway::ClusterResourceGateway;
use crate::session::job_name_prefix;

/// Deletes completed jobs past their retention window
pub struct JobReaper {
    gateway: Arc<dyn ClusterResourceGateway>,
}

/// Whether `job` is a completed job that finished before `cutoff`
///
/// Completed jobs without a completion time are kept.
pub fn is_expired(job: &JobRecord, cutoff: DateTime<Utc>) -> bool {
    if !job.is_completed() {
        return false;
    }
    match job.completion_time {
        Some(completed) => completed < cutoff,
        None => {
            tracing::debug!("Job {} is complete but has no completion time", job.name);
            false
        }
    }
}

/// Whether `name` is exactly `<prefix><uuid>`
///
/// Keeps a caller from reaping jobs of another caller whose id starts with
/// the same characters.
fn owned_by_prefix(name: &str, prefix: &str) -> bool {
    name.strip_prefix(prefix)
        .map(|rest| Uuid::parse_str(rest).is_ok())
        .unwrap_or(false)
}

impl JobReaper {
    pub fn new(gateway: Arc<dyn ClusterResourceGateway>) -> Self {
        Self { gateway }
    }

    /// Delete the caller's completed jobs older than `max_age_hours`
    ///
    /// Returns the number of jobs deleted. Individual deletion failures are
    /// logged and skipped; only a failed listing or a window reaching past
    /// the representable time range is an error.
    pub async fn reap(&self, caller_id: &str, max_age_hours: u32) -> Result<usize, BuildError> {
        self.reap_at(caller_id, max_age_hours, Utc::now()).await
    }

    /// [`reap`](Self::reap) with an explicit notion of "now"
    pub async fn reap_at(
        &self,
        caller_id: &str,
        max_age_hours: u32,
        now: DateTime<Utc>,
    ) -> Result<usize, BuildError> {
        let prefix = job_name_prefix(caller_id);
        let cutoff = now
            .checked_sub_signed(Duration::hours(i64::from(max_age_hours)))
            .ok_or(ValidationError::InvalidMaxAge(max_age_hours))?;

        let jobs = self
            .gateway
            .list_jobs(&prefix)
            .await
            .map_err(|e| BuildError::cluster(BuildStep::ReapJobs, e))?;

        let mut deleted = 0;
        for job in jobs
            .iter()
            .filter(|job| owned_by_prefix(&job.name, &prefix))
            .filter(|job| is_expired(job, cutoff))
        {
            match self.gateway.delete_job(&job.name).await {
                Ok(()) => {
                    tracing::info!("Reaped job {}", job.name);
                    deleted += 1;
                }
                Err(e) => {
                    tracing::warn!("Failed to reap job {}: {}", job.name, e);
                }
            }
        }

        tracing::debug!(
            "Reaped {} of {} jobs with prefix {}",
            deleted,
            jobs.len(),
            prefix
        );
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::InMemoryGateway;
    use sdk::types::JobCondition;

    fn completed(name: &str, at: Option<DateTime<Utc>>) -> JobRecord {
        JobRecord {
            name: name.to_string(),
            creation_time: None,
            completion_time: at,
            conditions: vec![JobCondition::new("Complete", "True")],
        }
    }

    #[test]
    fn test_is_expired() {
        let now = Utc::now();
        let cutoff = now - Duration::hours(24);

        assert!(is_expired(&completed("a", Some(now - Duration::hours(48))), cutoff));
        assert!(!is_expired(&completed("b", Some(now - Duration::hours(1))), cutoff));
        assert!(!is_expired(&completed("c", None), cutoff));

        let mut failed = completed("d", Some(now - Duration::hours(48)));
        failed.conditions = vec![JobCondition::new("Failed", "True")];
        assert!(!is_expired(&failed, cutoff));
    }

    #[test]
    fn test_owned_by_prefix() {
        let id = Uuid::new_v4();
        assert!(owned_by_prefix(&format!("build-alice-{}", id), "build-alice-"));
        assert!(!owned_by_prefix(&format!("build-alice-bob-{}", id), "build-alice-"));
        assert!(!owned_by_prefix("build-alice-manual", "build-alice-"));
        assert!(owned_by_prefix(&format!("build-{}", id), "build-"));
        assert!(!owned_by_prefix(&format!("build-alice-{}", id), "build-"));
    }

    #[tokio::test]
    async fn test_oversized_window_is_an_error() {
        let gateway = Arc::new(InMemoryGateway::new());
        gateway.insert_job_record(completed(
            &format!("build-alice-{}", Uuid::new_v4()),
            Some(Utc::now() - Duration::hours(48)),
        ));
        let reaper = JobReaper::new(gateway.clone());

        let err = reaper
            .reap_at("alice", u32::MAX, Utc::now())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            BuildError::Validation(ValidationError::InvalidMaxAge(u32::MAX))
        ));
        assert!(gateway.calls().is_empty());
        assert_eq!(gateway.job_names().len(), 1);
    }
}
