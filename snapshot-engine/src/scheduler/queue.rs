//! Job queue substrate.
//!
//! At most one job per unique key is pending or running at any time.
//! Enqueuing a key that is pending moves its run time; enqueuing a key that
//! is running does nothing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

use super::SchedulerError;
use crate::contracts::{JobStatus, NewJob, ScheduledJob};

/// How to address a job for manual cancellation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobSelector {
    Id(Uuid),
    Key(String),
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Insert a job, or reschedule the pending job with the same key.
    async fn enqueue(&self, job: NewJob) -> Result<ScheduledJob, SchedulerError>;

    /// Like `enqueue`, for jobs that reschedule themselves after each run.
    async fn schedule_recurring(&self, job: NewJob) -> Result<ScheduledJob, SchedulerError>;

    /// Lock up to `limit` jobs that are due, or whose lock has expired.
    async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ScheduledJob>, SchedulerError>;

    /// Release a claimed job. One-shot jobs are removed, recurring jobs are
    /// rescheduled one interval later.
    ///
    /// `attempt` is the attempt count the worker claimed the job with; a
    /// completion from a worker whose lock expired and was reclaimed is
    /// ignored.
    async fn complete(&self, job_id: Uuid, attempt: u32, error: Option<String>) -> Result<(), SchedulerError>;

    /// Remove a job. Returns whether a job was found.
    async fn cancel(&self, selector: JobSelector) -> Result<bool, SchedulerError>;

    async fn list(&self) -> Result<Vec<ScheduledJob>, SchedulerError>;
}

#[derive(Debug, Default)]
pub struct InMemoryJobQueue {
    jobs: DashMap<Uuid, ScheduledJob>,
    keys: DashMap<String, Uuid>,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn build(job: NewJob) -> ScheduledJob {
        ScheduledJob {
            id: Uuid::new_v4(),
            kind: job.kind,
            unique_key: job.unique_key,
            payload: job.payload,
            status: JobStatus::Pending,
            run_at: job.run_at,
            lock_until: None,
            lock_lifetime_ms: u64::try_from(job.lock_lifetime.as_millis()).unwrap_or(u64::MAX),
            recurring_interval_secs: job.recurring_interval.map(|i| i.as_secs()),
            attempts: 0,
            last_error: None,
            created_at: Utc::now(),
        }
    }

    fn is_claimable(job: &ScheduledJob, now: DateTime<Utc>) -> bool {
        match job.status {
            JobStatus::Pending => job.run_at <= now,
            JobStatus::Running => job.lock_until.map_or(true, |until| until <= now),
        }
    }

    fn is_claimed_by(job: &ScheduledJob, attempt: u32) -> bool {
        job.status == JobStatus::Running && job.attempts == attempt
    }

    fn lock_until(job: &ScheduledJob, now: DateTime<Utc>) -> DateTime<Utc> {
        let lifetime = chrono::Duration::from_std(job.lock_lifetime()).unwrap_or_else(|_| chrono::Duration::minutes(5));
        now + lifetime
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, job: NewJob) -> Result<ScheduledJob, SchedulerError> {
        let Some(key) = job.unique_key.clone() else {
            let scheduled = Self::build(job);
            self.jobs.insert(scheduled.id, scheduled.clone());
            return Ok(scheduled);
        };

        // The key entry stays locked while the job map is touched, which
        // makes insert-if-absent atomic per key.
        match self.keys.entry(key) {
            Entry::Occupied(existing) => {
                let id = *existing.get();
                match self.jobs.get_mut(&id) {
                    Some(mut current) => {
                        if current.status == JobStatus::Pending {
                            current.run_at = job.run_at;
                            current.payload = job.payload;
                            current.recurring_interval_secs = job.recurring_interval.map(|i| i.as_secs());
                        }
                        Ok(current.clone())
                    }
                    None => {
                        // Key outlived its job; replace both.
                        let scheduled = Self::build(job);
                        self.jobs.insert(scheduled.id, scheduled.clone());
                        existing.replace_entry(scheduled.id);
                        Ok(scheduled)
                    }
                }
            }
            Entry::Vacant(slot) => {
                let scheduled = Self::build(job);
                self.jobs.insert(scheduled.id, scheduled.clone());
                slot.insert(scheduled.id);
                Ok(scheduled)
            }
        }
    }

    async fn schedule_recurring(&self, job: NewJob) -> Result<ScheduledJob, SchedulerError> {
        if job.recurring_interval.is_none() {
            return Err(SchedulerError::InvalidJob(format!("{} has no recurring interval", job.kind)));
        }
        if job.unique_key.is_none() {
            return Err(SchedulerError::InvalidJob(format!("{} has no unique key", job.kind)));
        }
        self.enqueue(job).await
    }

    async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ScheduledJob>, SchedulerError> {
        let mut due: Vec<(DateTime<Utc>, Uuid)> = self
            .jobs
            .iter()
            .filter(|job| Self::is_claimable(job, now))
            .map(|job| (job.run_at, job.id))
            .collect();
        due.sort();

        let mut claimed = Vec::new();
        for (_, id) in due {
            if claimed.len() >= limit {
                break;
            }
            if let Some(mut job) = self.jobs.get_mut(&id) {
                // Another worker may have claimed it since the scan.
                if !Self::is_claimable(&job, now) {
                    continue;
                }
                job.status = JobStatus::Running;
                job.lock_until = Some(Self::lock_until(&job, now));
                job.attempts += 1;
                claimed.push(job.clone());
            }
        }

        Ok(claimed)
    }

    async fn complete(&self, job_id: Uuid, attempt: u32, error: Option<String>) -> Result<(), SchedulerError> {
        let recurring = match self.jobs.get_mut(&job_id) {
            Some(job) if !Self::is_claimed_by(&job, attempt) => {
                debug!(job_id = %job_id, attempt, current = job.attempts, "Ignoring stale job completion");
                return Ok(());
            }
            Some(mut job) => match job.recurring_interval() {
                Some(interval) => {
                    let interval = chrono::Duration::from_std(interval).unwrap_or_else(|_| chrono::Duration::hours(24));
                    job.status = JobStatus::Pending;
                    job.lock_until = None;
                    job.run_at = Utc::now() + interval;
                    job.last_error = error;
                    true
                }
                None => false,
            },
            // Cancelled while running.
            None => return Ok(()),
        };

        if !recurring {
            if let Some((_, job)) = self.jobs.remove_if(&job_id, |_, job| Self::is_claimed_by(job, attempt)) {
                if let Some(key) = job.unique_key {
                    self.keys.remove_if(&key, |_, id| *id == job_id);
                }
            }
        }

        Ok(())
    }

    async fn cancel(&self, selector: JobSelector) -> Result<bool, SchedulerError> {
        let id = match selector {
            JobSelector::Id(id) => Some(id),
            JobSelector::Key(key) => self.keys.get(&key).map(|id| *id),
        };

        let Some(id) = id else {
            return Ok(false);
        };

        match self.jobs.remove(&id) {
            Some((_, job)) => {
                if let Some(key) = job.unique_key {
                    self.keys.remove_if(&key, |_, mapped| *mapped == id);
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list(&self) -> Result<Vec<ScheduledJob>, SchedulerError> {
        let mut jobs: Vec<ScheduledJob> = self.jobs.iter().map(|j| j.value().clone()).collect();
        jobs.sort_by_key(|j| (j.run_at, j.id));
        Ok(jobs)
    }
}
