//! The job-tracking sidecar (spec §1, §6): an optional, separate record kept
//! alongside a cluster for progress reporting. It shares the cluster's
//! registry scope but is never consulted by `balance` or `watch::run` — a
//! job's status has no bearing on membership.
//!
//! Grounded on the teacher's `search_jobs`/`work_blocks` rows (`db/jobs.rs`),
//! narrowed to the fields the job-tracking interface actually names:
//! parent, id, name, progress, total, tag, status.

use crate::config::{generate_hex_token, validate_instance_id};
use crate::error::{ClusterError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Wait,
    Active,
    Complete,
    Fail,
}

impl JobStatus {
    /// The only legal transitions: `Wait -> Active -> {Complete, Fail}`.
    /// Anything else, including no-ops, is a caller error.
    fn can_advance_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Wait, JobStatus::Active)
                | (JobStatus::Active, JobStatus::Complete)
                | (JobStatus::Active, JobStatus::Fail)
        )
    }
}

/// A progress-tracking record, independent of cluster membership.
#[derive(Debug, Clone)]
pub struct Job {
    pub cluster_key: String,
    pub id: String,
    pub name: Option<String>,
    pub tag: Option<String>,
    pub parent_id: Option<String>,
    pub parent_cluster_key: Option<String>,
    pub progress: u64,
    pub total: u64,
    pub status: JobStatus,
}

impl Job {
    /// Creates a job scoped to `cluster_key`. `id` is validated if given
    /// (2..=32 ASCII alphanumeric, the same rule as `instance_id`);
    /// otherwise a fresh 32-char hex token is generated.
    pub fn new(cluster_key: &str, id: Option<&str>) -> Result<Self> {
        let id = match id {
            Some(id) => {
                validate_instance_id(id)?;
                id.to_string()
            }
            None => generate_hex_token(),
        };
        Ok(Job {
            cluster_key: cluster_key.to_string(),
            id,
            name: None,
            tag: None,
            parent_id: None,
            parent_cluster_key: None,
            progress: 0,
            total: 0,
            status: JobStatus::Wait,
        })
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = Some(name.into());
    }

    pub fn set_tag(&mut self, tag: impl Into<String>) {
        self.tag = Some(tag.into());
    }

    pub fn set_progress(&mut self, progress: u64) {
        self.progress = progress;
    }

    pub fn set_total(&mut self, total: u64) {
        self.total = total;
    }

    /// Links `self` under `parent`. Rejects when the two jobs belong to
    /// different clusters — comparing against the *parent's* cluster key,
    /// not the child's own (resolved open question; the source compared a
    /// job's cluster against itself, which can never fail).
    pub fn set_parent(&mut self, parent: &Job) -> Result<()> {
        if self.cluster_key != parent.cluster_key {
            return Err(ClusterError::Invalid(format!(
                "job cluster {:?} does not match parent cluster {:?}",
                self.cluster_key, parent.cluster_key
            )));
        }
        self.parent_id = Some(parent.id.clone());
        self.parent_cluster_key = Some(parent.cluster_key.clone());
        Ok(())
    }

    /// Advances status, rejecting any transition other than
    /// `Wait -> Active -> {Complete, Fail}`.
    pub fn set_status(&mut self, next: JobStatus) -> Result<()> {
        if !self.status.can_advance_to(next) {
            return Err(ClusterError::Invalid(format!(
                "illegal job status transition {:?} -> {:?}",
                self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }

    /// Formats a progress line: `[tag:progress+1/total] message`. The
    /// `+1` reflects that a log call reports the step just completed,
    /// one past the currently stored `progress`; `log` does not itself
    /// advance `progress` (callers do that via `set_progress`).
    pub fn log(&self, message: &str) -> String {
        format!(
            "[{}:{}/{}] {}",
            self.tag.as_deref().unwrap_or(&self.id),
            self.progress + 1,
            self.total,
            message
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_generates_a_valid_id_when_none_given() {
        let job = Job::new("cluster", None).unwrap();
        assert_eq!(job.id.len(), 32);
    }

    #[test]
    fn new_validates_a_supplied_id() {
        assert!(Job::new("cluster", Some("a")).is_err());
        assert!(Job::new("cluster", Some("ok-id")).is_err());
        assert!(Job::new("cluster", Some("okid")).is_ok());
    }

    #[test]
    fn status_follows_wait_active_complete_or_fail() {
        let mut job = Job::new("cluster", Some("okid")).unwrap();
        assert!(job.set_status(JobStatus::Complete).is_err());
        job.set_status(JobStatus::Active).unwrap();
        assert!(job.set_status(JobStatus::Active).is_err());
        job.set_status(JobStatus::Complete).unwrap();
        assert!(job.set_status(JobStatus::Fail).is_err());
    }

    #[test]
    fn set_parent_rejects_cross_cluster_linkage() {
        let parent = Job::new("cluster-a", Some("parentid")).unwrap();
        let mut child = Job::new("cluster-b", Some("childid")).unwrap();
        assert!(child.set_parent(&parent).is_err());

        let mut same_cluster_child = Job::new("cluster-a", Some("childid")).unwrap();
        assert!(same_cluster_child.set_parent(&parent).is_ok());
        assert_eq!(same_cluster_child.parent_id.as_deref(), Some("parentid"));
    }

    #[test]
    fn log_formats_tag_progress_and_total() {
        let mut job = Job::new("cluster", Some("okid")).unwrap();
        job.set_tag("scan");
        job.set_total(10);
        job.set_progress(3);
        assert_eq!(job.log("chunk done"), "[scan:4/10] chunk done");
    }

    #[test]
    fn log_falls_back_to_id_when_untagged() {
        let job = Job::new("cluster", Some("okid")).unwrap();
        assert_eq!(job.log("hi"), "[okid:1/0] hi");
    }
}
