use crate::error::{Error, Result};
use crate::services::RecordStore;
use crate::types::{BucketName, JobId};
use chrono::{DateTime, Utc};
use std::{fmt, str::FromStr, sync::Arc};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum JobStatus {
    Queued,
    Pending,
    Running,
    Finished,
    Error,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Finished => "finished",
            JobStatus::Error => "error",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Finished | JobStatus::Error)
    }

    /// Whether a record in `self` may be moved to `next`.
    ///
    /// Staying put is allowed for the non-terminal states so other fields can be updated.
    pub fn can_become(self, next: JobStatus) -> bool {
        use JobStatus::*;
        if self == next {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (Queued, Pending)
                | (Pending, Running)
                | (Running, Finished)
                | (Pending, Error)
                | (Running, Error)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "finished" => Ok(JobStatus::Finished),
            "error" => Ok(JobStatus::Error),
            other => Err(Error::RecordStore(format!("unknown job status {:?}", other))),
        }
    }
}

/// Status mirror of one job. Diagnostic only, the job's real state is whatever the worker did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobRecord {
    pub job_id: JobId,
    pub status: JobStatus,
    pub bucket: Option<BucketName>,
    pub received_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
}

impl JobRecord {
    pub fn new(job_id: impl Into<JobId>, status: JobStatus) -> Self {
        Self {
            job_id: job_id.into(),
            status,
            bucket: None,
            received_at: None,
            started_at: None,
            finished_at: None,
            exit_code: None,
            error: None,
        }
    }
}

/// Fields to merge into a record. `None` leaves the stored value alone.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecordUpdate {
    pub status: Option<JobStatus>,
    pub bucket: Option<BucketName>,
    pub received_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
}

impl RecordUpdate {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn bucket(mut self, bucket: impl Into<BucketName>) -> Self {
        self.bucket = Some(bucket.into());
        self
    }

    pub fn received_at(mut self, at: DateTime<Utc>) -> Self {
        self.received_at = Some(at);
        self
    }

    pub fn started_at(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = Some(at);
        self
    }

    pub fn finished_at(mut self, at: DateTime<Utc>) -> Self {
        self.finished_at = Some(at);
        self
    }

    pub fn exit_code(mut self, code: Option<i32>) -> Self {
        self.exit_code = code;
        self
    }

    pub fn error(mut self, message: impl Into<String>) -> Self {
        self.error = Some(message.into());
        self
    }

    fn apply_to(self, record: &mut JobRecord) {
        if let Some(status) = self.status {
            record.status = status;
        }
        if self.bucket.is_some() {
            record.bucket = self.bucket;
        }
        if self.received_at.is_some() {
            record.received_at = self.received_at;
        }
        if self.started_at.is_some() {
            record.started_at = self.started_at;
        }
        if self.finished_at.is_some() {
            record.finished_at = self.finished_at;
        }
        if self.exit_code.is_some() {
            record.exit_code = self.exit_code;
        }
        if self.error.is_some() {
            record.error = self.error;
        }
    }
}

/// Get-or-create and update access to job records.
///
/// `update` reads the record, merges fields in memory and saves the whole record.
/// Nothing makes that sequence atomic: a crash (or a second writer) between the read
/// and the save can leave the stored record with only some of the intended fields.
/// The record is a diagnostic mirror, so this is tolerated rather than locked away.
#[derive(Clone)]
pub struct RecordManager {
    store: Arc<dyn RecordStore>,
}

impl RecordManager {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    pub async fn get_or_create(&self, job_id: &str) -> Result<JobRecord> {
        if let Some(record) = self.store.find_by_id(job_id).await? {
            return Ok(record);
        }
        self.store
            .create(JobRecord::new(job_id, JobStatus::Pending))
            .await
    }

    pub async fn update(&self, job_id: &str, fields: RecordUpdate) -> Result<JobRecord> {
        let mut record = self
            .store
            .find_by_id(job_id)
            .await?
            .ok_or_else(|| Error::RecordNotFound(job_id.to_string()))?;
        if let Some(next) = fields.status {
            if !record.status.can_become(next) {
                return Err(Error::InvalidTransition {
                    job_id: job_id.to_string(),
                    from: record.status,
                    to: next,
                });
            }
        }
        fields.apply_to(&mut record);
        self.store.save(&record).await?;
        Ok(record)
    }
}
