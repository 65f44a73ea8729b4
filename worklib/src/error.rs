use crate::record::JobStatus;
use crate::types::JobId;
use std::{io, path::PathBuf, result};
use thiserror;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("ParseError: {0}")]
    Parse(String),
    #[error("job id {0:?} is not a usable directory name")]
    InvalidJobId(JobId),
    #[error("input file {file} still missing after {attempts} checks")]
    StagingTimeout { file: String, attempts: u32 },
    #[error("refusing to write {0:?} outside the working directory")]
    UnsafeFileName(String),
    #[error("job {job_id}: illegal status transition {from} -> {to}")]
    InvalidTransition {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    },
    #[error("no record for job {0}")]
    RecordNotFound(JobId),
    #[error("work queue: {0}")]
    Queue(String),
    #[error("object store: {0}")]
    ObjectStore(String),
    #[error("record store: {0}")]
    RecordStore(String),
    #[error("record database: {0}")]
    Database(#[from] sqlx::Error),
    #[error("failed to spawn {path:?}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// True for failures of the external queue, object store or record store.
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            Error::Queue(_) | Error::ObjectStore(_) | Error::RecordStore(_) | Error::Database(_)
        )
    }
}

pub type Result<T> = result::Result<T, Error>;
