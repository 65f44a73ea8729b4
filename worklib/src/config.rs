use std::path::PathBuf;
use std::time::Duration;

/// Whether the poller deletes messages from the work queue once it has handled them.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AckPolicy {
    /// Ack after the pipeline finished with the delivery, whatever the outcome.
    #[default]
    AfterProcessing,
    /// Never ack. Consumed messages come back only if the queue redelivers them, as a
    /// `DirQueue` with a visibility timeout does.
    Never,
}

/// Bounded wait for input files to show up in the working directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StagingConfig {
    /// Sleep between two presence checks of a missing file.
    pub presence_interval: Duration,
    /// Checks per file before staging fails with a timeout.
    pub presence_attempts: u32,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            presence_interval: Duration::from_secs(5),
            presence_attempts: 12,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Name used in status notifications.
    pub worker_name: String,
    /// Parent of the per-job working directories.
    pub spool_dir: PathBuf,
    /// Sleep after a poll that returned no message.
    pub poll_interval: Duration,
    pub staging: StagingConfig,
    pub ack_policy: AckPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_name: std::env::var("HOSTNAME").unwrap_or_else(|_| "worker".to_string()),
            spool_dir: PathBuf::from("/var/spool/worker/jobs"),
            poll_interval: Duration::from_secs(3),
            staging: StagingConfig::default(),
            ack_policy: AckPolicy::default(),
        }
    }
}

impl WorkerConfig {
    pub fn new(worker_name: impl Into<String>, spool_dir: impl Into<PathBuf>) -> Self {
        Self {
            worker_name: worker_name.into(),
            spool_dir: spool_dir.into(),
            ..Default::default()
        }
    }

    pub fn working_dir(&self, job_id: &str) -> PathBuf {
        self.spool_dir.join(job_id)
    }
}
