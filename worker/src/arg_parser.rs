use clap::{ArgEnum, Parser};
use std::path::PathBuf;
use std::time::Duration;
use worklib::{AckPolicy, StagingConfig, WorkerConfig};

/// Run jobs taken from a work queue
#[derive(Debug, Parser)]
pub struct ArgParser {
    /// Name announced in status notifications [default: $HOSTNAME]
    #[clap(long, env = "WORKER_NAME")]
    pub name: Option<String>,

    /// Directory holding one working directory per job
    #[clap(long, env = "WORKER_SPOOL_DIR", default_value = "/var/spool/worker/jobs")]
    pub spool_dir: PathBuf,

    /// Seconds to sleep after finding the work queue empty
    #[clap(long, env = "WORKER_POLL_INTERVAL", default_value = "3")]
    pub poll_interval: u64,

    /// Seconds between checks for a missing input file
    #[clap(long, env = "WORKER_PRESENCE_INTERVAL", default_value = "5")]
    pub presence_interval: u64,

    /// Checks for a missing input file before the job fails
    #[clap(long, env = "WORKER_PRESENCE_ATTEMPTS", default_value = "12")]
    pub presence_attempts: u32,

    /// When to delete handled messages from the work queue
    #[clap(long, arg_enum, env = "WORKER_ACK", default_value = "after-processing")]
    pub ack: Ack,

    /// Seconds before an unacknowledged work message is handed out again
    #[clap(long, env = "WORKER_VISIBILITY_TIMEOUT")]
    pub visibility_timeout: Option<u64>,

    /// Directory of the inbound work queue
    #[clap(long, env = "WORKER_WORK_QUEUE")]
    pub work_queue: PathBuf,

    /// Directory of the outbound status queue
    #[clap(long, env = "WORKER_STATUS_QUEUE")]
    pub status_queue: PathBuf,

    /// Root directory of the object store (one subdirectory per bucket)
    #[clap(long, env = "WORKER_OBJECT_STORE")]
    pub object_store: PathBuf,

    /// SQLite file holding the job records
    #[clap(long, env = "WORKER_RECORDS")]
    pub records: PathBuf,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ArgEnum)]
pub enum Ack {
    /// ack every message once it has been handled
    AfterProcessing,
    /// leave messages in flight until the visibility timeout returns them
    Never,
}

impl ArgParser {
    /// Reject combinations the directory queue cannot honour.
    pub fn check(&self) -> Result<(), String> {
        if self.ack == Ack::Never && self.visibility_timeout.is_none() {
            return Err(
                "--ack never needs --visibility-timeout: the work queue never redelivers \
                 on its own"
                    .to_string(),
            );
        }
        Ok(())
    }

    pub fn visibility_timeout(&self) -> Option<Duration> {
        self.visibility_timeout.map(Duration::from_secs)
    }

    pub fn worker_config(&self) -> WorkerConfig {
        let mut config = WorkerConfig {
            spool_dir: self.spool_dir.clone(),
            poll_interval: Duration::from_secs(self.poll_interval),
            staging: StagingConfig {
                presence_interval: Duration::from_secs(self.presence_interval),
                presence_attempts: self.presence_attempts,
            },
            ack_policy: match self.ack {
                Ack::AfterProcessing => AckPolicy::AfterProcessing,
                Ack::Never => AckPolicy::Never,
            },
            ..Default::default()
        };
        if let Some(name) = &self.name {
            config.worker_name = name.clone();
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REQUIRED: [&str; 9] = [
        "worker",
        "--work-queue",
        "/q/in",
        "--status-queue",
        "/q/out",
        "--object-store",
        "/store",
        "--records",
        "/db/records.sqlite",
    ];

    #[test]
    fn defaults() {
        let args = ArgParser::try_parse_from(REQUIRED).expect("parse");
        let config = args.worker_config();
        assert_eq!(config.spool_dir, PathBuf::from("/var/spool/worker/jobs"));
        assert_eq!(config.poll_interval, Duration::from_secs(3));
        assert_eq!(config.staging, StagingConfig::default());
        assert_eq!(config.ack_policy, AckPolicy::AfterProcessing);
        assert_eq!(args.records, PathBuf::from("/db/records.sqlite"));
    }

    #[test]
    fn overrides() {
        let mut argv = REQUIRED.to_vec();
        argv.extend([
            "--name",
            "node-7",
            "--poll-interval",
            "10",
            "--presence-attempts",
            "2",
            "--ack",
            "never",
            "--visibility-timeout",
            "600",
        ]);
        let args = ArgParser::try_parse_from(argv).expect("parse");
        assert!(args.check().is_ok());
        assert_eq!(args.visibility_timeout(), Some(Duration::from_secs(600)));
        let config = args.worker_config();
        assert_eq!(config.worker_name, "node-7");
        assert_eq!(config.poll_interval, Duration::from_secs(10));
        assert_eq!(config.staging.presence_attempts, 2);
        assert_eq!(config.ack_policy, AckPolicy::Never);
    }

    #[test]
    fn never_acking_requires_a_visibility_timeout() {
        let mut argv = REQUIRED.to_vec();
        argv.extend(["--ack", "never"]);
        let args = ArgParser::try_parse_from(argv).expect("parse");
        assert!(args.check().unwrap_err().contains("--visibility-timeout"));

        let args = ArgParser::try_parse_from(REQUIRED).expect("parse");
        assert!(args.check().is_ok());
        assert_eq!(args.visibility_timeout(), None);
    }

    #[test]
    fn queue_locations_are_required() {
        assert!(ArgParser::try_parse_from(["worker"]).is_err());
    }
}
