use crate::actors::reporter::StatusReporter;
use crate::config::{AckPolicy, WorkerConfig};
use crate::error::{Error, Result};
use crate::executor::{ExitState, ScriptExecutor};
use crate::job::JobSpec;
use crate::publisher::OutputPublisher;
use crate::record::{JobStatus, RecordManager, RecordUpdate};
use crate::services::{Delivery, NotificationQueue, ObjectStore, RecordStore, WorkQueue};
use crate::stager::InputStager;
use chrono::Utc;
use std::path::{Component, Path};
use std::sync::Arc;
use tokio::time;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// The external services a worker talks to.
#[derive(Clone)]
pub struct Services {
    pub work_queue: Arc<dyn WorkQueue>,
    pub notifications: Arc<dyn NotificationQueue>,
    pub objects: Arc<dyn ObjectStore>,
    pub records: Arc<dyn RecordStore>,
}

/// How the pipeline left one delivery.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobOutcome {
    /// The script ran; outputs were published best-effort, and a failure to publish them
    /// is only logged.
    Finished { exit: ExitState },
    /// The body could not be parsed. The record is `error` and the message is dropped.
    Poisoned,
    /// A redelivery of a job that already reached (or died in) a later state.
    Skipped { status: JobStatus },
    /// Staging, execution or a service call failed.
    Failed { error: String },
}

/// Polls the work queue and drives each job through stage, execute and publish.
///
/// Jobs are handled strictly one after another; running several workers against the same
/// queue is the only way to scale out. An interrupt stops the process wherever it is: the
/// working directory stays behind and a running job's record stays `running` until the
/// message is redelivered.
pub struct Worker {
    config: WorkerConfig,
    work_queue: Arc<dyn WorkQueue>,
    records: RecordManager,
    stager: InputStager,
    executor: ScriptExecutor,
    publisher: OutputPublisher,
    reporter: StatusReporter,
}

impl Worker {
    /// Build a worker. Must be called from within a tokio runtime.
    pub fn new(config: WorkerConfig, services: Services) -> Self {
        let Services {
            work_queue,
            notifications,
            objects,
            records,
        } = services;
        Self {
            stager: InputStager::new(objects.clone(), config.staging.clone()),
            publisher: OutputPublisher::new(objects),
            records: RecordManager::new(records),
            reporter: StatusReporter::spawn(notifications),
            executor: ScriptExecutor,
            work_queue,
            config,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Poll forever, sleeping the poll interval whenever the queue is empty.
    pub async fn run(&self) {
        info!(
            worker = %self.config.worker_name,
            spool = %self.config.spool_dir.display(),
            "worker started"
        );
        loop {
            match self.run_once().await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(delay = ?self.config.poll_interval, "queue empty, sleeping");
                    time::sleep(self.config.poll_interval).await;
                }
                Err(err) => {
                    error!(error = %err, "failed to poll the work queue");
                    time::sleep(self.config.poll_interval).await;
                }
            }
        }
    }

    /// Receive at most one message and, if there was one, process it completely.
    ///
    /// Returns whether a message was handled. Only a failing receive is an error; whatever
    /// happens to the job itself is logged and recorded.
    pub async fn run_once(&self) -> Result<bool> {
        let delivery = match self.poll_once().await? {
            Some(delivery) => delivery,
            None => return Ok(false),
        };
        let span = info_span!("job", job_id = %delivery.id);
        async {
            let outcome = self.process(&delivery).await;
            debug!(?outcome, "job handled");
            if self.config.ack_policy == AckPolicy::AfterProcessing {
                if let Err(err) = self.work_queue.ack(&delivery.receipt).await {
                    warn!(error = %err, "failed to acknowledge message");
                }
            }
        }
        .instrument(span)
        .await;
        Ok(true)
    }

    pub async fn poll_once(&self) -> Result<Option<Delivery>> {
        self.work_queue.receive_one().await
    }

    /// Run the whole pipeline for one delivery. Never fails: every failure ends up in the
    /// log and, where the transition allows it, in the job record.
    pub async fn process(&self, delivery: &Delivery) -> JobOutcome {
        let job_id = delivery.id.as_str();
        info!(receipt = %delivery.receipt, "RECV");
        debug!(body = %delivery.body, "message body");
        self.reporter.received(&self.config.worker_name, job_id);

        match self.receive(job_id).await {
            Ok(None) => {}
            Ok(Some(status)) => return JobOutcome::Skipped { status },
            Err(err) => {
                error!(error = %err, "could not record job receipt");
                return JobOutcome::Failed {
                    error: err.to_string(),
                };
            }
        }

        let spec = match JobSpec::parse(&delivery.body) {
            Ok(spec) => spec,
            Err(err) => {
                warn!(error = %err, "discarding malformed job");
                self.mark_error(job_id, &err).await;
                return JobOutcome::Poisoned;
            }
        };

        match self.execute_and_publish(job_id, &spec).await {
            Ok(exit) => JobOutcome::Finished { exit },
            Err(err) => {
                if err.is_remote() {
                    error!(error = %err, "remote service failure");
                } else {
                    error!(error = %err, "job failed");
                }
                self.mark_error(job_id, &err).await;
                JobOutcome::Failed {
                    error: err.to_string(),
                }
            }
        }
    }

    /// Load or create the record and move it to `pending`.
    ///
    /// Returns the stored status instead when the job must not run again.
    async fn receive(&self, job_id: &str) -> Result<Option<JobStatus>> {
        let record = self.records.get_or_create(job_id).await?;
        match record.status {
            status if status.is_terminal() => {
                info!(%status, "job already done, skipping redelivery");
                Ok(Some(status))
            }
            JobStatus::Running => {
                warn!("job was running when its previous worker stopped, marking it failed");
                self.records
                    .update(
                        job_id,
                        RecordUpdate::status(JobStatus::Error)
                            .error("interrupted: worker stopped while the job was running"),
                    )
                    .await?;
                Ok(Some(JobStatus::Running))
            }
            _ => {
                self.records
                    .update(
                        job_id,
                        RecordUpdate::status(JobStatus::Pending).received_at(Utc::now()),
                    )
                    .await?;
                Ok(None)
            }
        }
    }

    async fn execute_and_publish(&self, job_id: &str, spec: &JobSpec) -> Result<ExitState> {
        if !is_single_component(job_id) {
            return Err(Error::InvalidJobId(job_id.to_string()));
        }
        let workdir = self.config.working_dir(job_id);

        self.records
            .update(job_id, RecordUpdate::default().bucket(spec.bucket.as_str()))
            .await?;
        self.stager
            .stage(job_id, &spec.bucket, &spec.files, &workdir)
            .await?;

        let started_at = Utc::now();
        self.records
            .update(
                job_id,
                RecordUpdate::status(JobStatus::Running).started_at(started_at),
            )
            .await?;
        self.reporter.started(job_id, started_at);

        let execution = self
            .executor
            .run(job_id, &spec.script, &spec.arguments.to_argv(), &workdir)
            .await?;

        let finished_at = Utc::now();
        self.records
            .update(
                job_id,
                RecordUpdate::status(JobStatus::Finished)
                    .finished_at(finished_at)
                    .exit_code(execution.exit.code()),
            )
            .await?;
        self.reporter.finished(job_id, finished_at);

        // the record is already final, so publishing problems stay in the log
        match self.publisher.publish(job_id, &spec.bucket, &workdir).await {
            Ok(report) => info!(
                uploaded = report.uploaded.len(),
                failed = report.failed.len(),
                "done putting files"
            ),
            Err(err) => error!(error = %err, "could not list the working directory"),
        }
        Ok(execution.exit)
    }

    /// Move the record to `error`. Records that already finished keep their status.
    async fn mark_error(&self, job_id: &str, err: &Error) {
        let update = RecordUpdate::status(JobStatus::Error).error(err.to_string());
        match self.records.update(job_id, update).await {
            Ok(_) => {}
            Err(Error::InvalidTransition { from, .. }) => {
                debug!(status = %from, "record left as is");
            }
            Err(update_err) => {
                error!(error = %update_err, "failed to record job error");
            }
        }
    }

    /// Wait until all status notifications sent so far have reached the queue.
    pub async fn flush_notifications(&self) {
        self.reporter.flush().await;
    }
}

fn is_single_component(job_id: &str) -> bool {
    let mut components = Path::new(job_id).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    ) && !job_id.contains('/')
}
