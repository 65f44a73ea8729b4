//! A queue-driven job worker.
//!
//! A [`Worker`] takes one job description at a time from a work queue, stages the job's
//! input files from an object store, runs the job's script, publishes the working
//! directory back to the object store and mirrors the job's lifecycle in a record store.

mod actors;
pub mod backends;
pub mod config;
pub mod error;
pub mod executor;
pub mod job;
pub mod poller;
pub mod publisher;
pub mod record;
pub mod services;
pub mod stager;
pub mod types;

pub use actors::reporter::StatusReporter;
pub use config::{AckPolicy, StagingConfig, WorkerConfig};
pub use error::{Error, Result};
pub use poller::{JobOutcome, Services, Worker};
pub use record::{JobRecord, JobStatus};
