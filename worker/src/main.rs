mod arg_parser;
mod shutdown;

use arg_parser::ArgParser;
use clap::Parser;
use std::{error, sync::Arc};
use tracing::info;
use tracing_subscriber::EnvFilter;
use worklib::backends::{
    fs::{DirObjectStore, DirQueue},
    sqlite::SqliteRecordStore,
};
use worklib::{Services, Worker};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = ArgParser::parse();
    args.check()?;
    let config = args.worker_config();
    let services = connect(&args).await?;

    shutdown::exit_on_interrupt()?;
    info!(
        work_queue = %args.work_queue.display(),
        status_queue = %args.status_queue.display(),
        "connected"
    );
    Worker::new(config, services).run().await;
    Ok(())
}

async fn connect(args: &ArgParser) -> worklib::Result<Services> {
    let mut work_queue = DirQueue::open(&args.work_queue).await?;
    if let Some(timeout) = args.visibility_timeout() {
        work_queue = work_queue.with_visibility_timeout(timeout);
    }
    Ok(Services {
        work_queue: Arc::new(work_queue),
        notifications: Arc::new(DirQueue::open(&args.status_queue).await?),
        objects: Arc::new(DirObjectStore::new(&args.object_store)),
        records: Arc::new(SqliteRecordStore::open(&args.records).await?),
    })
}
