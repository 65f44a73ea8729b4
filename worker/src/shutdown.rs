use std::{io, process};
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;

/// Exit the process as soon as SIGINT or SIGTERM arrives.
///
/// Nothing is drained or rolled back: an in-flight job keeps its working directory and
/// its record stays in whatever state it had reached.
pub fn exit_on_interrupt() -> io::Result<()> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => info!("caught SIGINT, exiting"),
            _ = sigterm.recv() => info!("caught SIGTERM, exiting"),
        }
        process::exit(130);
    });
    Ok(())
}
