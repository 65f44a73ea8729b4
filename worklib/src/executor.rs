use crate::error::{Error, Result};
use std::os::unix::{fs::PermissionsExt, process::ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::{fs::Permissions, io, time::Duration};
use tokio::{
    fs,
    io::{AsyncRead, AsyncWriteExt},
    process::{Child, Command},
    task::JoinHandle,
    time,
};
use tracing::{debug, info};

// "Text file busy": a child forked by another thread can still hold the script's write fd.
const ETXTBSY: i32 = 26;
const SPAWN_ATTEMPTS: u32 = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitState {
    Exited { code: i32 },
    Killed { signal: i32 },
}

impl ExitState {
    pub fn code(self) -> Option<i32> {
        match self {
            ExitState::Exited { code } => Some(code),
            ExitState::Killed { .. } => None,
        }
    }
}

/// Files left behind by one script run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Execution {
    pub script: PathBuf,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
    pub exit: ExitState,
}

/// Runs job scripts to completion, one at a time, with no timeout.
#[derive(Clone, Copy, Debug, Default)]
pub struct ScriptExecutor;

impl ScriptExecutor {
    /// Write `script` to `<workdir>/<job_id>.job`, run it there with `args` and empty stdin,
    /// and capture its stdout and stderr in `<job_id>.job.o` and `<job_id>.job.e`.
    pub async fn run(
        &self,
        job_id: &str,
        script: &str,
        args: &[String],
        workdir: &Path,
    ) -> Result<Execution> {
        fs::create_dir_all(workdir).await?;
        let name = format!("{}.job", job_id);
        let script_path = workdir.join(&name);
        fs::write(&script_path, script).await?;
        fs::set_permissions(&script_path, Permissions::from_mode(0o755)).await?;

        info!(script = %name, ?args, "RUN");
        let mut child = spawn(&script_path, args, workdir).await?;

        let stdout_path = workdir.join(format!("{}.o", name));
        let stderr_path = workdir.join(format!("{}.e", name));
        // both pipes are drained while the child runs so neither can fill up and stall it
        let stdout_pump = pump(child.stdout.take(), stdout_path.clone());
        let stderr_pump = pump(child.stderr.take(), stderr_path.clone());

        let status = child.wait().await?;
        let (stdout_done, stderr_done) = futures::future::join(stdout_pump, stderr_pump).await;
        for done in [stdout_done, stderr_done] {
            done.map_err(|err| io::Error::new(io::ErrorKind::Other, err))??;
        }

        let exit = match status.code() {
            Some(code) => ExitState::Exited { code },
            None => ExitState::Killed {
                signal: status.signal().unwrap_or_default(),
            },
        };
        info!(script = %name, ?exit, "DONE");
        Ok(Execution {
            script: script_path,
            stdout: stdout_path,
            stderr: stderr_path,
            exit,
        })
    }
}

async fn spawn(script: &Path, args: &[String], workdir: &Path) -> Result<Child> {
    let mut attempt = 1;
    loop {
        let spawned = Command::new(script)
            .args(args)
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();
        match spawned {
            Ok(child) => return Ok(child),
            Err(err) if err.raw_os_error() == Some(ETXTBSY) && attempt < SPAWN_ATTEMPTS => {
                debug!(attempt, "script busy, retrying spawn");
                time::sleep(Duration::from_millis(10 * u64::from(attempt))).await;
                attempt += 1;
            }
            Err(source) => {
                return Err(Error::Spawn {
                    path: script.to_path_buf(),
                    source,
                })
            }
        }
    }
}

/// Copy a child pipe into `path` until EOF. A missing pipe still produces an empty file.
fn pump<R>(stream: Option<R>, path: PathBuf) -> JoinHandle<io::Result<()>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut file = fs::File::create(&path).await?;
        if let Some(mut stream) = stream {
            tokio::io::copy(&mut stream, &mut file).await?;
        }
        file.flush().await
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn run(script: &str, args: &[&str]) -> (tempfile::TempDir, Execution) {
        let tmp = tempfile::tempdir().unwrap();
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        let execution = ScriptExecutor
            .run("job", script, &args, tmp.path())
            .await
            .expect("script runs");
        (tmp, execution)
    }

    #[tokio::test]
    async fn captures_stdout_and_stderr_separately() {
        let (tmp, execution) = run("#!/bin/sh\necho out\necho err >&2\n", &[]).await;
        assert_eq!(execution.exit, ExitState::Exited { code: 0 });
        assert_eq!(execution.script, tmp.path().join("job.job"));
        assert_eq!(std::fs::read_to_string(&execution.stdout).unwrap(), "out\n");
        assert_eq!(std::fs::read_to_string(&execution.stderr).unwrap(), "err\n");
        let mode = std::fs::metadata(&execution.script).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[tokio::test]
    async fn passes_arguments_and_runs_in_the_working_directory() {
        let (tmp, execution) = run("#!/bin/sh\necho \"$1|$2\"\npwd\n", &["a b", "c"]).await;
        let out = std::fs::read_to_string(&execution.stdout).unwrap();
        let mut lines = out.lines();
        assert_eq!(lines.next(), Some("a b|c"));
        let cwd = std::fs::canonicalize(lines.next().unwrap()).unwrap();
        assert_eq!(cwd, std::fs::canonicalize(tmp.path()).unwrap());
    }

    #[tokio::test]
    async fn stdin_is_empty() {
        let (_tmp, execution) = run("#!/bin/sh\ncat\necho end\n", &[]).await;
        assert_eq!(std::fs::read_to_string(&execution.stdout).unwrap(), "end\n");
    }

    #[tokio::test]
    async fn large_output_on_both_streams_does_not_deadlock() {
        let script = "#!/bin/sh\ni=0\nwhile [ $i -lt 20000 ]; do\n\
                      echo \"stderr line $i\" >&2\n\
                      echo \"stdout line $i\"\n\
                      i=$((i+1))\ndone\n";
        let (_tmp, execution) = time::timeout(Duration::from_secs(60), run(script, &[]))
            .await
            .expect("script finishes");
        let out = std::fs::read_to_string(&execution.stdout).unwrap();
        let err = std::fs::read_to_string(&execution.stderr).unwrap();
        assert_eq!(out.lines().count(), 20000);
        assert_eq!(err.lines().count(), 20000);
    }

    #[tokio::test]
    async fn non_zero_exit_is_reported() {
        let (_tmp, execution) = run("#!/bin/sh\nexit 3\n", &[]).await;
        assert_eq!(execution.exit, ExitState::Exited { code: 3 });
        assert_eq!(execution.exit.code(), Some(3));
    }

    #[tokio::test]
    async fn killed_script_reports_the_signal() {
        let (_tmp, execution) = run("#!/bin/sh\nkill -9 $$\n", &[]).await;
        assert_eq!(execution.exit, ExitState::Killed { signal: 9 });
        assert_eq!(execution.exit.code(), None);
    }

    fn busy_script(dir: &Path) -> (PathBuf, std::fs::File) {
        let script = dir.join("busy.job");
        std::fs::write(&script, "#!/bin/sh\nexit 0\n").unwrap();
        std::fs::set_permissions(&script, Permissions::from_mode(0o755)).unwrap();
        let writer = std::fs::OpenOptions::new()
            .write(true)
            .open(&script)
            .unwrap();
        (script, writer)
    }

    #[tokio::test]
    async fn busy_script_is_retried_until_the_writer_closes() {
        let tmp = tempfile::tempdir().unwrap();
        let (script, writer) = busy_script(tmp.path());
        let closer = tokio::spawn(async move {
            time::sleep(Duration::from_millis(15)).await;
            drop(writer);
        });

        let mut child = spawn(&script, &[], tmp.path()).await.expect("spawn retried");
        assert!(child.wait().await.unwrap().success());
        closer.await.unwrap();
    }

    #[tokio::test]
    async fn busy_script_gives_up_after_the_attempt_bound() {
        let tmp = tempfile::tempdir().unwrap();
        let (script, _writer) = busy_script(tmp.path());

        match spawn(&script, &[], tmp.path()).await {
            Err(Error::Spawn { source, .. }) => assert_eq!(source.raw_os_error(), Some(ETXTBSY)),
            other => panic!("expected a busy spawn error, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn unrunnable_script_is_a_spawn_error() {
        let tmp = tempfile::tempdir().unwrap();
        let err = ScriptExecutor
            .run("job", "#!/nonexistent/interpreter\n", &[], tmp.path())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Spawn { .. }));
    }
}
