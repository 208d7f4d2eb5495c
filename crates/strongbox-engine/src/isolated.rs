//! Execution of an operation in a `strongbox-launcher` child process.

use crate::worker::Operation;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use strongbox_lib::config::LauncherConfig;
use strongbox_lib::error::BackupError;
use strongbox_lib::paths;
use strongbox_lib::protocol::ProgressRecord;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct IsolatedWorker {
    program: PathBuf,
    extra_args: Vec<String>,
}

impl IsolatedWorker {
    pub fn new(program: impl Into<PathBuf>, extra_args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            extra_args,
        }
    }

    /// Uses the configured launcher, or the one installed next to the running executable.
    pub fn from_config(config: &LauncherConfig) -> Self {
        let program = config
            .command
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(paths::default_launcher_path);
        Self::new(program, config.args.clone())
    }

    pub fn program(&self) -> &PathBuf {
        &self.program
    }

    fn command(&self, op: &Operation) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.extra_args)
            .args(op.spec().launch_args().to_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        die_with_parent(&mut cmd);
        cmd
    }

    /// Runs the child to completion, applying its progress records to `op`,
    /// and settles the operation once the child has exited.
    pub async fn run(&self, op: &Arc<Operation>) {
        let uid = op.uid().to_string();
        debug!("Launching {:?} for operation {}", self.program, uid);

        let mut child = match self.command(op).spawn() {
            Ok(child) => child,
            Err(e) => {
                let err = BackupError::ProcessLaunch(format!("{:?}: {}", self.program, e));
                error!("{}", err);
                op.settle_after_exit(Some(err.to_string()));
                return;
            }
        };

        let stdout_task = child
            .stdout
            .take()
            .map(|stdout| tokio::spawn(read_records(stdout, op.clone())));
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(echo_stderr(stderr, uid.clone())));

        if let Some(task) = stdout_task {
            let _ = task.await;
        }
        if let Some(task) = stderr_task {
            let _ = task.await;
        }

        let exit_error = match child.wait().await {
            Ok(status) if status.success() => None,
            Ok(status) => Some(format!("launcher exited abnormally ({})", status)),
            Err(e) => Some(format!("failed to wait for launcher: {}", e)),
        };
        if op.settle_after_exit(exit_error) {
            info!("Isolated operation {} finished", uid);
        } else {
            warn!("Isolated operation {} did not succeed", uid);
        }
    }
}

/// Has the kernel kill the child when the parent thread exits.
#[cfg(target_os = "linux")]
fn die_with_parent(cmd: &mut Command) {
    // SAFETY: prctl is async-signal-safe and touches no parent state.
    unsafe {
        cmd.pre_exec(|| {
            if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

#[cfg(not(target_os = "linux"))]
fn die_with_parent(_cmd: &mut Command) {}

async fn read_records<R: AsyncRead + Unpin>(stdout: R, op: Arc<Operation>) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match ProgressRecord::decode(&line) {
                Ok(ProgressRecord::End) => break,
                Ok(record) => op.apply(record),
                Err(e) => debug!("Dropping launcher output: {}", e),
            },
            Ok(None) => break,
            Err(e) => {
                warn!("Failed to read launcher output: {}", e);
                break;
            }
        }
    }
    // Drain so a chatty child never blocks on a full pipe after the end marker.
    while let Ok(Some(line)) = lines.next_line().await {
        debug!("Ignoring launcher output after end marker: {}", line);
    }
}

async fn echo_stderr<R: AsyncRead + Unpin>(stderr: R, uid: String) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        info!("[{}] {}", uid, line);
    }
}
