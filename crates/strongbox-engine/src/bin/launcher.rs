//! Child process of an isolated operation.
//!
//! Reads `key:=value` arguments, runs the copy, and reports progress as JSON
//! lines on stdout. Logs go to stderr.

use anyhow::{Context, Result};
use std::io::Write;
use std::process::ExitCode;
use strongbox_engine::worker::{execute, OperationSpec};
use strongbox_lib::protocol::{LaunchArgs, ProgressRecord};
use strongbox_lib::types::OperationState;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    match run() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<bool> {
    let args = LaunchArgs::parse(std::env::args().skip(1)).context("Invalid launcher arguments")?;
    let spec = OperationSpec::from_launch_args(args);
    info!("Running {:?} {} ({})", spec.kind, spec.uid, spec.name);

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let mut write_error = None;
    let mut failed = false;

    execute(&spec, &mut |record| {
        if record == ProgressRecord::Status(OperationState::Error) {
            failed = true;
        }
        if write_error.is_some() {
            return;
        }
        let written = record
            .encode()
            .map_err(anyhow::Error::from)
            .and_then(|line| {
                out.write_all(line.as_bytes())?;
                out.flush()?;
                Ok(())
            });
        if let Err(e) = written {
            write_error = Some(e);
        }
    });

    if let Some(e) = write_error {
        return Err(e).context("Failed to report progress");
    }
    out.write_all(ProgressRecord::End.encode()?.as_bytes())?;
    out.flush()?;
    Ok(!failed)
}
