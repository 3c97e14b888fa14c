//! Handing the process over to the target command once the gate opens

use std::convert::Infallible;
use std::process::Command;

use tracing::info;

use crate::gate::GateError;

fn build_command(argv: &[String]) -> Result<Command, GateError> {
    let (program, args) = argv.split_first().ok_or(GateError::EmptyCommand)?;
    let mut command = Command::new(program);
    command.args(args);
    Ok(command)
}

/// Replace the current process with `argv`
///
/// Only returns on failure. On platforms without `exec` the command runs as a
/// child and this process exits with its status.
pub fn exec_command(argv: &[String]) -> Result<Infallible, GateError> {
    let mut command = build_command(argv)?;
    info!(program = %argv[0], "Handing off");

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        let source = command.exec();
        Err(GateError::Handoff {
            program: argv[0].clone(),
            source,
        })
    }

    #[cfg(not(unix))]
    {
        let status = command.status().map_err(|source| GateError::Handoff {
            program: argv[0].clone(),
            source,
        })?;
        std::process::exit(status.code().unwrap_or(1))
    }
}

/// Run `argv` as a child and return its exit code
pub fn run_command(argv: &[String]) -> Result<i32, GateError> {
    let mut command = build_command(argv)?;
    let status = command.status().map_err(|source| GateError::Handoff {
        program: argv[0].clone(),
        source,
    })?;
    // Killed by a signal: mirror the shell's 128+N convention where we can
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return Ok(128 + signal);
        }
    }
    Ok(status.code().unwrap_or(1))
}
