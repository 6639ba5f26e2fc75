//! External command execution with captured output and a hard timeout.

use std::io::{self, Read};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

const WAIT_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("{program} did not finish within {timeout:?}")]
    Timeout { program: String, timeout: Duration },
    #[error("{program} exited with status {status:?}: {stderr}")]
    Failed {
        program: String,
        status: Option<i32>,
        stderr: String,
    },
    #[error("i/o error while running {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: io::Error,
    },
}

/// Runs external commands. Faked in tests.
pub trait CommandRunner: Send {
    fn run(&mut self, spec: &CommandSpec) -> Result<CommandOutput, CommandError>;
}

/// `std::process` backed runner.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn wait_with_timeout(child: &mut Child, spec: &CommandSpec) -> Result<Option<i32>, CommandError> {
    let started = Instant::now();
    loop {
        let status = child.try_wait().map_err(|source| CommandError::Io {
            program: spec.program.clone(),
            source,
        })?;
        if let Some(status) = status {
            return Ok(status.code());
        }
        if started.elapsed() >= spec.timeout {
            warn!(program = %spec.program, timeout = ?spec.timeout, "killing command after timeout");
            let _ = child.kill();
            let _ = child.wait();
            return Err(CommandError::Timeout {
                program: spec.program.clone(),
                timeout: spec.timeout,
            });
        }
        thread::sleep(WAIT_POLL);
    }
}

impl CommandRunner for SystemRunner {
    fn run(&mut self, spec: &CommandSpec) -> Result<CommandOutput, CommandError> {
        debug!(program = %spec.program, args = ?spec.args, "running command");
        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| CommandError::Spawn {
                program: spec.program.clone(),
                source,
            })?;

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());
        let status = wait_with_timeout(&mut child, spec)?;
        let output = CommandOutput {
            stdout: stdout.join().unwrap_or_default(),
            stderr: stderr.join().unwrap_or_default(),
        };

        if status != Some(0) {
            return Err(CommandError::Failed {
                program: spec.program.clone(),
                status,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output)
    }
}
