//! External command execution with live output streaming

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::debug;

use crate::stream::sink::LogSink;

/// A command to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
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

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Failure to run a command
#[derive(Debug, Error)]
pub enum CommandError {
    /// The executable could not be resolved
    #[error("command not found: {program}")]
    NotFound { program: String },

    /// The process could not be started for another reason
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The process ran and exited unsuccessfully
    #[error("{program} exited with {}", display_code(.code))]
    Exit {
        program: String,
        code: Option<i32>,
        output: String,
    },

    /// Reading output or waiting for the process failed
    #[error("I/O error while running {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

fn display_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "a signal".to_string(),
    }
}

impl CommandError {
    /// True when the process never started
    pub fn is_start_failure(&self) -> bool {
        matches!(self, CommandError::NotFound { .. } | CommandError::Spawn { .. })
    }
}

/// Runs external commands
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `command` to completion, passing each output line to `sink` as it
    /// is read. Returns the accumulated stdout.
    async fn run(&self, command: &CommandSpec, sink: &dyn LogSink) -> Result<String, CommandError>;
}

/// [`CommandRunner`] backed by `tokio::process`
#[derive(Debug, Default, Clone)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, command: &CommandSpec, sink: &dyn LogSink) -> Result<String, CommandError> {
        debug!("Running: {}", command);

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &command.cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CommandError::NotFound {
                    program: command.program.clone(),
                }
            } else {
                CommandError::Spawn {
                    program: command.program.clone(),
                    source: e,
                }
            }
        })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let captured = Mutex::new(Vec::new());
        let (stdout_lines, stderr_result, status) = tokio::join!(
            pump(stdout, sink, &captured),
            pump(stderr, sink, &captured),
            child.wait(),
        );

        let io_error = |source| CommandError::Io {
            program: command.program.clone(),
            source,
        };
        let stdout_lines = stdout_lines.map_err(io_error)?;
        stderr_result.map_err(io_error)?;
        let status = status.map_err(io_error)?;

        if !status.success() {
            let output = captured.into_inner().unwrap_or_else(|e| e.into_inner()).join("\n");
            return Err(CommandError::Exit {
                program: command.program.clone(),
                code: status.code(),
                output,
            });
        }

        Ok(stdout_lines.join("\n"))
    }
}

/// Forward lines from one output stream to the sink as they arrive
async fn pump<R>(
    reader: Option<R>,
    sink: &dyn LogSink,
    captured: &Mutex<Vec<String>>,
) -> Result<Vec<String>, std::io::Error>
where
    R: AsyncRead + Unpin,
{
    let mut collected = Vec::new();
    let Some(reader) = reader else {
        return Ok(collected);
    };

    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        sink.log(line.clone());
        captured.lock().unwrap_or_else(|e| e.into_inner()).push(line.clone());
        collected.push(line);
    }
    Ok(collected)
}
