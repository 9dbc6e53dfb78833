//! The rebuild operation.
//!
//! A [`Builder`] regenerates the site. The default [`CommandBuilder`] runs an
//! external command (for example the Antora site generator) and waits for it.

use async_trait::async_trait;
use std::process::{ExitStatus, Stdio};
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Errors produced by a rebuild.
#[derive(Debug, Error)]
pub enum BuildError {
    /// The configured command has no program.
    #[error("build command is empty")]
    EmptyCommand,
    /// The build process could not be started.
    #[error("failed to start `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    /// The build process ran and reported failure.
    #[error("`{command}` exited with {status}")]
    Failed { command: String, status: ExitStatus },
    /// The builder panicked.
    #[error("build panicked: {0}")]
    Panicked(String),
    /// Failure from a custom builder.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// An operation that regenerates the site output.
///
/// Implementations need not be reentrant; the build loop never runs two builds
/// at once.
#[async_trait]
pub trait Builder: Send + Sync {
    async fn build(&self) -> Result<(), BuildError>;
}

/// Runs an external command and treats a non-zero exit as a failed build.
///
/// The child inherits the environment and stdio of this process, so the
/// generator's own output shows up in the terminal.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    program: String,
    args: Vec<String>,
}

impl CommandBuilder {
    /// Creates a builder from `[program, args...]`.
    ///
    /// # Errors
    /// Returns [`BuildError::EmptyCommand`] if `command` is empty.
    pub fn new(command: &[String]) -> Result<Self, BuildError> {
        let (program, args) = command.split_first().ok_or(BuildError::EmptyCommand)?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }

    /// The command line as it would be typed in a shell.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[async_trait]
impl Builder for CommandBuilder {
    async fn build(&self) -> Result<(), BuildError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        debug!("Running build command: {}", self.command_line());
        let status = command
            .status()
            .await
            .map_err(|source| BuildError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if status.success() {
            Ok(())
        } else {
            Err(BuildError::Failed {
                command: self.command_line(),
                status,
            })
        }
    }
}
