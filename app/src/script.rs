use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::ScriptError;

/// The automation routines the controller knows how to invoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptKind {
    EnterCustom,
    ExitCustom,
    Skip,
    PlayFile,
}

impl fmt::Display for ScriptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ScriptKind::EnterCustom => "enter-custom",
            ScriptKind::ExitCustom => "exit-custom",
            ScriptKind::Skip => "skip",
            ScriptKind::PlayFile => "play-file",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScriptPaths {
    pub enter_custom: Option<PathBuf>,
    pub exit_custom: Option<PathBuf>,
    pub skip: Option<PathBuf>,
    pub play_file: Option<PathBuf>,
}

impl ScriptPaths {
    pub fn path_for(&self, kind: ScriptKind) -> Result<&Path, ScriptError> {
        let path = match kind {
            ScriptKind::EnterCustom => self.enter_custom.as_deref(),
            ScriptKind::ExitCustom => self.exit_custom.as_deref(),
            ScriptKind::Skip => self.skip.as_deref(),
            ScriptKind::PlayFile => self.play_file.as_deref(),
        };
        path.ok_or(ScriptError::Unset(kind))
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScriptOutput {
    pub stdout: String,
    pub stderr: String,
}

impl ScriptOutput {
    /// Some routines exit cleanly but print their failure on stderr.
    pub fn reported_failure(&self) -> Option<&str> {
        self.stderr.lines().map(str::trim).find(|line| {
            let lower = line.to_ascii_lowercase();
            lower.starts_with("error:") || line.starts_with("ERROR")
        })
    }
}

#[async_trait]
pub trait ScriptExecutor: Send + Sync {
    async fn run(&self, script: &Path, args: &[String]) -> Result<ScriptOutput, ScriptError>;
}

/// Runs scripts as child processes and captures their output.
#[derive(Debug, Clone, Default)]
pub struct ProcessScriptExecutor;

#[async_trait]
impl ScriptExecutor for ProcessScriptExecutor {
    async fn run(&self, script: &Path, args: &[String]) -> Result<ScriptOutput, ScriptError> {
        if !script.is_file() {
            return Err(ScriptError::Missing(script.to_path_buf()));
        }

        debug!(script = %script.display(), ?args, "running script");
        let output = Command::new(script)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| ScriptError::Spawn {
                path: script.to_path_buf(),
                source,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() {
            warn!(
                script = %script.display(),
                code = ?output.status.code(),
                stderr = %stderr.trim(),
                "script failed"
            );
            return Err(ScriptError::Failed {
                path: script.to_path_buf(),
                code: output.status.code(),
                stderr: stderr.trim().to_string(),
            });
        }

        Ok(ScriptOutput { stdout, stderr })
    }
}
