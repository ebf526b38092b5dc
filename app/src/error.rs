use std::path::PathBuf;

use thiserror::Error;

use crate::mode::Mode;
use crate::script::ScriptKind;
use crate::vote::VoteKind;

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("no path configured for the {0} script")]
    Unset(ScriptKind),

    #[error("script does not exist: {0}")]
    Missing(PathBuf),

    #[error("failed to start script {path}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("script {path} exited with code {code:?}: {stderr}")]
    Failed {
        path: PathBuf,
        code: Option<i32>,
        stderr: String,
    },

    #[error("script {path} reported an error: {line}")]
    Reported { path: PathBuf, line: String },
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("external tool is missing: {tool}")]
    ToolMissing { tool: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("fetch tool failed (code={code:?}): {stderr}")]
    Tool { code: Option<i32>, stderr: String },

    #[error("fetch tool returned no output path")]
    NoPrediction,

    #[error("download cancelled")]
    Cancelled,
}

/// Coarse cause of a failed download, used for the user-facing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    UnsupportedSource,
    RemoteUnavailable,
    Network,
    LocalFilesystem,
    Unknown,
}

impl FailureKind {
    pub fn classify(error: &FetchError) -> Self {
        match error {
            FetchError::ToolMissing { .. } | FetchError::Io(_) => FailureKind::LocalFilesystem,
            FetchError::Tool { stderr, .. } => Self::classify_output(stderr),
            FetchError::NoPrediction | FetchError::Cancelled => FailureKind::Unknown,
        }
    }

    /// Maps the fetch tool's diagnostic output onto a failure category.
    pub fn classify_output(stderr: &str) -> Self {
        let lower = stderr.to_lowercase();

        if lower.contains("unsupported url")
            || lower.contains("is not a valid url")
            || lower.contains("no video formats")
            || lower.contains("no suitable infojson")
        {
            return FailureKind::UnsupportedSource;
        }
        if lower.contains("video unavailable")
            || lower.contains("private video")
            || lower.contains("http error 403")
            || lower.contains("http error 404")
            || lower.contains("has been removed")
            || lower.contains("copyright")
            || lower.contains("sign in to confirm")
            || (lower.contains("geo") && lower.contains("block"))
        {
            return FailureKind::RemoteUnavailable;
        }
        if lower.contains("timed out")
            || lower.contains("timeout")
            || lower.contains("connection reset")
            || lower.contains("connection refused")
            || lower.contains("name resolution")
            || lower.contains("http error 429")
            || (lower.contains("unable to download") && lower.contains("webpage"))
        {
            return FailureKind::Network;
        }
        if lower.contains("permission denied")
            || lower.contains("no space left")
            || lower.contains("read-only file system")
            || (lower.contains("ffmpeg") && lower.contains("not found"))
            || lower.contains("no such file or directory")
        {
            return FailureKind::LocalFilesystem;
        }
        FailureKind::Unknown
    }

    pub fn label(self) -> &'static str {
        match self {
            FailureKind::UnsupportedSource => "unsupported source",
            FailureKind::RemoteUnavailable => "remote unavailable",
            FailureKind::Network => "network",
            FailureKind::LocalFilesystem => "local filesystem",
            FailureKind::Unknown => "unknown",
        }
    }

    pub fn user_message(self) -> &'static str {
        match self {
            FailureKind::UnsupportedSource => {
                "That link isn't supported or doesn't point to a video."
            }
            FailureKind::RemoteUnavailable => {
                "The video is unavailable (private, removed or region-restricted)."
            }
            FailureKind::Network => "The download timed out or lost its connection. Try again later.",
            FailureKind::LocalFilesystem => {
                "The download couldn't be written locally (permissions, disk space or a missing tool)."
            }
            FailureKind::Unknown => "The download failed for an unknown reason. Check the logs.",
        }
    }
}

#[derive(Debug, Error)]
pub enum EventError {
    #[error("managed event no longer exists")]
    Gone,

    #[error("event platform did not answer within {0:?}")]
    Timeout(std::time::Duration),

    #[error("event platform error: {0}")]
    Platform(String),

    #[error("bridge connection closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum TransitionError {
    #[error("already in {0} mode")]
    AlreadyInMode(Mode),

    #[error("only available in custom mode")]
    NotInCustom,

    #[error(transparent)]
    Script(#[from] ScriptError),
}

impl TransitionError {
    /// Short cause category for user-visible messages.
    pub fn category(&self) -> &'static str {
        match self {
            TransitionError::AlreadyInMode(_) | TransitionError::NotInCustom => "not applicable",
            TransitionError::Script(ScriptError::Unset(_))
            | TransitionError::Script(ScriptError::Missing(_)) => "configuration",
            TransitionError::Script(_) => "script failure",
        }
    }
}

#[derive(Debug, Error)]
pub enum VoteError {
    #[error("a {kind} vote is already running in {context}")]
    AlreadyActive { kind: VoteKind, context: String },
}
