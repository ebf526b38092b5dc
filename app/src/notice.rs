use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::error::FailureKind;
use crate::mode::Mode;
use crate::queue::JobId;
use crate::storage::SubfolderNote;
use crate::vote::{VoteId, VoteKind};

/// What caused a mode change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Vote,
    Admin,
    StillWatchingTimeout,
    NotWatching,
}

/// User-facing messages the controller asks the chat side to render.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notice {
    VoteStarted {
        vote_id: VoteId,
        vote: VoteKind,
        context: String,
        requester: String,
        duration_secs: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        subject: Option<String>,
    },
    VoteProgress {
        vote_id: VoteId,
        vote: VoteKind,
        context: String,
        remaining_secs: u64,
        yes: u32,
        no: u32,
    },
    VoteResolved {
        vote_id: VoteId,
        vote: VoteKind,
        context: String,
        passed: bool,
        yes: u32,
        no: u32,
        /// Set when an admin action made the outcome moot.
        superseded: bool,
    },
    ModeChanged {
        mode: Mode,
        trigger: Trigger,
        #[serde(skip_serializing_if = "Option::is_none")]
        warning: Option<String>,
    },
    Skipped {
        context: String,
        streak: u32,
        bypassed: bool,
    },
    FilePlaying {
        context: String,
        file: PathBuf,
    },
    StillWatchingPrompt {
        window_secs: u64,
    },
    /// A requested action ran and failed. `category` is the short cause,
    /// details stay in the log.
    ActionFailed {
        #[serde(skip_serializing_if = "Option::is_none")]
        context: Option<String>,
        action: String,
        category: String,
    },
    /// A request that was refused before anything ran.
    Rejected {
        context: String,
        requester: String,
        reason: String,
    },
    DownloadQueued {
        channel: String,
        requester: String,
        job_id: JobId,
        position: usize,
        target: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        note: Option<SubfolderNote>,
    },
    DownloadStarted {
        channel: String,
        job_id: JobId,
        url: String,
    },
    DownloadProgress {
        channel: String,
        job_id: JobId,
        percent: f32,
        #[serde(skip_serializing_if = "Option::is_none")]
        eta: Option<String>,
    },
    DownloadSucceeded {
        channel: String,
        requester: String,
        job_id: JobId,
        #[serde(skip_serializing_if = "Option::is_none")]
        file: Option<PathBuf>,
    },
    DownloadFailed {
        channel: String,
        requester: String,
        job_id: JobId,
        failure: FailureKind,
        message: String,
    },
    DownloadCancelled {
        channel: String,
        requester: String,
        job_id: JobId,
        removed_files: usize,
    },
    DownloadsCleared {
        requester: String,
        removed_queued: usize,
        aborted_active: bool,
    },
    Status {
        context: String,
        mode: Mode,
        skip_streak: u32,
        awaiting_still_watching: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        downloading: Option<String>,
        queued: Vec<String>,
    },
    ShuttingDown,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notice: Notice) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notices_serialize_with_kind_tag() {
        let json = serde_json::to_value(Notice::ModeChanged {
            mode: Mode::Custom,
            trigger: Trigger::Admin,
            warning: None,
        })
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({"kind": "mode_changed", "mode": "custom", "trigger": "admin"})
        );
    }

    #[test]
    fn failure_kind_is_snake_case() {
        let json = serde_json::to_value(Notice::DownloadFailed {
            channel: "dl".into(),
            requester: "u1".into(),
            job_id: 4,
            failure: FailureKind::RemoteUnavailable,
            message: FailureKind::RemoteUnavailable.user_message().into(),
        })
        .unwrap();
        assert_eq!(json["failure"], "remote_unavailable");
        assert_eq!(json["kind"], "download_failed");
    }
}
