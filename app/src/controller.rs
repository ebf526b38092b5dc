//! Controller task: the single writer of mode and vote bookkeeping.
//!
//! Intents from the chat side, vote outcomes, mode timers and download
//! events all land in one `select!` loop and are handled one at a time.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Timings;
use crate::error::TransitionError;
use crate::mode::Mode;
use crate::notice::{Notice, Notifier, Trigger};
use crate::orchestrator::{Orchestrator, TimerAction, TimerEvent, Transition};
use crate::queue::{describe_target, DownloadEvent, DownloadQueue, DownloadRequest, JobId, JobOutcome};
use crate::storage::resolve_media_file;
use crate::vote::{Choice, VoteEngine, VoteHandle, VoteId, VoteKind, VoteOutcome, VoteReceivers, VoteTick};

/// A user action relayed by the chat bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Intent {
    RequestModeVote {
        requester: String,
        context: String,
        target: Mode,
    },
    RequestSkip {
        requester: String,
        context: String,
        /// Non-bot members present in the venue.
        participants: u32,
    },
    RequestPlayFile {
        requester: String,
        context: String,
        path: String,
    },
    Ballot {
        vote_id: VoteId,
        voter: String,
        choice: Choice,
    },
    StillWatching {
        responder: String,
        watching: bool,
    },
    Download {
        requester: String,
        channel: String,
        url: String,
        #[serde(default)]
        subfolder: Option<String>,
    },
    CancelDownloads {
        requester: String,
    },
    CancelAllDownloads {
        requester: String,
    },
    CancelJob {
        requester: String,
        job_id: JobId,
    },
    AdminForce {
        requester: String,
    },
    ScheduleUpdate {
        #[serde(default)]
        title: Option<String>,
    },
    Status {
        requester: String,
        context: String,
    },
}

struct LiveVote {
    handle: VoteHandle,
    context: String,
    requester: String,
    file: Option<PathBuf>,
    superseded: bool,
}

pub struct ControllerParts {
    pub orchestrator: Orchestrator,
    pub timers: mpsc::UnboundedReceiver<TimerEvent>,
    pub queue: DownloadQueue,
    pub downloads: mpsc::UnboundedReceiver<DownloadEvent>,
    pub download_root: PathBuf,
    pub notifier: Arc<dyn Notifier>,
    pub media_dir: Option<PathBuf>,
    pub timings: Timings,
}

pub struct Controller {
    orchestrator: Orchestrator,
    timers: mpsc::UnboundedReceiver<TimerEvent>,
    votes: VoteEngine,
    vote_rx: VoteReceivers,
    live_votes: HashMap<VoteId, LiveVote>,
    queue: DownloadQueue,
    downloads: mpsc::UnboundedReceiver<DownloadEvent>,
    download_root: PathBuf,
    notifier: Arc<dyn Notifier>,
    media_dir: Option<PathBuf>,
    timings: Timings,
}

const PARTICIPANT_BYPASS: u32 = 2;

impl Controller {
    pub fn new(parts: ControllerParts) -> Self {
        let (votes, vote_rx) = VoteEngine::new(parts.timings.vote_refresh);
        Self {
            orchestrator: parts.orchestrator,
            timers: parts.timers,
            votes,
            vote_rx,
            live_votes: HashMap::new(),
            queue: parts.queue,
            downloads: parts.downloads,
            download_root: parts.download_root,
            notifier: parts.notifier,
            media_dir: parts.media_dir,
            timings: parts.timings,
        }
    }

    /// Runs until `shutdown` fires or the intent stream ends, then tears
    /// everything down.
    pub async fn run(mut self, mut intents: mpsc::UnboundedReceiver<Intent>, shutdown: CancellationToken) {
        self.orchestrator.publish_current().await;
        info!("controller running");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("shutdown requested");
                    break;
                }
                intent = intents.recv() => match intent {
                    Some(intent) => self.handle_intent(intent).await,
                    None => {
                        info!("intent stream closed");
                        break;
                    }
                },
                Some(outcome) = self.vote_rx.outcomes.recv() => self.handle_vote_outcome(outcome).await,
                Some(event) = self.timers.recv() => {
                    let action = self.orchestrator.handle_timer(event).await;
                    self.report_timer_action(action).await;
                }
                Some(event) = self.downloads.recv() => self.handle_download_event(event).await,
                Some(tick) = self.vote_rx.ticks.recv() => self.handle_vote_tick(tick).await,
            }
        }

        self.shutdown().await;
    }

    async fn notify(&self, notice: Notice) {
        if let Err(err) = self.notifier.notify(notice).await {
            warn!("failed to deliver notice: {err:#}");
        }
    }

    async fn reject(&self, context: &str, requester: &str, reason: impl Into<String>) {
        let reason = reason.into();
        debug!(context, requester, reason = %reason, "request rejected");
        self.notify(Notice::Rejected {
            context: context.to_string(),
            requester: requester.to_string(),
            reason,
        })
        .await;
    }

    async fn report_failure(&self, context: Option<&str>, action: &str, err: &TransitionError) {
        warn!(action, "action failed: {err}");
        self.notify(Notice::ActionFailed {
            context: context.map(str::to_string),
            action: action.to_string(),
            category: err.category().to_string(),
        })
        .await;
    }

    async fn report_transition(&self, transition: Transition) {
        self.notify(Notice::ModeChanged {
            mode: transition.to,
            trigger: transition.trigger,
            warning: transition.warning,
        })
        .await;
    }

    pub async fn handle_intent(&mut self, intent: Intent) {
        debug!(?intent, "intent");
        match intent {
            Intent::RequestModeVote {
                requester,
                context,
                target,
            } => self.request_mode_vote(requester, context, target).await,
            Intent::RequestSkip {
                requester,
                context,
                participants,
            } => self.request_skip(requester, context, participants).await,
            Intent::RequestPlayFile {
                requester,
                context,
                path,
            } => self.request_play_file(requester, context, path).await,
            Intent::Ballot {
                vote_id,
                voter,
                choice,
            } => self.cast_ballot(vote_id, voter, choice).await,
            Intent::StillWatching { responder, watching } => {
                info!(responder, watching, "still-watching answer");
                let action = self.orchestrator.still_watching_response(watching).await;
                self.report_timer_action(action).await;
            }
            Intent::Download {
                requester,
                channel,
                url,
                subfolder,
            } => self.download(requester, channel, url, subfolder).await,
            Intent::CancelDownloads { requester } => match self.queue.cancel_requester(&requester).await {
                Ok(summary) => {
                    self.notify(Notice::DownloadsCleared {
                        requester,
                        removed_queued: summary.removed_queued.len(),
                        aborted_active: summary.aborted_active.is_some(),
                    })
                    .await
                }
                Err(err) => warn!("cancel downloads failed: {err:#}"),
            },
            Intent::CancelAllDownloads { requester } => match self.queue.cancel_all().await {
                Ok(summary) => {
                    info!(requester, ?summary, "all downloads cancelled");
                    self.notify(Notice::DownloadsCleared {
                        requester,
                        removed_queued: summary.removed_queued.len(),
                        aborted_active: summary.aborted_active.is_some(),
                    })
                    .await
                }
                Err(err) => warn!("cancel all downloads failed: {err:#}"),
            },
            Intent::CancelJob { requester, job_id } => match self.queue.cancel(job_id).await {
                Ok(true) => info!(requester, job = job_id, "job cancel requested"),
                Ok(false) => {
                    self.reject("downloads", &requester, format!("No download with id {job_id}."))
                        .await
                }
                Err(err) => warn!("cancel job failed: {err:#}"),
            },
            Intent::AdminForce { requester } => self.admin_force(requester).await,
            Intent::ScheduleUpdate { title } => self.orchestrator.set_now_airing(title).await,
            Intent::Status { requester, context } => self.status(requester, context).await,
        }
    }

    fn mode_vote_running(&self) -> bool {
        self.live_votes.values().any(|vote| {
            !vote.superseded
                && matches!(vote.handle.kind(), VoteKind::ModeToCustom | VoteKind::ModeToScheduled)
        })
    }

    fn start_vote(
        &mut self,
        kind: VoteKind,
        context: &str,
        requester: &str,
        duration: std::time::Duration,
        file: Option<PathBuf>,
    ) -> Result<Notice, String> {
        let handle = self
            .votes
            .start(kind, context, duration)
            .map_err(|err| err.to_string())?;
        let notice = Notice::VoteStarted {
            vote_id: handle.id(),
            vote: kind,
            context: context.to_string(),
            requester: requester.to_string(),
            duration_secs: duration.as_secs(),
            subject: file
                .as_ref()
                .and_then(|f| f.file_name())
                .map(|name| name.to_string_lossy().into_owned()),
        };
        self.live_votes.insert(
            handle.id(),
            LiveVote {
                handle,
                context: context.to_string(),
                requester: requester.to_string(),
                file,
                superseded: false,
            },
        );
        Ok(notice)
    }

    async fn request_mode_vote(&mut self, requester: String, context: String, target: Mode) {
        if self.orchestrator.mode() == target {
            return self
                .reject(&context, &requester, format!("Already in {target} mode."))
                .await;
        }
        if self.mode_vote_running() {
            return self
                .reject(&context, &requester, "A mode vote is already running.")
                .await;
        }
        let kind = match target {
            Mode::Custom => VoteKind::ModeToCustom,
            Mode::Scheduled => VoteKind::ModeToScheduled,
        };
        let duration = self.timings.mode_vote;
        match self.start_vote(kind, &context, &requester, duration, None) {
            Ok(notice) => self.notify(notice).await,
            Err(reason) => self.reject(&context, &requester, reason).await,
        }
    }

    async fn request_skip(&mut self, requester: String, context: String, participants: u32) {
        if self.orchestrator.mode() != Mode::Custom {
            return self
                .reject(&context, &requester, "Skipping is only available in custom mode.")
                .await;
        }

        if participants == PARTICIPANT_BYPASS {
            info!(requester, context, "skip approved without a vote");
            return self.run_skip(&context, true).await;
        }

        let duration = self.orchestrator.skip_vote_duration();
        match self.start_vote(VoteKind::SkipItem, &context, &requester, duration, None) {
            Ok(notice) => self.notify(notice).await,
            Err(reason) => self.reject(&context, &requester, reason).await,
        }
    }

    async fn run_skip(&mut self, context: &str, bypassed: bool) {
        match self.orchestrator.skip().await {
            Ok(streak) => {
                self.notify(Notice::Skipped {
                    context: context.to_string(),
                    streak,
                    bypassed,
                })
                .await
            }
            Err(err) => self.report_failure(Some(context), "skip", &err).await,
        }
    }

    async fn request_play_file(&mut self, requester: String, context: String, path: String) {
        if self.orchestrator.mode() != Mode::Custom {
            return self
                .reject(&context, &requester, "Playing files is only available in custom mode.")
                .await;
        }
        let Some(media_dir) = self.media_dir.as_deref() else {
            return self
                .reject(&context, &requester, "No media folder is configured.")
                .await;
        };
        let file = match resolve_media_file(media_dir, &path) {
            Ok(file) => file,
            Err(err) => return self.reject(&context, &requester, format!("{err:#}")).await,
        };

        let duration = self.timings.file_vote;
        match self.start_vote(VoteKind::ConfirmFilePlay, &context, &requester, duration, Some(file)) {
            Ok(notice) => self.notify(notice).await,
            Err(reason) => self.reject(&context, &requester, reason).await,
        }
    }

    async fn cast_ballot(&mut self, vote_id: VoteId, voter: String, choice: Choice) {
        let Some(vote) = self.live_votes.get(&vote_id) else {
            debug!(vote = vote_id, voter, "ballot for a vote that is not running");
            return;
        };
        if !vote.handle.cast(voter, choice) {
            debug!(vote = vote_id, "ballot arrived after resolution");
        }
    }

    async fn admin_force(&mut self, requester: String) {
        info!(requester, mode = %self.orchestrator.mode(), "admin forced mode toggle");
        for vote in self.live_votes.values_mut() {
            if matches!(vote.handle.kind(), VoteKind::ModeToCustom | VoteKind::ModeToScheduled) {
                vote.superseded = true;
                vote.handle.end_early();
            }
        }

        match self.orchestrator.force_toggle().await {
            Ok(transition) => self.report_transition(transition).await,
            Err(err) => self.report_failure(None, "force mode", &err).await,
        }
    }

    async fn status(&self, requester: String, context: String) {
        debug!(requester, "status requested");
        let snapshot = match self.queue.snapshot().await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!("queue snapshot failed: {err:#}");
                Default::default()
            }
        };
        self.notify(Notice::Status {
            context,
            mode: self.orchestrator.mode(),
            skip_streak: self.orchestrator.skip_streak(),
            awaiting_still_watching: self.orchestrator.awaiting_still_watching(),
            downloading: snapshot.active.map(|job| job.url),
            queued: snapshot.queued.into_iter().map(|job| job.url).collect(),
        })
        .await;
    }

    async fn handle_vote_tick(&self, tick: VoteTick) {
        let Some(vote) = self.live_votes.get(&tick.id) else {
            return;
        };
        if vote.superseded {
            return;
        }
        self.notify(Notice::VoteProgress {
            vote_id: tick.id,
            vote: tick.kind,
            context: vote.context.clone(),
            remaining_secs: tick.remaining.as_secs(),
            yes: tick.yes,
            no: tick.no,
        })
        .await;
    }

    async fn handle_vote_outcome(&mut self, outcome: VoteOutcome) {
        let Some(vote) = self.live_votes.remove(&outcome.id) else {
            warn!(vote = outcome.id, "outcome for an unknown vote");
            return;
        };
        info!(
            vote = outcome.id,
            kind = %outcome.kind,
            requester = %vote.requester,
            passed = outcome.passed,
            "vote finished"
        );
        self.notify(Notice::VoteResolved {
            vote_id: outcome.id,
            vote: outcome.kind,
            context: vote.context.clone(),
            passed: outcome.passed,
            yes: outcome.yes,
            no: outcome.no,
            superseded: vote.superseded,
        })
        .await;

        if vote.superseded {
            return;
        }
        if !outcome.passed {
            if outcome.kind == VoteKind::SkipItem {
                self.orchestrator.reset_skip_streak();
            }
            return;
        }

        let context = vote.context.as_str();
        match outcome.kind {
            VoteKind::ModeToCustom => match self.orchestrator.enter_custom(Trigger::Vote).await {
                Ok(transition) => self.report_transition(transition).await,
                Err(err) => self.report_failure(Some(context), "switch to custom", &err).await,
            },
            VoteKind::ModeToScheduled => match self.orchestrator.exit_custom(Trigger::Vote).await {
                Ok(transition) => self.report_transition(transition).await,
                Err(err) => self.report_failure(Some(context), "switch to scheduled", &err).await,
            },
            VoteKind::SkipItem => self.run_skip(context, false).await,
            VoteKind::ConfirmFilePlay => {
                let Some(file) = vote.file else {
                    warn!(vote = outcome.id, "file vote without a file");
                    return;
                };
                match self.orchestrator.play_file(&file).await {
                    Ok(()) => {
                        self.notify(Notice::FilePlaying {
                            context: context.to_string(),
                            file,
                        })
                        .await
                    }
                    Err(err) => self.report_failure(Some(context), "play file", &err).await,
                }
            }
        }
    }

    async fn report_timer_action(&self, action: TimerAction) {
        match action {
            TimerAction::Nothing | TimerAction::StillWatchingConfirmed => {}
            TimerAction::PromptStillWatching { window } => {
                self.notify(Notice::StillWatchingPrompt {
                    window_secs: window.as_secs(),
                })
                .await
            }
            TimerAction::Exited(transition) => self.report_transition(transition).await,
            TimerAction::ExitFailed(err) => self.report_failure(None, "switch to scheduled", &err).await,
            TimerAction::TitlePublished(name) => debug!(name, "now playing updated"),
        }
    }

    async fn download(&mut self, requester: String, channel: String, url: String, subfolder: Option<String>) {
        let url = url.trim().to_string();
        if url.is_empty() {
            return self.reject(&channel, &requester, "No link was given.").await;
        }
        let request = DownloadRequest {
            url,
            requester: requester.clone(),
            origin_channel: channel.clone(),
            subfolder,
        };
        match self.queue.enqueue(request).await {
            Ok(receipt) => {
                self.notify(Notice::DownloadQueued {
                    channel,
                    requester,
                    job_id: receipt.job_id,
                    position: receipt.position,
                    target: describe_target(&self.download_root, &receipt.target_dir),
                    note: receipt.note,
                })
                .await
            }
            Err(err) => self.reject(&channel, &requester, format!("{err:#}")).await,
        }
    }

    async fn handle_download_event(&self, event: DownloadEvent) {
        let notice = match event {
            DownloadEvent::Started { job } => Notice::DownloadStarted {
                channel: job.origin_channel,
                job_id: job.id,
                url: job.url,
            },
            DownloadEvent::Progress {
                job_id,
                origin_channel,
                percent,
                eta,
            } => Notice::DownloadProgress {
                channel: origin_channel,
                job_id,
                percent,
                eta,
            },
            DownloadEvent::Finished { job, outcome } => match outcome {
                JobOutcome::Succeeded { path } => Notice::DownloadSucceeded {
                    channel: job.origin_channel,
                    requester: job.requester,
                    job_id: job.id,
                    file: path,
                },
                JobOutcome::Failed { kind, detail } => {
                    warn!(job = job.id, url = %job.url, kind = kind.label(), detail = %detail, "download failed");
                    Notice::DownloadFailed {
                        channel: job.origin_channel,
                        requester: job.requester,
                        job_id: job.id,
                        failure: kind,
                        message: kind.user_message().to_string(),
                    }
                }
                JobOutcome::Cancelled { removed } => Notice::DownloadCancelled {
                    channel: job.origin_channel,
                    requester: job.requester,
                    job_id: job.id,
                    removed_files: removed.len(),
                },
            },
        };
        self.notify(notice).await;
    }

    async fn shutdown(&mut self) {
        info!("controller shutting down");
        self.orchestrator.shutdown();
        for vote in self.live_votes.values_mut() {
            vote.superseded = true;
            vote.handle.end_early();
        }
        if let Err(err) = self.queue.shutdown().await {
            warn!("download queue shutdown failed: {err:#}");
        }
        while let Ok(event) = self.downloads.try_recv() {
            self.handle_download_event(event).await;
        }
        self.notify(Notice::ShuttingDown).await;
    }
}
