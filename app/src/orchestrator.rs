//! Scheduled/Custom mode state machine.
//!
//! The orchestrator is owned by the controller task and is the only place
//! that changes the mode, the skip streak or the managed event name. The
//! Custom-mode timers run as small tasks that report back through a channel;
//! every report carries the sequence number of the timer that produced it, so
//! a report from a timer that was torn down or restarted is dropped.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::{Labels, Timings};
use crate::error::{ScriptError, TransitionError};
use crate::event::{EventNamePublisher, PublishOutcome};
use crate::mode::{Mode, ModeState};
use crate::notice::Trigger;
use crate::player::{clean_title, TitleQuery};
use crate::script::{ScriptExecutor, ScriptKind, ScriptPaths};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    StillWatchingDue,
    ResponseWindowElapsed,
    PollTitle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerEvent {
    pub kind: TimerKind,
    seq: u64,
}

/// A completed mode change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: Mode,
    pub to: Mode,
    pub trigger: Trigger,
    /// Script failure that a forced transition went through anyway.
    pub warning: Option<String>,
}

/// What the controller should tell users after a timer fired or a
/// still-watching answer came in.
#[derive(Debug)]
pub enum TimerAction {
    Nothing,
    PromptStillWatching { window: Duration },
    StillWatchingConfirmed,
    Exited(Transition),
    /// The timeout exit failed; Custom mode continues with a fresh timer.
    ExitFailed(TransitionError),
    TitlePublished(String),
}

struct TimerSlot {
    seq: u64,
    task: JoinHandle<()>,
}

impl TimerSlot {
    fn cancel(self) {
        self.task.abort();
    }
}

#[derive(Default)]
struct CustomTimers {
    still_watching: Option<TimerSlot>,
    response_window: Option<TimerSlot>,
    title_poll: Option<TimerSlot>,
}

impl CustomTimers {
    fn clear(&mut self) {
        for slot in [
            self.still_watching.take(),
            self.response_window.take(),
            self.title_poll.take(),
        ]
        .into_iter()
        .flatten()
        {
            slot.cancel();
        }
    }

    fn is_empty(&self) -> bool {
        self.still_watching.is_none() && self.response_window.is_none() && self.title_poll.is_none()
    }
}

pub struct Orchestrator {
    mode: ModeState,
    scripts: Arc<dyn ScriptExecutor>,
    paths: ScriptPaths,
    publisher: EventNamePublisher,
    title_query: Option<Arc<dyn TitleQuery>>,
    timings: Timings,
    labels: Labels,
    timer_tx: mpsc::UnboundedSender<TimerEvent>,
    timers: CustomTimers,
    next_seq: u64,
    skip_streak: u32,
    now_airing: Option<String>,
}

impl Orchestrator {
    pub fn new(
        scripts: Arc<dyn ScriptExecutor>,
        paths: ScriptPaths,
        publisher: EventNamePublisher,
        title_query: Option<Arc<dyn TitleQuery>>,
        timings: Timings,
        labels: Labels,
    ) -> (Self, mpsc::UnboundedReceiver<TimerEvent>) {
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let orchestrator = Self {
            mode: ModeState::default(),
            scripts,
            paths,
            publisher,
            title_query,
            timings,
            labels,
            timer_tx,
            timers: CustomTimers::default(),
            next_seq: 1,
            skip_streak: 0,
            now_airing: None,
        };
        (orchestrator, timer_rx)
    }

    pub fn mode(&self) -> Mode {
        self.mode.current()
    }

    pub fn skip_streak(&self) -> u32 {
        self.skip_streak
    }

    pub fn awaiting_still_watching(&self) -> bool {
        self.timers.response_window.is_some()
    }

    pub fn has_timers(&self) -> bool {
        !self.timers.is_empty()
    }

    pub fn skip_vote_duration(&self) -> Duration {
        self.timings.skip_vote_duration(self.skip_streak)
    }

    pub fn reset_skip_streak(&mut self) {
        if self.skip_streak > 0 {
            debug!(streak = self.skip_streak, "skip streak reset");
        }
        self.skip_streak = 0;
    }

    /// Runs one routine and treats an `ERROR` line on stderr as a failure.
    async fn run_script(&self, kind: ScriptKind, args: &[String]) -> Result<(), ScriptError> {
        let path = self.paths.path_for(kind)?;
        let output = self.scripts.run(path, args).await?;
        if let Some(line) = output.reported_failure() {
            warn!(script = %kind, line, "script reported failure");
            return Err(ScriptError::Reported {
                path: path.to_path_buf(),
                line: line.to_string(),
            });
        }
        debug!(script = %kind, "script finished");
        Ok(())
    }

    pub async fn enter_custom(&mut self, trigger: Trigger) -> Result<Transition, TransitionError> {
        if self.mode.is_custom() {
            return Err(TransitionError::AlreadyInMode(Mode::Custom));
        }

        let warning = match self.run_script(ScriptKind::EnterCustom, &[]).await {
            Ok(()) => None,
            Err(err) if trigger == Trigger::Admin => {
                warn!("forced switch to custom mode despite script failure: {err}");
                Some(err.to_string())
            }
            Err(err) => {
                warn!(?trigger, "switch to custom mode failed: {err}");
                return Err(err.into());
            }
        };

        self.mode.set(Mode::Custom);
        self.skip_streak = 0;
        info!(?trigger, "entered custom mode");

        self.timers.clear();
        self.start_still_watching_timer();
        self.start_title_poll();
        let label = self.labels.custom_label.clone();
        self.publish(&label).await;

        Ok(Transition {
            from: Mode::Scheduled,
            to: Mode::Custom,
            trigger,
            warning,
        })
    }

    pub async fn exit_custom(&mut self, trigger: Trigger) -> Result<Transition, TransitionError> {
        if !self.mode.is_custom() {
            return Err(TransitionError::AlreadyInMode(Mode::Scheduled));
        }

        let warning = match self.run_script(ScriptKind::ExitCustom, &[]).await {
            Ok(()) => None,
            Err(err) if trigger == Trigger::Admin => {
                warn!("forced switch to scheduled mode despite script failure: {err}");
                Some(err.to_string())
            }
            Err(err) => {
                warn!(?trigger, "switch to scheduled mode failed: {err}");
                return Err(err.into());
            }
        };

        self.mode.set(Mode::Scheduled);
        self.skip_streak = 0;
        self.timers.clear();
        info!(?trigger, "returned to scheduled mode");

        let name = self.scheduled_name();
        self.publish(&name).await;

        Ok(Transition {
            from: Mode::Custom,
            to: Mode::Scheduled,
            trigger,
            warning,
        })
    }

    /// Admin toggle. Changes the mode whatever the script does.
    pub async fn force_toggle(&mut self) -> Result<Transition, TransitionError> {
        match self.mode.current() {
            Mode::Scheduled => self.enter_custom(Trigger::Admin).await,
            Mode::Custom => self.exit_custom(Trigger::Admin).await,
        }
    }

    /// Runs the skip routine. Returns the new streak.
    pub async fn skip(&mut self) -> Result<u32, TransitionError> {
        if !self.mode.is_custom() {
            return Err(TransitionError::NotInCustom);
        }
        match self.run_script(ScriptKind::Skip, &[]).await {
            Ok(()) => {
                self.skip_streak += 1;
                info!(streak = self.skip_streak, "skipped current item");
                Ok(self.skip_streak)
            }
            Err(err) => {
                warn!("skip failed: {err}");
                self.skip_streak = 0;
                Err(err.into())
            }
        }
    }

    pub async fn play_file(&mut self, file: &Path) -> Result<(), TransitionError> {
        if !self.mode.is_custom() {
            return Err(TransitionError::NotInCustom);
        }
        let args = [file.to_string_lossy().into_owned()];
        self.run_script(ScriptKind::PlayFile, &args).await?;
        info!(file = %file.display(), "playing requested file");
        Ok(())
    }

    /// Records what the schedule says is airing; renames the event right
    /// away in Scheduled mode.
    pub async fn set_now_airing(&mut self, title: Option<String>) {
        self.now_airing = title
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());
        if !self.mode.is_custom() {
            let name = self.scheduled_name();
            self.publish(&name).await;
        }
    }

    /// Brings the event name in line with the current mode.
    pub async fn publish_current(&mut self) {
        let name = match self.mode.current() {
            Mode::Scheduled => self.scheduled_name(),
            Mode::Custom => self
                .publisher
                .cached_name()
                .map(str::to_string)
                .unwrap_or_else(|| self.labels.custom_label.clone()),
        };
        self.publish(&name).await;
    }

    fn scheduled_name(&self) -> String {
        self.now_airing
            .clone()
            .unwrap_or_else(|| self.labels.placeholder_title.clone())
    }

    async fn publish(&mut self, name: &str) -> bool {
        match self.publisher.publish(name).await {
            Ok(PublishOutcome::Unchanged) => true,
            Ok(outcome) => {
                debug!(name, ?outcome, "event name published");
                true
            }
            Err(err) => {
                warn!(name, "could not update event name: {err}");
                false
            }
        }
    }

    pub async fn handle_timer(&mut self, event: TimerEvent) -> TimerAction {
        match event.kind {
            TimerKind::StillWatchingDue => {
                if !take_if_current(&mut self.timers.still_watching, event.seq) {
                    return TimerAction::Nothing;
                }
                let window = self.timings.still_watching_window;
                info!(?window, "asking whether anyone is still watching");
                let seq = self.next_seq();
                let task = spawn_once(self.timer_tx.clone(), window, TimerKind::ResponseWindowElapsed, seq);
                if let Some(old) = self.timers.response_window.replace(TimerSlot { seq, task }) {
                    old.cancel();
                }
                TimerAction::PromptStillWatching { window }
            }
            TimerKind::ResponseWindowElapsed => {
                if !take_if_current(&mut self.timers.response_window, event.seq) {
                    return TimerAction::Nothing;
                }
                info!("no still-watching response, leaving custom mode");
                self.exit_after_prompt(Trigger::StillWatchingTimeout).await
            }
            TimerKind::PollTitle => {
                let current = self.timers.title_poll.as_ref().map(|slot| slot.seq);
                if current != Some(event.seq) || !self.mode.is_custom() {
                    return TimerAction::Nothing;
                }
                self.poll_title().await
            }
        }
    }

    /// Answer to the still-watching prompt. Ignored when no prompt is open.
    pub async fn still_watching_response(&mut self, watching: bool) -> TimerAction {
        let Some(window) = self.timers.response_window.take() else {
            return TimerAction::Nothing;
        };
        window.cancel();

        if watching {
            info!("still watching, restarting timer");
            self.start_still_watching_timer();
            TimerAction::StillWatchingConfirmed
        } else {
            self.exit_after_prompt(Trigger::NotWatching).await
        }
    }

    async fn exit_after_prompt(&mut self, trigger: Trigger) -> TimerAction {
        match self.exit_custom(trigger).await {
            Ok(transition) => TimerAction::Exited(transition),
            Err(err) => {
                self.start_still_watching_timer();
                TimerAction::ExitFailed(err)
            }
        }
    }

    async fn poll_title(&mut self) -> TimerAction {
        let Some(query) = self.title_query.clone() else {
            return TimerAction::Nothing;
        };
        let cleaned = match query.raw_title().await {
            Ok(raw) => raw.as_deref().and_then(clean_title),
            Err(err) => {
                debug!("title query failed: {err:#}");
                None
            }
        };
        let name = match cleaned {
            Some(title) => format!("{}{}", self.labels.custom_prefix, title),
            None => self.labels.custom_label.clone(),
        };
        if self.publisher.cached_name() == Some(name.as_str()) {
            return TimerAction::Nothing;
        }
        if self.publish(&name).await {
            TimerAction::TitlePublished(name)
        } else {
            TimerAction::Nothing
        }
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn start_still_watching_timer(&mut self) {
        let seq = self.next_seq();
        let task = spawn_once(
            self.timer_tx.clone(),
            self.timings.still_watching_after,
            TimerKind::StillWatchingDue,
            seq,
        );
        if let Some(old) = self.timers.still_watching.replace(TimerSlot { seq, task }) {
            old.cancel();
        }
    }

    fn start_title_poll(&mut self) {
        if self.title_query.is_none() {
            debug!("no player configured, title polling disabled");
            return;
        }
        let seq = self.next_seq();
        let every = self.timings.title_poll;
        let tx = self.timer_tx.clone();
        let task = tokio::spawn(async move {
            let event = TimerEvent {
                kind: TimerKind::PollTitle,
                seq,
            };
            if tx.send(event).is_err() {
                return;
            }
            let mut ticker = interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if tx.send(event).is_err() {
                    break;
                }
            }
        });
        if let Some(old) = self.timers.title_poll.replace(TimerSlot { seq, task }) {
            old.cancel();
        }
    }

    pub fn shutdown(&mut self) {
        self.timers.clear();
        debug!("mode timers stopped");
    }
}

fn spawn_once(
    tx: mpsc::UnboundedSender<TimerEvent>,
    after: Duration,
    kind: TimerKind,
    seq: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        sleep(after).await;
        let _ = tx.send(TimerEvent { kind, seq });
    })
}

fn take_if_current(slot: &mut Option<TimerSlot>, seq: u64) -> bool {
    if slot.as_ref().map(|s| s.seq) != Some(seq) {
        return false;
    }
    slot.take();
    true
}
