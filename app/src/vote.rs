//! Time-boxed yes/no votes among distinct participants.
//!
//! Every session runs in its own task. Ballots reach it through the
//! [`VoteHandle`] and are applied in arrival order; the session resolves when
//! its deadline passes or when the handle ends it early. Progress ticks are
//! emitted on a separate channel and never influence resolution.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::error::VoteError;

pub type VoteId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteKind {
    ModeToCustom,
    ModeToScheduled,
    SkipItem,
    ConfirmFilePlay,
}

impl fmt::Display for VoteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            VoteKind::ModeToCustom => "switch to custom",
            VoteKind::ModeToScheduled => "switch to scheduled",
            VoteKind::SkipItem => "skip",
            VoteKind::ConfirmFilePlay => "play file",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Choice {
    Yes,
    No,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolveReason {
    Deadline,
    EndedEarly,
}

/// Tally state of one vote.
#[derive(Debug)]
pub struct VoteSession {
    kind: VoteKind,
    started_at: Instant,
    deadline: Instant,
    voters: HashSet<String>,
    yes: u32,
    no: u32,
}

impl VoteSession {
    pub fn new(kind: VoteKind, duration: Duration, now: Instant) -> Self {
        Self {
            kind,
            started_at: now,
            deadline: now + duration,
            voters: HashSet::new(),
            yes: 0,
            no: 0,
        }
    }

    /// Records a ballot. Returns `false` when the voter already voted.
    pub fn cast(&mut self, voter: &str, choice: Choice) -> bool {
        if !self.voters.insert(voter.to_string()) {
            return false;
        }
        match choice {
            Choice::Yes => self.yes += 1,
            Choice::No => self.no += 1,
        }
        true
    }

    pub fn tally(&self) -> (u32, u32) {
        (self.yes, self.no)
    }

    /// Simple majority of the ballots cast; a tie (including 0-0) fails.
    pub fn passed(&self) -> bool {
        self.yes > self.no
    }

    pub fn remaining(&self, now: Instant) -> Duration {
        self.deadline.saturating_duration_since(now)
    }

    pub fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started_at)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct VoteOutcome {
    pub id: VoteId,
    pub kind: VoteKind,
    pub context: String,
    pub passed: bool,
    pub yes: u32,
    pub no: u32,
    pub reason: ResolveReason,
}

/// Cosmetic "time remaining" update for an open vote.
#[derive(Debug, Clone)]
pub struct VoteTick {
    pub id: VoteId,
    pub kind: VoteKind,
    pub remaining: Duration,
    pub yes: u32,
    pub no: u32,
}

#[derive(Debug)]
enum VoteMsg {
    Ballot { voter: String, choice: Choice },
    EndEarly,
}

#[derive(Debug, Clone)]
pub struct VoteHandle {
    id: VoteId,
    kind: VoteKind,
    tx: mpsc::UnboundedSender<VoteMsg>,
}

impl VoteHandle {
    pub fn id(&self) -> VoteId {
        self.id
    }

    pub fn kind(&self) -> VoteKind {
        self.kind
    }

    /// Returns `false` once the session has already resolved.
    pub fn cast(&self, voter: impl Into<String>, choice: Choice) -> bool {
        self.tx
            .send(VoteMsg::Ballot {
                voter: voter.into(),
                choice,
            })
            .is_ok()
    }

    pub fn end_early(&self) {
        let _ = self.tx.send(VoteMsg::EndEarly);
    }
}

pub struct VoteReceivers {
    pub outcomes: mpsc::UnboundedReceiver<VoteOutcome>,
    pub ticks: mpsc::UnboundedReceiver<VoteTick>,
}

type ActiveKey = (VoteKind, String);

pub struct VoteEngine {
    active: Arc<Mutex<HashSet<ActiveKey>>>,
    next_id: AtomicU64,
    outcomes: mpsc::UnboundedSender<VoteOutcome>,
    ticks: mpsc::UnboundedSender<VoteTick>,
    refresh_every: Duration,
}

impl VoteEngine {
    pub fn new(refresh_every: Duration) -> (Self, VoteReceivers) {
        let (outcomes, outcomes_rx) = mpsc::unbounded_channel();
        let (ticks, ticks_rx) = mpsc::unbounded_channel();
        let engine = Self {
            active: Arc::new(Mutex::new(HashSet::new())),
            next_id: AtomicU64::new(1),
            outcomes,
            ticks,
            refresh_every: refresh_every.max(Duration::from_millis(100)),
        };
        (
            engine,
            VoteReceivers {
                outcomes: outcomes_rx,
                ticks: ticks_rx,
            },
        )
    }

    pub fn is_active(&self, kind: VoteKind, context: &str) -> bool {
        lock_active(&self.active).contains(&(kind, context.to_string()))
    }

    /// Opens a vote. At most one vote of a kind may run per context.
    pub fn start(
        &self,
        kind: VoteKind,
        context: &str,
        duration: Duration,
    ) -> Result<VoteHandle, VoteError> {
        let key = (kind, context.to_string());
        if !lock_active(&self.active).insert(key.clone()) {
            return Err(VoteError::AlreadyActive {
                kind,
                context: context.to_string(),
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let session = VoteSession::new(kind, duration, Instant::now());
        info!(vote = id, %kind, context, ?duration, "vote started");

        tokio::spawn(run_session(
            id,
            key,
            session,
            rx,
            self.refresh_every,
            self.ticks.clone(),
            self.outcomes.clone(),
            Arc::clone(&self.active),
        ));

        Ok(VoteHandle { id, kind, tx })
    }
}

fn lock_active(
    active: &Mutex<HashSet<ActiveKey>>,
) -> std::sync::MutexGuard<'_, HashSet<ActiveKey>> {
    active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[allow(clippy::too_many_arguments)]
async fn run_session(
    id: VoteId,
    key: ActiveKey,
    mut session: VoteSession,
    mut inbox: mpsc::UnboundedReceiver<VoteMsg>,
    refresh_every: Duration,
    ticks: mpsc::UnboundedSender<VoteTick>,
    outcomes: mpsc::UnboundedSender<VoteOutcome>,
    active: Arc<Mutex<HashSet<ActiveKey>>>,
) {
    let deadline = sleep_until(session.deadline);
    tokio::pin!(deadline);
    let mut refresh = interval_at(session.started_at + refresh_every, refresh_every);
    refresh.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut inbox_open = true;

    // Ballots are checked first so that one arriving alongside the deadline
    // still counts. The refresh branch only reads the tally.
    let reason = loop {
        tokio::select! {
            biased;
            msg = inbox.recv(), if inbox_open => match msg {
                Some(VoteMsg::Ballot { voter, choice }) => {
                    if !session.cast(&voter, choice) {
                        debug!(vote = id, voter, "ignoring repeat ballot");
                    }
                }
                Some(VoteMsg::EndEarly) => break ResolveReason::EndedEarly,
                None => inbox_open = false,
            },
            _ = &mut deadline => break ResolveReason::Deadline,
            _ = refresh.tick() => {
                let (yes, no) = session.tally();
                let _ = ticks.send(VoteTick {
                    id,
                    kind: session.kind,
                    remaining: session.remaining(Instant::now()),
                    yes,
                    no,
                });
            }
        }
    };
    inbox.close();

    let (yes, no) = session.tally();
    let passed = session.passed();
    info!(
        vote = id,
        kind = %session.kind,
        yes,
        no,
        passed,
        ?reason,
        elapsed = ?session.elapsed(Instant::now()),
        "vote resolved"
    );

    lock_active(&active).remove(&key);
    let _ = outcomes.send(VoteOutcome {
        id,
        kind: key.0,
        context: key.1,
        passed,
        yes,
        no,
        reason,
    });
}
