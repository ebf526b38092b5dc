//! Sequential download queue.
//!
//! A single worker task owns the queue. Jobs are served strictly in arrival
//! order and at most one of them is active; the active job carries the only
//! live cancellation token.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{FailureKind, FetchError};
use crate::fetch::{source_identifier, FetchProgress, VideoFetcher};
use crate::storage::{artifact_stem, remove_artifacts, remove_source_artifacts, resolve_target_dir, SubfolderNote};

pub type JobId = u64;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadRequest {
    pub url: String,
    pub requester: String,
    pub origin_channel: String,
    #[serde(default)]
    pub subfolder: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadJob {
    pub id: JobId,
    pub url: String,
    pub requester: String,
    pub origin_channel: String,
    pub target_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobOutcome {
    Succeeded { path: Option<PathBuf> },
    Failed { kind: FailureKind, detail: String },
    Cancelled { removed: Vec<PathBuf> },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DownloadEvent {
    Started {
        job: DownloadJob,
    },
    Progress {
        job_id: JobId,
        origin_channel: String,
        percent: f32,
        eta: Option<String>,
    },
    Finished {
        job: DownloadJob,
        outcome: JobOutcome,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct EnqueueReceipt {
    pub job_id: JobId,
    /// 0 when the job started right away, otherwise its place in line.
    pub position: usize,
    pub target_dir: PathBuf,
    pub note: Option<SubfolderNote>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CancelSummary {
    pub removed_queued: Vec<JobId>,
    pub aborted_active: Option<JobId>,
}

impl CancelSummary {
    pub fn is_empty(&self) -> bool {
        self.removed_queued.is_empty() && self.aborted_active.is_none()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueSnapshot {
    pub active: Option<DownloadJob>,
    pub queued: Vec<DownloadJob>,
}

enum QueueCommand {
    Enqueue {
        request: DownloadRequest,
        reply: oneshot::Sender<Result<EnqueueReceipt>>,
    },
    CancelJob {
        id: JobId,
        reply: oneshot::Sender<bool>,
    },
    CancelRequester {
        requester: String,
        reply: oneshot::Sender<CancelSummary>,
    },
    CancelAll {
        reply: oneshot::Sender<CancelSummary>,
    },
    Snapshot {
        reply: oneshot::Sender<QueueSnapshot>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to the queue worker.
#[derive(Clone)]
pub struct DownloadQueue {
    tx: mpsc::UnboundedSender<QueueCommand>,
}

impl DownloadQueue {
    pub fn spawn(
        fetcher: Arc<dyn VideoFetcher>,
        root: PathBuf,
        events: mpsc::UnboundedSender<DownloadEvent>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let worker = QueueWorker {
            fetcher,
            root,
            queued: VecDeque::new(),
            active: None,
            next_id: 1,
            events,
            done_tx,
            closing: false,
            shutdown_waiters: Vec::new(),
        };
        let handle = tokio::spawn(worker.run(rx, done_rx));
        (Self { tx }, handle)
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> QueueCommand) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .map_err(|_| anyhow!("download queue is not running"))?;
        rx.await.context("download queue dropped the request")
    }

    pub async fn enqueue(&self, request: DownloadRequest) -> Result<EnqueueReceipt> {
        self.request(|reply| QueueCommand::Enqueue { request, reply })
            .await?
    }

    pub async fn cancel(&self, id: JobId) -> Result<bool> {
        self.request(|reply| QueueCommand::CancelJob { id, reply }).await
    }

    pub async fn cancel_requester(&self, requester: &str) -> Result<CancelSummary> {
        let requester = requester.to_string();
        self.request(|reply| QueueCommand::CancelRequester { requester, reply })
            .await
    }

    pub async fn cancel_all(&self) -> Result<CancelSummary> {
        self.request(|reply| QueueCommand::CancelAll { reply }).await
    }

    pub async fn snapshot(&self) -> Result<QueueSnapshot> {
        self.request(|reply| QueueCommand::Snapshot { reply }).await
    }

    /// Cancels everything and resolves once the active job has settled.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| QueueCommand::Shutdown { reply }).await
    }
}

struct ActiveJob {
    job: DownloadJob,
    token: CancellationToken,
}

struct QueueWorker {
    fetcher: Arc<dyn VideoFetcher>,
    root: PathBuf,
    queued: VecDeque<DownloadJob>,
    active: Option<ActiveJob>,
    next_id: JobId,
    events: mpsc::UnboundedSender<DownloadEvent>,
    done_tx: mpsc::UnboundedSender<(JobId, JobOutcome)>,
    closing: bool,
    shutdown_waiters: Vec<oneshot::Sender<()>>,
}

impl QueueWorker {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<QueueCommand>,
        mut done: mpsc::UnboundedReceiver<(JobId, JobOutcome)>,
    ) {
        let mut commands_open = true;
        loop {
            tokio::select! {
                command = commands.recv(), if commands_open => match command {
                    Some(command) => self.handle(command),
                    None => {
                        commands_open = false;
                        self.begin_shutdown();
                    }
                },
                Some((id, outcome)) = done.recv() => self.finish(id, outcome),
            }

            if self.closing && self.active.is_none() {
                for waiter in self.shutdown_waiters.drain(..) {
                    let _ = waiter.send(());
                }
                break;
            }
        }
        info!("download queue stopped");
    }

    fn handle(&mut self, command: QueueCommand) {
        match command {
            QueueCommand::Enqueue { request, reply } => {
                let _ = reply.send(self.enqueue(request));
            }
            QueueCommand::CancelJob { id, reply } => {
                let _ = reply.send(self.cancel_job(id));
            }
            QueueCommand::CancelRequester { requester, reply } => {
                let summary = self.cancel_where(|job| job.requester == requester);
                let _ = reply.send(summary);
            }
            QueueCommand::CancelAll { reply } => {
                let _ = reply.send(self.cancel_where(|_| true));
            }
            QueueCommand::Snapshot { reply } => {
                let _ = reply.send(QueueSnapshot {
                    active: self.active.as_ref().map(|a| a.job.clone()),
                    queued: self.queued.iter().cloned().collect(),
                });
            }
            QueueCommand::Shutdown { reply } => {
                self.shutdown_waiters.push(reply);
                self.begin_shutdown();
            }
        }
    }

    fn enqueue(&mut self, request: DownloadRequest) -> Result<EnqueueReceipt> {
        if self.closing {
            return Err(anyhow!("download queue is shutting down"));
        }

        let (target_dir, note) = resolve_target_dir(&self.root, request.subfolder.as_deref());
        if let Some(note) = &note {
            warn!(requester = %request.requester, ?note, "download subfolder not used");
        }

        let id = self.next_id;
        self.next_id += 1;
        let job = DownloadJob {
            id,
            url: request.url,
            requester: request.requester,
            origin_channel: request.origin_channel,
            target_dir: target_dir.clone(),
        };
        info!(job = id, url = %job.url, requester = %job.requester, "download queued");
        self.queued.push_back(job);
        self.start_next();

        let position = self
            .queued
            .iter()
            .position(|job| job.id == id)
            .map(|idx| idx + 1)
            .unwrap_or(0);
        Ok(EnqueueReceipt {
            job_id: id,
            position,
            target_dir,
            note,
        })
    }

    fn cancel_job(&mut self, id: JobId) -> bool {
        if let Some(active) = self.active.as_ref().filter(|a| a.job.id == id) {
            info!(job = id, "cancelling active download");
            active.token.cancel();
            return true;
        }
        let Some(idx) = self.queued.iter().position(|job| job.id == id) else {
            return false;
        };
        if let Some(job) = self.queued.remove(idx) {
            self.emit_dropped(job);
        }
        true
    }

    fn cancel_where(&mut self, matches: impl Fn(&DownloadJob) -> bool) -> CancelSummary {
        let mut summary = CancelSummary::default();

        let (dropped, kept): (Vec<_>, Vec<_>) = self.queued.drain(..).partition(|job| matches(job));
        self.queued = kept.into();
        for job in dropped {
            summary.removed_queued.push(job.id);
            self.emit_dropped(job);
        }

        if let Some(active) = self.active.as_ref().filter(|a| matches(&a.job)) {
            info!(job = active.job.id, "cancelling active download");
            active.token.cancel();
            summary.aborted_active = Some(active.job.id);
        }
        summary
    }

    fn begin_shutdown(&mut self) {
        if !self.closing {
            info!("download queue shutting down");
        }
        self.closing = true;
        self.cancel_where(|_| true);
    }

    fn emit_dropped(&self, job: DownloadJob) {
        debug!(job = job.id, "removed queued download");
        let _ = self.events.send(DownloadEvent::Finished {
            job,
            outcome: JobOutcome::Cancelled {
                removed: Vec::new(),
            },
        });
    }

    fn start_next(&mut self) {
        if self.active.is_some() || self.closing {
            return;
        }
        let Some(job) = self.queued.pop_front() else {
            return;
        };

        let token = CancellationToken::new();
        info!(job = job.id, url = %job.url, "download started");
        let _ = self.events.send(DownloadEvent::Started { job: job.clone() });

        let fetcher = Arc::clone(&self.fetcher);
        let events = self.events.clone();
        let done = self.done_tx.clone();
        let task_job = job.clone();
        let task_token = token.clone();
        tokio::spawn(async move {
            let outcome = run_job(fetcher.as_ref(), &task_job, &task_token, &events).await;
            let _ = done.send((task_job.id, outcome));
        });

        self.active = Some(ActiveJob { job, token });
    }

    fn finish(&mut self, id: JobId, outcome: JobOutcome) {
        if self.active.as_ref().map(|a| a.job.id) != Some(id) {
            warn!(job = id, "completion for a job that is not active");
            return;
        }
        let Some(active) = self.active.take() else {
            return;
        };
        match &outcome {
            JobOutcome::Succeeded { path } => info!(job = id, ?path, "download finished"),
            JobOutcome::Failed { kind, detail } => {
                warn!(job = id, kind = kind.label(), detail = %detail, "download failed")
            }
            JobOutcome::Cancelled { removed } => {
                info!(job = id, removed = removed.len(), "download cancelled")
            }
        }
        let _ = self.events.send(DownloadEvent::Finished {
            job: active.job,
            outcome,
        });
        self.start_next();
    }
}

async fn run_job(
    fetcher: &dyn VideoFetcher,
    job: &DownloadJob,
    token: &CancellationToken,
    events: &mpsc::UnboundedSender<DownloadEvent>,
) -> JobOutcome {
    let prediction = tokio::select! {
        prediction = fetcher.predict_output_path(&job.url, &job.target_dir) => prediction,
        _ = token.cancelled() => return JobOutcome::Cancelled { removed: Vec::new() },
    };
    let (predicted, stem) = match prediction {
        Ok(path) => {
            debug!(job = job.id, path = %path.display(), "predicted output path");
            let stem = artifact_stem(&path);
            (Some(path), stem)
        }
        Err(err) => {
            warn!(job = job.id, "could not predict output path, cleanup will be best-effort: {err}");
            (None, None)
        }
    };

    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<FetchProgress>();
    let fetch = fetcher.fetch(&job.url, &job.target_dir, progress_tx, token.clone());
    tokio::pin!(fetch);

    let mut last_percent = None;
    let result = loop {
        tokio::select! {
            result = &mut fetch => break result,
            Some(update) = progress_rx.recv() => forward_progress(job, update, &mut last_percent, events),
        }
    };
    while let Ok(update) = progress_rx.try_recv() {
        forward_progress(job, update, &mut last_percent, events);
    }

    // A clean exit that raced the cancel still counts as cancelled.
    if token.is_cancelled() || matches!(result, Err(FetchError::Cancelled)) {
        let removed = match &stem {
            Some(stem) => remove_artifacts(&job.target_dir, stem),
            None => remove_source_artifacts(&job.target_dir, &source_identifier(&job.url)),
        };
        return JobOutcome::Cancelled { removed };
    }

    match result {
        Ok(()) => JobOutcome::Succeeded { path: predicted },
        Err(err) => JobOutcome::Failed {
            kind: FailureKind::classify(&err),
            detail: err.to_string(),
        },
    }
}

fn forward_progress(
    job: &DownloadJob,
    update: FetchProgress,
    last_percent: &mut Option<u32>,
    events: &mpsc::UnboundedSender<DownloadEvent>,
) {
    let whole = update.percent.floor() as u32;
    if *last_percent == Some(whole) {
        return;
    }
    *last_percent = Some(whole);
    let _ = events.send(DownloadEvent::Progress {
        job_id: job.id,
        origin_channel: job.origin_channel.clone(),
        percent: update.percent,
        eta: update.eta,
    });
}

pub fn describe_target(root: &Path, target: &Path) -> String {
    match target.strip_prefix(root) {
        Ok(rel) if rel.as_os_str().is_empty() => "main download folder".to_string(),
        Ok(rel) => format!("folder '{}'", rel.display()),
        Err(_) => target.display().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{fetched_name, FakeFetcher};
    use std::time::Duration;

    fn request(url: &str, requester: &str) -> DownloadRequest {
        DownloadRequest {
            url: url.to_string(),
            requester: requester.to_string(),
            origin_channel: "downloads".to_string(),
            subfolder: None,
        }
    }

    struct Harness {
        queue: DownloadQueue,
        events: mpsc::UnboundedReceiver<DownloadEvent>,
        fetcher: Arc<FakeFetcher>,
        root: tempfile::TempDir,
    }

    fn harness(fetcher: FakeFetcher) -> Harness {
        let root = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(fetcher);
        let (tx, events) = mpsc::unbounded_channel();
        let (queue, _worker) = DownloadQueue::spawn(fetcher.clone(), root.path().to_path_buf(), tx);
        Harness {
            queue,
            events,
            fetcher,
            root,
        }
    }

    /// Collects events until `finished` jobs have reached a terminal state,
    /// checking that no two jobs were ever active at once.
    async fn drain(events: &mut mpsc::UnboundedReceiver<DownloadEvent>, finished: usize) -> Vec<(JobId, JobOutcome)> {
        let mut active: Option<JobId> = None;
        let mut done = Vec::new();
        while done.len() < finished {
            match events.recv().await.unwrap() {
                DownloadEvent::Started { job } => {
                    assert!(active.is_none(), "job {} started while {:?} active", job.id, active);
                    active = Some(job.id);
                }
                DownloadEvent::Finished { job, outcome } => {
                    if active == Some(job.id) {
                        active = None;
                    }
                    done.push((job.id, outcome));
                }
                DownloadEvent::Progress { .. } => {}
            }
        }
        done
    }

    #[tokio::test(start_paused = true)]
    async fn serves_jobs_one_at_a_time_in_order() {
        let mut h = harness(FakeFetcher::new(Duration::from_secs(10)));
        let a = h.queue.enqueue(request("https://v.example/a", "u1")).await.unwrap();
        let b = h.queue.enqueue(request("https://v.example/b", "u2")).await.unwrap();
        let c = h.queue.enqueue(request("https://v.example/c", "u1")).await.unwrap();
        assert_eq!((a.position, b.position, c.position), (0, 1, 2));

        let done = drain(&mut h.events, 3).await;
        let ids: Vec<_> = done.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![a.job_id, b.job_id, c.job_id]);
        assert!(done
            .iter()
            .all(|(_, outcome)| matches!(outcome, JobOutcome::Succeeded { path: Some(_) })));
        assert_eq!(
            h.fetcher.started(),
            vec!["https://v.example/a", "https://v.example/b", "https://v.example/c"]
        );
        assert!(h.root.path().join(fetched_name("https://v.example/a")).exists());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelling_a_requester_aborts_active_and_drops_queued() {
        let mut h = harness(FakeFetcher::new(Duration::from_secs(10)));
        let a = h.queue.enqueue(request("https://v.example/a", "user1")).await.unwrap();
        let b = h.queue.enqueue(request("https://v.example/b", "user2")).await.unwrap();
        let c = h.queue.enqueue(request("https://v.example/c", "user1")).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        let summary = h.queue.cancel_requester("user1").await.unwrap();
        assert_eq!(summary.aborted_active, Some(a.job_id));
        assert_eq!(summary.removed_queued, vec![c.job_id]);

        let done = drain(&mut h.events, 3).await;
        let outcome_of = |id| done.iter().find(|(j, _)| *j == id).map(|(_, o)| o.clone()).unwrap();
        match outcome_of(a.job_id) {
            JobOutcome::Cancelled { removed } => {
                assert_eq!(removed, vec![h.root.path().join("Clip [a].mp4.part")]);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(matches!(outcome_of(b.job_id), JobOutcome::Succeeded { .. }));
        assert!(matches!(outcome_of(c.job_id), JobOutcome::Cancelled { .. }));
        assert_eq!(h.fetcher.started(), vec!["https://v.example/a", "https://v.example/b"]);
        assert!(!h.root.path().join("Clip [a].mp4.part").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_all_leaves_nothing_behind() {
        let mut h = harness(FakeFetcher::new(Duration::from_secs(10)));
        for name in ["a", "b", "c"] {
            h.queue
                .enqueue(request(&format!("https://v.example/{name}"), "u1"))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_secs(1)).await;

        let summary = h.queue.cancel_all().await.unwrap();
        assert_eq!(summary.removed_queued.len(), 2);
        assert!(summary.aborted_active.is_some());

        let done = drain(&mut h.events, 3).await;
        assert!(done
            .iter()
            .all(|(_, outcome)| matches!(outcome, JobOutcome::Cancelled { .. })));
        let snapshot = h.queue.snapshot().await.unwrap();
        assert!(snapshot.active.is_none());
        assert!(snapshot.queued.is_empty());
        assert_eq!(h.fetcher.started().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_single_queued_job() {
        let mut h = harness(FakeFetcher::new(Duration::from_secs(10)));
        h.queue.enqueue(request("https://v.example/a", "u1")).await.unwrap();
        let b = h.queue.enqueue(request("https://v.example/b", "u1")).await.unwrap();

        assert!(h.queue.cancel(b.job_id).await.unwrap());
        assert!(!h.queue.cancel(999).await.unwrap());

        let done = drain(&mut h.events, 2).await;
        assert_eq!(done[0].0, b.job_id);
        assert!(matches!(done[0].1, JobOutcome::Cancelled { .. }));
        assert!(matches!(done[1].1, JobOutcome::Succeeded { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn failures_are_classified() {
        let fetcher = FakeFetcher::new(Duration::from_secs(5))
            .failing("https://v.example/private", "ERROR: [youtube] x: Private video");
        let mut h = harness(fetcher);
        h.queue
            .enqueue(request("https://v.example/private", "u1"))
            .await
            .unwrap();

        let done = drain(&mut h.events, 1).await;
        match &done[0].1 {
            JobOutcome::Failed { kind, detail } => {
                assert_eq!(*kind, FailureKind::RemoteUnavailable);
                assert!(detail.contains("Private video"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unpredictable_output_still_cancels() {
        let fetcher = FakeFetcher::new(Duration::from_secs(10)).unpredictable("https://v.example/a");
        let mut h = harness(fetcher);
        std::fs::write(h.root.path().join("keep.mp4"), b"x").unwrap();
        let a = h.queue.enqueue(request("https://v.example/a", "u1")).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        let part = h.root.path().join("Clip [a].mp4.part");
        assert!(part.exists());

        assert!(h.queue.cancel(a.job_id).await.unwrap());
        let done = drain(&mut h.events, 1).await;
        match &done[0].1 {
            JobOutcome::Cancelled { removed } => assert_eq!(removed, &vec![part.clone()]),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(!part.exists());
        assert!(h.root.path().join("keep.mp4").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn clean_finish_after_cancel_counts_as_cancelled() {
        let fetcher = FakeFetcher::new(Duration::from_secs(10)).ignoring_cancel("https://v.example/a");
        let mut h = harness(fetcher);
        let a = h.queue.enqueue(request("https://v.example/a", "u1")).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(h.queue.cancel(a.job_id).await.unwrap());
        let done = drain(&mut h.events, 1).await;
        let finished = h.root.path().join(fetched_name("https://v.example/a"));
        match &done[0].1 {
            JobOutcome::Cancelled { removed } => assert_eq!(removed, &vec![finished.clone()]),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(!finished.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_subfolder_is_reported_not_rejected() {
        let h = harness(FakeFetcher::new(Duration::from_secs(10)));
        let mut req = request("https://v.example/a", "u1");
        req.subfolder = Some("../nowhere".to_string());

        let receipt = h.queue.enqueue(req).await.unwrap();
        assert_eq!(receipt.target_dir, h.root.path());
        assert!(matches!(receipt.note, Some(SubfolderNote::Missing { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_settles_active_job() {
        let mut h = harness(FakeFetcher::new(Duration::from_secs(10)));
        h.queue.enqueue(request("https://v.example/a", "u1")).await.unwrap();
        h.queue.enqueue(request("https://v.example/b", "u1")).await.unwrap();

        h.queue.shutdown().await.unwrap();
        let done = drain(&mut h.events, 2).await;
        assert!(done
            .iter()
            .all(|(_, outcome)| matches!(outcome, JobOutcome::Cancelled { .. })));
        assert!(h.queue.enqueue(request("https://v.example/c", "u1")).await.is_err());
    }
}
