//! In-memory collaborators shared by the unit tests.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{EventError, FetchError, ScriptError};
use crate::event::{EventPlatform, EventSnapshot, EventStatus};
use crate::fetch::{source_identifier, FetchProgress, VideoFetcher};
use crate::notice::{Notice, Notifier};
use crate::player::TitleQuery;
use crate::script::{ScriptExecutor, ScriptOutput, ScriptPaths};

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub fn script_paths() -> ScriptPaths {
    ScriptPaths {
        enter_custom: Some(PathBuf::from("/scripts/enter.sh")),
        exit_custom: Some(PathBuf::from("/scripts/exit.sh")),
        skip: Some(PathBuf::from("/scripts/skip.sh")),
        play_file: Some(PathBuf::from("/scripts/play.sh")),
    }
}

/// Records script runs by file name. Scripts listed as failing exit non-zero,
/// scripts listed as reporting exit cleanly with an `ERROR` line on stderr.
#[derive(Default)]
pub struct FakeScripts {
    runs: Mutex<Vec<String>>,
    failing: Mutex<HashSet<String>>,
    reporting: Mutex<HashSet<String>>,
}

impl FakeScripts {
    pub fn fail(&self, name: &str) {
        lock(&self.failing).insert(name.to_string());
    }

    pub fn report_error(&self, name: &str) {
        lock(&self.reporting).insert(name.to_string());
    }

    pub fn heal(&self, name: &str) {
        lock(&self.failing).remove(name);
        lock(&self.reporting).remove(name);
    }

    pub fn runs(&self) -> Vec<String> {
        lock(&self.runs).clone()
    }
}

#[async_trait]
impl ScriptExecutor for FakeScripts {
    async fn run(&self, script: &Path, args: &[String]) -> Result<ScriptOutput, ScriptError> {
        let name = script
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut entry = name.clone();
        for arg in args {
            entry.push(' ');
            entry.push_str(arg);
        }
        lock(&self.runs).push(entry);

        if lock(&self.failing).contains(&name) {
            return Err(ScriptError::Failed {
                path: script.to_path_buf(),
                code: Some(1),
                stderr: "boom".to_string(),
            });
        }
        let stderr = if lock(&self.reporting).contains(&name) {
            "ERROR: player is not running\n".to_string()
        } else {
            String::new()
        };
        Ok(ScriptOutput {
            stdout: "ok\n".to_string(),
            stderr,
        })
    }
}

/// Event platform keeping events in a map and logging every call.
#[derive(Default)]
pub struct FakePlatform {
    events: Mutex<HashMap<String, EventSnapshot>>,
    calls: Mutex<Vec<String>>,
    next_id: Mutex<u32>,
}

impl FakePlatform {
    pub fn insert(&self, id: &str, name: &str, status: EventStatus) {
        lock(&self.events).insert(
            id.to_string(),
            EventSnapshot {
                id: id.to_string(),
                name: name.to_string(),
                status,
            },
        );
    }

    pub fn remove_all(&self) {
        lock(&self.events).clear();
    }

    pub fn set_status(&self, id: &str, status: EventStatus) {
        if let Some(event) = lock(&self.events).get_mut(id) {
            event.status = status;
        }
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    pub fn name_of(&self, id: &str) -> Option<String> {
        lock(&self.events).get(id).map(|e| e.name.clone())
    }

    fn record(&self, call: String) {
        lock(&self.calls).push(call);
    }
}

#[async_trait]
impl EventPlatform for FakePlatform {
    async fn find_owned_active_event(&self, venue: &str) -> Result<Option<EventSnapshot>, EventError> {
        self.record(format!("find {venue}"));
        let events = lock(&self.events);
        let mut live: Vec<_> = events.values().filter(|e| !e.status.is_terminal()).collect();
        live.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(live.first().map(|e| (*e).clone()))
    }

    async fn create_event(&self, venue: &str, name: &str) -> Result<EventSnapshot, EventError> {
        self.record(format!("create {venue} {name}"));
        let id = {
            let mut next = lock(&self.next_id);
            *next += 1;
            format!("ev-{}", *next)
        };
        let snapshot = EventSnapshot {
            id: id.clone(),
            name: name.to_string(),
            status: EventStatus::Active,
        };
        lock(&self.events).insert(id, snapshot.clone());
        Ok(snapshot)
    }

    async fn rename(&self, event_id: &str, name: &str) -> Result<EventSnapshot, EventError> {
        self.record(format!("rename {event_id} {name}"));
        let mut events = lock(&self.events);
        let event = events.get_mut(event_id).ok_or(EventError::Gone)?;
        event.name = name.to_string();
        Ok(event.clone())
    }

    async fn refresh(&self, event_id: &str) -> Result<EventSnapshot, EventError> {
        self.record(format!("refresh {event_id}"));
        lock(&self.events)
            .get(event_id)
            .cloned()
            .ok_or(EventError::Gone)
    }
}

/// Fetcher that writes a `.part` file, reports 50%, waits, then renames it
/// into place.
pub struct FakeFetcher {
    duration: Duration,
    failures: HashMap<String, String>,
    unpredictable: HashSet<String>,
    ignores_cancel: HashSet<String>,
    started: Mutex<Vec<String>>,
}

/// File name the fake writes for `url`, shaped like the real output template.
pub fn fetched_name(url: &str) -> String {
    format!("Clip [{}].mp4", source_identifier(url))
}

impl FakeFetcher {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            failures: HashMap::new(),
            unpredictable: HashSet::new(),
            ignores_cancel: HashSet::new(),
            started: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(mut self, url: &str, stderr: &str) -> Self {
        self.failures.insert(url.to_string(), stderr.to_string());
        self
    }

    pub fn unpredictable(mut self, url: &str) -> Self {
        self.unpredictable.insert(url.to_string());
        self
    }

    /// Runs to completion and returns `Ok` even after the token fires.
    pub fn ignoring_cancel(mut self, url: &str) -> Self {
        self.ignores_cancel.insert(url.to_string());
        self
    }

    pub fn started(&self) -> Vec<String> {
        lock(&self.started).clone()
    }
}

#[async_trait]
impl VideoFetcher for FakeFetcher {
    async fn predict_output_path(&self, url: &str, target_dir: &Path) -> Result<PathBuf, FetchError> {
        if self.unpredictable.contains(url) {
            return Err(FetchError::Tool {
                code: Some(2),
                stderr: "ERROR: cannot predict".to_string(),
            });
        }
        Ok(target_dir.join(fetched_name(url)))
    }

    async fn fetch(
        &self,
        url: &str,
        target_dir: &Path,
        progress: mpsc::UnboundedSender<FetchProgress>,
        cancel: CancellationToken,
    ) -> Result<(), FetchError> {
        lock(&self.started).push(url.to_string());
        let finished = target_dir.join(fetched_name(url));
        let part = finished.with_extension("mp4.part");
        std::fs::write(&part, b"partial")?;
        let _ = progress.send(FetchProgress {
            percent: 50.0,
            eta: Some("00:05".to_string()),
        });

        if self.ignores_cancel.contains(url) {
            tokio::time::sleep(self.duration).await;
        } else {
            tokio::select! {
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                _ = tokio::time::sleep(self.duration) => {}
            }
        }

        if let Some(stderr) = self.failures.get(url) {
            let _ = std::fs::remove_file(&part);
            return Err(FetchError::Tool {
                code: Some(1),
                stderr: stderr.clone(),
            });
        }
        std::fs::rename(&part, &finished)?;
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeTitle {
    title: Mutex<Option<String>>,
}

impl FakeTitle {
    pub fn set(&self, title: Option<&str>) {
        *lock(&self.title) = title.map(str::to_string);
    }
}

#[async_trait]
impl TitleQuery for FakeTitle {
    async fn raw_title(&self) -> anyhow::Result<Option<String>> {
        Ok(lock(&self.title).clone())
    }
}

/// Forwards every notice to a channel the test reads from.
pub struct RecordingNotifier {
    tx: mpsc::UnboundedSender<Notice>,
}

impl RecordingNotifier {
    pub fn channel() -> (Arc<Self>, mpsc::UnboundedReceiver<Notice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notice: Notice) -> anyhow::Result<()> {
        let _ = self.tx.send(notice);
        Ok(())
    }
}

/// Waits for the first notice matching `pred`, skipping the rest.
pub async fn next_notice(
    rx: &mut mpsc::UnboundedReceiver<Notice>,
    pred: impl Fn(&Notice) -> bool,
) -> Notice {
    loop {
        let notice = rx.recv().await.expect("notifier channel closed");
        if pred(&notice) {
            return notice;
        }
    }
}
