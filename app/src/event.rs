use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::EventError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Scheduled,
    Active,
    Completed,
    Cancelled,
}

impl EventStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, EventStatus::Completed | EventStatus::Cancelled)
    }
}

/// What the platform last told us about the scheduled event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSnapshot {
    pub id: String,
    pub name: String,
    pub status: EventStatus,
}

/// Backend that hosts the scheduled event. "Not found" answers must come back
/// as [`EventError::Gone`].
#[async_trait]
pub trait EventPlatform: Send + Sync {
    async fn find_owned_active_event(&self, venue: &str)
        -> Result<Option<EventSnapshot>, EventError>;
    async fn create_event(&self, venue: &str, name: &str) -> Result<EventSnapshot, EventError>;
    async fn rename(&self, event_id: &str, name: &str) -> Result<EventSnapshot, EventError>;
    async fn refresh(&self, event_id: &str) -> Result<EventSnapshot, EventError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Unchanged,
    Renamed,
    Created,
}

#[derive(Debug)]
struct CachedEvent {
    snapshot: EventSnapshot,
    verified_at: Instant,
}

/// Keeps the scheduled event's display name in sync.
///
/// The handle is never trusted: a missing, terminal, gone or stale handle is
/// resolved again (find an owned live event in the venue, otherwise create
/// one) before renaming.
pub struct EventNamePublisher {
    platform: Arc<dyn EventPlatform>,
    venue: String,
    refresh_after: Duration,
    cached: Option<CachedEvent>,
}

impl EventNamePublisher {
    pub fn new(platform: Arc<dyn EventPlatform>, venue: impl Into<String>, refresh_after: Duration) -> Self {
        Self {
            platform,
            venue: venue.into(),
            refresh_after,
            cached: None,
        }
    }

    pub fn cached_name(&self) -> Option<&str> {
        self.cached.as_ref().map(|c| c.snapshot.name.as_str())
    }

    pub async fn publish(&mut self, name: &str) -> Result<PublishOutcome, EventError> {
        if let Some(cached) = &self.cached {
            if cached.snapshot.name == name && !cached.snapshot.status.is_terminal() {
                return Ok(PublishOutcome::Unchanged);
            }
        }

        // A handle that vanished under us gets one fresh resolution.
        for attempt in 0..2 {
            let (snapshot, created) = self.resolve(name).await?;
            if created {
                return Ok(PublishOutcome::Created);
            }
            if snapshot.name == name {
                return Ok(PublishOutcome::Unchanged);
            }

            match self.platform.rename(&snapshot.id, name).await {
                Ok(updated) => {
                    info!(event = %updated.id, name, "renamed scheduled event");
                    self.store(updated);
                    return Ok(PublishOutcome::Renamed);
                }
                Err(EventError::Gone) if attempt == 0 => {
                    warn!(event = %snapshot.id, "scheduled event disappeared, resolving again");
                    self.cached = None;
                }
                Err(err) => {
                    if matches!(err, EventError::Gone) {
                        self.cached = None;
                    }
                    return Err(err);
                }
            }
        }
        Err(EventError::Gone)
    }

    async fn resolve(&mut self, initial_name: &str) -> Result<(EventSnapshot, bool), EventError> {
        if let Some(cached) = self.cached.take() {
            if !cached.snapshot.status.is_terminal() {
                if cached.verified_at.elapsed() < self.refresh_after {
                    let snapshot = cached.snapshot.clone();
                    self.cached = Some(cached);
                    return Ok((snapshot, false));
                }

                match self.platform.refresh(&cached.snapshot.id).await {
                    Ok(fresh) if !fresh.status.is_terminal() => {
                        self.store(fresh.clone());
                        return Ok((fresh, false));
                    }
                    Ok(_) | Err(EventError::Gone) => {
                        debug!(event = %cached.snapshot.id, "cached event is finished or gone");
                    }
                    Err(err) => {
                        self.cached = Some(cached);
                        return Err(err);
                    }
                }
            }
        }

        if let Some(found) = self.platform.find_owned_active_event(&self.venue).await? {
            if !found.status.is_terminal() {
                debug!(event = %found.id, "reusing existing scheduled event");
                self.store(found.clone());
                return Ok((found, false));
            }
        }

        let created = self.platform.create_event(&self.venue, initial_name).await?;
        info!(event = %created.id, name = %created.name, venue = %self.venue, "created scheduled event");
        self.store(created.clone());
        Ok((created, true))
    }

    fn store(&mut self, snapshot: EventSnapshot) {
        self.cached = Some(CachedEvent {
            snapshot,
            verified_at: Instant::now(),
        });
    }
}
