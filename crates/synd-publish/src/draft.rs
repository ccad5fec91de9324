//! Draft persistence: create once, update afterwards, driven by debounce and
//! interval timers.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use synd_storage::RecordStore;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::orchestrator::PublishError;
use crate::session::SharedSession;
use crate::ListingDocument;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DraftStatus {
    Idle,
    Saving,
    Saved {
        record_id: Uuid,
        revision: u64,
        at: DateTime<Utc>,
    },
    Error {
        message: String,
    },
}

/// Advisory result of one save call. Failures are reported, never raised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    Created(Uuid),
    Updated(Uuid),
    Unchanged(Uuid),
    Failed(String),
}

#[derive(Debug, Default)]
struct DraftState {
    id: Option<Uuid>,
    last_saved_revision: Option<u64>,
}

/// Saves the session's record through a [`RecordStore`]. Saves are serialized
/// by the state lock, so only one create can ever be in flight.
pub struct DraftSaver {
    session: SharedSession,
    store: Arc<dyn RecordStore>,
    state: Mutex<DraftState>,
    status: watch::Sender<DraftStatus>,
}

impl std::fmt::Debug for DraftSaver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DraftSaver")
            .field("status", &*self.status.borrow())
            .finish_non_exhaustive()
    }
}

impl DraftSaver {
    /// A session whose record already carries an id starts in the has-id state.
    pub async fn new(session: SharedSession, store: Arc<dyn RecordStore>) -> Self {
        let id = session.read(|s| s.record().id).await;
        let (status, _rx) = watch::channel(DraftStatus::Idle);
        Self {
            session,
            store,
            state: Mutex::new(DraftState {
                id,
                last_saved_revision: None,
            }),
            status,
        }
    }

    pub fn session(&self) -> &SharedSession {
        &self.session
    }

    pub async fn id(&self) -> Option<Uuid> {
        self.state.lock().await.id
    }

    pub fn status(&self) -> DraftStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<DraftStatus> {
        self.status.subscribe()
    }

    pub async fn save(&self) -> SaveOutcome {
        let mut state = self.state.lock().await;
        let (record, revision) = self
            .session
            .read(|s| (s.record().clone(), s.revision()))
            .await;

        if let (Some(id), Some(saved)) = (state.id, state.last_saved_revision) {
            if saved == revision {
                return SaveOutcome::Unchanged(id);
            }
        }

        self.status.send_replace(DraftStatus::Saving);
        let result = match state.id {
            None => self.store.create(&record).await.map(|id| (id, true)),
            Some(id) => self.store.update(id, &record).await.map(|()| (id, false)),
        };

        match result {
            Ok((id, created)) => {
                if created {
                    state.id = Some(id);
                    self.session.adopt_record_id(id).await;
                    info!(record_id = %id, revision, "draft created");
                } else {
                    debug!(record_id = %id, revision, "draft updated");
                }
                state.last_saved_revision = Some(revision);
                self.status.send_replace(DraftStatus::Saved {
                    record_id: id,
                    revision,
                    at: Utc::now(),
                });
                if created {
                    SaveOutcome::Created(id)
                } else {
                    SaveOutcome::Updated(id)
                }
            }
            Err(err) => {
                warn!(record_id = ?state.id, revision, error = %err, "draft save failed; next trigger retries");
                let message = err.to_string();
                self.status.send_replace(DraftStatus::Error {
                    message: message.clone(),
                });
                SaveOutcome::Failed(message)
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AutosaveConfig {
    /// Quiet period after the last edit before a save fires.
    pub debounce: Duration,
    /// Upper bound on staleness under continuous editing.
    pub interval: Duration,
}

impl Default for AutosaveConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(1500),
            interval: Duration::from_secs(30),
        }
    }
}

/// Smallest period the interval trigger will tick at.
const MIN_AUTOSAVE_INTERVAL: Duration = Duration::from_millis(10);

/// Drives `saver` from two triggers until `shutdown` fires, then flushes once.
pub fn spawn_autosave(
    saver: Arc<DraftSaver>,
    config: AutosaveConfig,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let period = config.interval.max(MIN_AUTOSAVE_INTERVAL);
    tokio::spawn(async move {
        let mut revisions = saver.session().subscribe();
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut debounce_at: Option<Instant> = None;

        loop {
            let pending_debounce = debounce_at;
            let debounce = async move {
                match pending_debounce {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = shutdown.cancelled() => {
                    saver.save().await;
                    debug!("autosave stopped");
                    break;
                }
                changed = revisions.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    debounce_at = Some(Instant::now() + config.debounce);
                }
                _ = debounce => {
                    debounce_at = None;
                    saver.save().await;
                }
                _ = interval.tick() => {
                    saver.save().await;
                }
            }
        }
    })
}

/// Keeps the listing file at `path` in step with the session: record, draft id
/// and every target profile. Writes after `debounce` of quiet and once more
/// when `shutdown` fires.
pub fn spawn_listing_writer(
    session: SharedSession,
    path: PathBuf,
    debounce: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut changes = session.subscribe_changes();
        let mut written = *changes.borrow_and_update();
        let mut debounce_at: Option<Instant> = None;

        loop {
            let pending_debounce = debounce_at;
            let debounce_elapsed = async move {
                match pending_debounce {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = changes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    debounce_at = Some(Instant::now() + debounce);
                }
                _ = debounce_elapsed => {
                    debounce_at = None;
                    written = write_listing(&session, &path, written).await;
                }
            }
        }
        write_listing(&session, &path, written).await;
        debug!(path = %path.display(), "listing writer stopped");
    })
}

/// Returns the generation now on disk.
async fn write_listing(session: &SharedSession, path: &Path, written: u64) -> u64 {
    let generation = session.generation();
    if generation == written {
        return written;
    }
    let document = session.read(ListingDocument::from_session).await;
    match document.save(path).await {
        Ok(()) => {
            debug!(path = %path.display(), generation, "listing written");
            generation
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err, "listing write failed");
            written
        }
    }
}

/// Saves pending edits and returns the record id publishing can rely on.
/// A failed save is tolerated when an earlier save already produced an id.
pub async fn ensure_persisted(saver: &DraftSaver) -> Result<Uuid, PublishError> {
    match saver.save().await {
        SaveOutcome::Created(id) | SaveOutcome::Updated(id) | SaveOutcome::Unchanged(id) => Ok(id),
        SaveOutcome::Failed(message) => match saver.id().await {
            Some(id) => {
                warn!(record_id = %id, error = %message, "publishing last saved draft");
                Ok(id)
            }
            None => Err(PublishError::NotPersisted(message)),
        },
    }
}
