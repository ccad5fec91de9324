//! Best-effort fan-out of one listing to its selected targets.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use synd_core::{resolve, ListingSession, ResolvedProfile, ValidationResult};
use synd_targets::TargetClient;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

/// Preconditions that stop a run before any target is attempted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    #[error("record has not been persisted: {0}")]
    NotPersisted(String),
    #[error("a publish run is already in progress")]
    RunInProgress,
    #[error("publish run {0} stopped unexpectedly")]
    Aborted(Uuid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishStatus {
    Pending,
    Publishing,
    Success,
    Error,
    Cancelled,
}

impl PublishStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Error | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Publishing => "publishing",
            Self::Success => "success",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishAttempt {
    pub target_id: String,
    pub status: PublishStatus,
    #[serde(default)]
    pub message: Option<String>,
}

impl PublishAttempt {
    fn new(target_id: &str, status: PublishStatus, message: Option<String>) -> Self {
        Self {
            target_id: target_id.to_string(),
            status,
            message,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishSummary {
    pub run_id: Uuid,
    pub record_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// One terminal attempt per target, in selection order.
    pub attempts: Vec<PublishAttempt>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PublishEvent {
    Attempt(PublishAttempt),
    Finished(PublishSummary),
}

/// One target's share of a run, frozen when the run is requested.
#[derive(Debug, Clone)]
pub struct PublishItem {
    pub target_id: String,
    pub connected: bool,
    pub account_ref: Option<String>,
    pub payload: ResolvedProfile,
    pub validation: ValidationResult,
    /// Set when the target cannot be attempted at all (unknown or not selected).
    pub unavailable: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub record_id: Uuid,
    pub items: Vec<PublishItem>,
}

impl PublishRequest {
    /// Freezes the session's selected targets (or `subset` of them) into a request.
    /// Subset ids that are unknown or not selected still get an item, which the
    /// run reports as an error.
    pub fn from_session(
        session: &ListingSession,
        subset: Option<&[String]>,
    ) -> Result<Self, PublishError> {
        let record = session.record();
        let record_id = record
            .id
            .ok_or_else(|| PublishError::NotPersisted("record has no id".to_string()))?;

        let selected = session.selected_target_ids();
        let target_ids: Vec<String> = match subset {
            None => selected.clone(),
            Some(subset) => {
                let mut ids: Vec<String> = selected
                    .iter()
                    .filter(|id| subset.contains(*id))
                    .cloned()
                    .collect();
                for id in subset {
                    if !ids.contains(id) {
                        ids.push(id.clone());
                    }
                }
                ids
            }
        };

        let items = target_ids
            .into_iter()
            .map(|target_id| {
                let target = session.catalog().get(&target_id);
                let profile = session.profiles().get(&target_id);
                match (target, profile) {
                    (Some(target), Some(profile)) => PublishItem {
                        target_id,
                        connected: target.connected,
                        account_ref: target.account_ref.clone(),
                        payload: resolve(record, profile),
                        validation: profile.validation().clone(),
                        unavailable: None,
                    },
                    (target, _) => {
                        let reason = match target {
                            None => format!("unknown target {target_id}"),
                            Some(_) => format!("target {target_id} is not selected"),
                        };
                        PublishItem {
                            target_id,
                            connected: false,
                            account_ref: None,
                            payload: ResolvedProfile::default(),
                            validation: ValidationResult::default(),
                            unavailable: Some(reason),
                        }
                    }
                }
            })
            .collect();

        Ok(Self { record_id, items })
    }

    pub fn target_ids(&self) -> Vec<String> {
        self.items.iter().map(|i| i.target_id.clone()).collect()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PublishOptions {
    /// Attempts in flight at once. 1 is strictly sequential.
    pub concurrency: usize,
    /// Record an error instead of calling the target when its profile is invalid.
    pub skip_invalid: bool,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            skip_invalid: true,
        }
    }
}

/// Handle to a run in progress. Pending events arrive in selection order, each
/// terminal event as soon as its target finishes, and the stream ends with
/// [`PublishEvent::Finished`].
#[derive(Debug)]
pub struct PublishRun {
    pub run_id: Uuid,
    pub events: mpsc::UnboundedReceiver<PublishEvent>,
    cancel: CancellationToken,
    handle: JoinHandle<PublishSummary>,
}

impl PublishRun {
    /// Stops the run between attempts; an attempt already in flight finishes.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn wait(self) -> Result<PublishSummary, PublishError> {
        let run_id = self.run_id;
        self.handle.await.map_err(|err| {
            warn!(%run_id, error = %err, "publish task failed");
            PublishError::Aborted(run_id)
        })
    }
}

struct ActiveRun(Arc<AtomicBool>);

impl ActiveRun {
    fn acquire(flag: &Arc<AtomicBool>) -> Result<Self, PublishError> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| PublishError::RunInProgress)?;
        Ok(Self(flag.clone()))
    }
}

impl Drop for ActiveRun {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Clone)]
pub struct PublishOrchestrator {
    client: Arc<dyn TargetClient>,
    options: PublishOptions,
    active: Arc<AtomicBool>,
}

impl std::fmt::Debug for PublishOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublishOrchestrator")
            .field("options", &self.options)
            .field("active", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl PublishOrchestrator {
    pub fn new(client: Arc<dyn TargetClient>, options: PublishOptions) -> Self {
        Self {
            client,
            options,
            active: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Spawns the run and returns immediately. Only one run per orchestrator
    /// may be active.
    pub fn start(&self, request: PublishRequest) -> Result<PublishRun, PublishError> {
        let guard = ActiveRun::acquire(&self.active)?;
        let run_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let client = self.client.clone();
        let options = self.options;
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            execute(client, options, run_id, request, tx, token).await
        });
        Ok(PublishRun {
            run_id,
            events: rx,
            cancel,
            handle,
        })
    }

    /// Runs to completion and returns the summary.
    pub async fn run(&self, request: PublishRequest) -> Result<PublishSummary, PublishError> {
        let _guard = ActiveRun::acquire(&self.active)?;
        let (tx, _rx) = mpsc::unbounded_channel();
        Ok(execute(
            self.client.clone(),
            self.options,
            Uuid::new_v4(),
            request,
            tx,
            CancellationToken::new(),
        )
        .await)
    }
}

fn precheck(item: &PublishItem, options: PublishOptions) -> Option<String> {
    if let Some(reason) = &item.unavailable {
        return Some(reason.clone());
    }
    if !item.connected {
        return Some(format!("target {} is not connected", item.target_id));
    }
    if item.account_ref.as_deref().map_or(true, |a| a.trim().is_empty()) {
        return Some(format!("no account reference configured for {}", item.target_id));
    }
    if options.skip_invalid && !item.validation.is_valid {
        return Some(format!("not ready: {}", item.validation.errors.join("; ")));
    }
    None
}

async fn attempt(
    client: &dyn TargetClient,
    item: &PublishItem,
    options: PublishOptions,
    cancel: &CancellationToken,
    tx: &mpsc::UnboundedSender<PublishEvent>,
) -> PublishAttempt {
    if cancel.is_cancelled() {
        return PublishAttempt::new(&item.target_id, PublishStatus::Cancelled, None);
    }
    if let Some(reason) = precheck(item, options) {
        warn!(target_id = %item.target_id, %reason, "target skipped");
        return PublishAttempt::new(&item.target_id, PublishStatus::Error, Some(reason));
    }

    let _ = tx.send(PublishEvent::Attempt(PublishAttempt::new(
        &item.target_id,
        PublishStatus::Publishing,
        None,
    )));
    match client.publish(&item.target_id, &item.payload).await {
        Ok(receipt) => {
            info!(external_id = ?receipt.external_id, "target accepted listing");
            PublishAttempt::new(&item.target_id, PublishStatus::Success, Some(receipt.message))
        }
        Err(err) => {
            warn!(error = %err, "target publish failed");
            PublishAttempt::new(&item.target_id, PublishStatus::Error, Some(err.to_string()))
        }
    }
}

async fn execute(
    client: Arc<dyn TargetClient>,
    options: PublishOptions,
    run_id: Uuid,
    request: PublishRequest,
    tx: mpsc::UnboundedSender<PublishEvent>,
    cancel: CancellationToken,
) -> PublishSummary {
    let started_at = Utc::now();
    info!(%run_id, record_id = %request.record_id, targets = request.items.len(), "publish run started");

    for item in &request.items {
        let _ = tx.send(PublishEvent::Attempt(PublishAttempt::new(
            &item.target_id,
            PublishStatus::Pending,
            None,
        )));
    }

    let record_id = request.record_id;
    let mut outcomes = stream::iter(request.items.into_iter().enumerate())
        .map(|(position, item)| {
            let client = client.clone();
            let cancel = cancel.clone();
            let tx = tx.clone();
            async move {
                let span = info_span!("publish_attempt", %run_id, target_id = %item.target_id);
                let outcome = attempt(client.as_ref(), &item, options, &cancel, &tx)
                    .instrument(span)
                    .await;
                (position, outcome)
            }
        })
        .buffer_unordered(options.concurrency.max(1));

    let mut finished = Vec::new();
    while let Some((position, outcome)) = outcomes.next().await {
        let _ = tx.send(PublishEvent::Attempt(outcome.clone()));
        finished.push((position, outcome));
    }
    finished.sort_by_key(|(position, _)| *position);
    let attempts: Vec<PublishAttempt> = finished.into_iter().map(|(_, a)| a).collect();

    let count = |status: PublishStatus| attempts.iter().filter(|a| a.status == status).count();
    let summary = PublishSummary {
        run_id,
        record_id,
        started_at,
        finished_at: Utc::now(),
        succeeded: count(PublishStatus::Success),
        failed: count(PublishStatus::Error),
        cancelled: count(PublishStatus::Cancelled),
        attempts,
    };
    info!(
        %run_id,
        succeeded = summary.succeeded,
        failed = summary.failed,
        cancelled = summary.cancelled,
        "publish run finished"
    );
    let _ = tx.send(PublishEvent::Finished(summary.clone()));
    summary
}
