//! Axum JSON API over the editing session, draft autosave and publish runs.

use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Multipart, Path as AxumPath, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::{delete, get, patch, post},
    Json, Router,
};
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use synd_core::{
    CanonicalRecord, MediaError, MediaRef, ProfileError, ProfilePatch, RecordPatch, ResolvedProfile,
    TargetChannel, TargetProfile, ValidationResult,
};
use synd_publish::{
    ensure_persisted, spawn_autosave, spawn_listing_writer, write_run_report, DraftSaver,
    DraftStatus, ListingDocument, PublishConfig, PublishError, PublishEvent, PublishOrchestrator,
    PublishRequest, SharedSession,
};
use synd_storage::{upload_batch, MediaUploader, UploadFile};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Mutex};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "synd-web";

pub struct AppState {
    pub session: SharedSession,
    pub saver: Arc<DraftSaver>,
    pub orchestrator: PublishOrchestrator,
    uploader: Arc<dyn MediaUploader>,
    reports_dir: Option<PathBuf>,
    events: broadcast::Sender<PublishEvent>,
    current_run: Mutex<Option<CancellationToken>>,
}

impl AppState {
    pub fn new(
        session: SharedSession,
        saver: Arc<DraftSaver>,
        orchestrator: PublishOrchestrator,
        uploader: Arc<dyn MediaUploader>,
    ) -> Self {
        let (events, _rx) = broadcast::channel(256);
        Self {
            session,
            saver,
            orchestrator,
            uploader,
            reports_dir: None,
            events,
            current_run: Mutex::new(None),
        }
    }

    /// Finished runs are written under `dir`.
    pub fn with_reports_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.reports_dir = Some(dir.into());
        self
    }
}

#[derive(Debug)]
enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Precondition(String),
    Unprocessable(String),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            Self::NotFound(m) => (StatusCode::NOT_FOUND, m),
            Self::Conflict(m) => (StatusCode::CONFLICT, m),
            Self::Precondition(m) => (StatusCode::PRECONDITION_FAILED, m),
            Self::Unprocessable(m) => (StatusCode::UNPROCESSABLE_ENTITY, m),
            Self::Internal(err) => {
                error!(error = %err, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, format!("server error: {err}"))
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<ProfileError> for ApiError {
    fn from(err: ProfileError) -> Self {
        match err {
            ProfileError::UnknownTarget(_) | ProfileError::NotSelected(_) => {
                Self::NotFound(err.to_string())
            }
            ProfileError::Media(_) => Self::Unprocessable(err.to_string()),
        }
    }
}

impl From<MediaError> for ApiError {
    fn from(err: MediaError) -> Self {
        Self::Unprocessable(err.to_string())
    }
}

impl From<PublishError> for ApiError {
    fn from(err: PublishError) -> Self {
        match err {
            PublishError::NotPersisted(_) => Self::Precondition(err.to_string()),
            PublishError::RunInProgress => Self::Conflict(err.to_string()),
            PublishError::Aborted(_) => Self::Internal(err.into()),
        }
    }
}

#[derive(Debug, Serialize)]
struct TargetView {
    id: String,
    display_name: String,
    connected: bool,
    channel: TargetChannel,
    selected: bool,
}

#[derive(Debug, Serialize)]
struct SessionView {
    revision: u64,
    record: CanonicalRecord,
    profiles: Vec<TargetProfile>,
    targets: Vec<TargetView>,
}

#[derive(Debug, Serialize)]
struct ResolvedView {
    resolved: ResolvedProfile,
    validation: ValidationResult,
}

#[derive(Debug, Serialize)]
struct UploadResult {
    name: String,
    media_ref: Option<MediaRef>,
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct UploadResponse {
    /// Positions the successful uploads were appended at.
    appended: Vec<usize>,
    results: Vec<UploadResult>,
}

#[derive(Debug, Deserialize)]
struct ReorderBody {
    from: usize,
    to: usize,
}

#[derive(Debug, Deserialize)]
struct CoverBody {
    index: usize,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PublishBody {
    /// Re-run only these targets; all selected targets when absent.
    targets: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
struct PublishStarted {
    run_id: Uuid,
    record_id: Uuid,
    targets: Vec<String>,
}

#[derive(Debug, Serialize)]
struct DraftStatusView {
    status: DraftStatus,
    record_id: Option<Uuid>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/session", get(session_handler))
        .route("/record", patch(record_handler))
        .route("/media", post(upload_media_handler))
        .route("/media/reorder", post(reorder_media_handler))
        .route("/media/{index}", delete(remove_media_handler))
        .route("/targets/{id}/select", post(select_target_handler))
        .route("/targets/{id}", delete(deselect_target_handler))
        .route("/targets/{id}/profile", patch(update_profile_handler))
        .route("/targets/{id}/resolved", get(resolved_handler))
        .route("/targets/{id}/cover", post(cover_handler))
        .route("/publish", post(publish_handler))
        .route("/publish/cancel", post(cancel_publish_handler))
        .route("/publish/stream", get(publish_stream_handler))
        .route("/draft/status", get(draft_status_handler))
        .with_state(Arc::new(state))
}

/// Loads targets and the listing file, starts autosave and the listing writer,
/// and serves until ctrl-c. Both flush before returning: the draft first, so the
/// written listing carries its id.
pub async fn serve(config: PublishConfig, listing: Option<&Path>, live: bool) -> anyhow::Result<()> {
    let registry = config.load_registry()?;
    let listing_path = listing
        .map(Path::to_path_buf)
        .unwrap_or_else(|| config.default_listing_path());
    let document = if listing_path.exists() {
        ListingDocument::load(&listing_path)?
    } else {
        info!(path = %listing_path.display(), "starting a new listing");
        ListingDocument::default()
    };
    let session = SharedSession::new(document.into_session(registry.catalog().clone())?);
    let store = config.open_record_store().await?;
    let saver = Arc::new(DraftSaver::new(session.clone(), store).await);

    let autosave_config = config.autosave();
    let autosave_stop = CancellationToken::new();
    let autosave = spawn_autosave(saver.clone(), autosave_config, autosave_stop.clone());
    let writer_stop = CancellationToken::new();
    let writer = spawn_listing_writer(
        session.clone(),
        listing_path.clone(),
        autosave_config.debounce,
        writer_stop.clone(),
    );

    let client = config.target_client(registry, live)?;
    let orchestrator = PublishOrchestrator::new(client, config.publish_options());
    let state = AppState::new(session, saver, orchestrator, Arc::new(config.media_store()))
        .with_reports_dir(config.reports_dir.clone());

    let listener = TcpListener::bind(("0.0.0.0", config.web_port))
        .await
        .with_context(|| format!("binding port {}", config.web_port))?;
    info!(port = config.web_port, live, listing = %listing_path.display(), "synd web listening");

    let served = axum::serve(listener, app(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("serving http");

    autosave_stop.cancel();
    autosave.await.context("joining autosave task")?;
    writer_stop.cancel();
    writer.await.context("joining listing writer")?;
    served
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "service": CRATE_NAME,
        "publishing": state.orchestrator.is_running(),
    }))
}

async fn session_view(state: &AppState) -> SessionView {
    state
        .session
        .read(|s| SessionView {
            revision: s.revision(),
            record: s.record().clone(),
            profiles: s.profiles().iter().cloned().collect(),
            targets: s
                .catalog()
                .iter()
                .map(|t| TargetView {
                    id: t.id.clone(),
                    display_name: t.display_name.clone(),
                    connected: t.connected,
                    channel: t.channel,
                    selected: s.profiles().get(&t.id).is_some(),
                })
                .collect(),
        })
        .await
}

async fn session_handler(State(state): State<Arc<AppState>>) -> Json<SessionView> {
    Json(session_view(&state).await)
}

async fn record_handler(
    State(state): State<Arc<AppState>>,
    Json(patch): Json<RecordPatch>,
) -> Json<SessionView> {
    state.session.edit(|s| s.edit_record(patch)).await;
    Json(session_view(&state).await)
}

async fn upload_media_handler(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    let mut files = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?
    {
        let name = field
            .file_name()
            .or(field.name())
            .unwrap_or("upload")
            .to_string();
        let extension = Path::new(&name)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("bin")
            .to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::BadRequest(e.to_string()))?;
        files.push(UploadFile {
            name,
            extension,
            bytes: bytes.to_vec(),
        });
    }

    let outcomes = upload_batch(state.uploader.as_ref(), files).await;
    let refs = outcomes
        .iter()
        .filter_map(|o| o.result.as_ref().ok().cloned())
        .collect::<Vec<_>>();
    let appended = state.session.edit(|s| s.append_media(refs)).await;

    let results = outcomes
        .into_iter()
        .map(|o| match o.result {
            Ok(media_ref) => UploadResult {
                name: o.name,
                media_ref: Some(media_ref),
                error: None,
            },
            Err(err) => UploadResult {
                name: o.name,
                media_ref: None,
                error: Some(err.to_string()),
            },
        })
        .collect();
    Ok(Json(UploadResponse {
        appended: appended.collect(),
        results,
    }))
}

async fn reorder_media_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ReorderBody>,
) -> Result<Json<SessionView>, ApiError> {
    state
        .session
        .edit(|s| s.reorder_media(body.from, body.to))
        .await?;
    Ok(Json(session_view(&state).await))
}

async fn remove_media_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(index): AxumPath<usize>,
) -> Result<Json<SessionView>, ApiError> {
    let removed = state.session.edit(|s| s.remove_media(index)).await?;
    info!(index, media = %removed, "media removed");
    Ok(Json(session_view(&state).await))
}

async fn select_target_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Result<Json<TargetProfile>, ApiError> {
    let profile = state
        .session
        .edit(|s| s.select_target(&id).cloned())
        .await?;
    Ok(Json(profile))
}

async fn deselect_target_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Result<StatusCode, ApiError> {
    if state.session.edit(|s| s.deselect_target(&id)).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ProfileError::NotSelected(id).into())
    }
}

async fn update_profile_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
    Json(patch): Json<ProfilePatch>,
) -> Result<Json<TargetProfile>, ApiError> {
    let profile = state
        .session
        .edit(|s| s.update_profile(&id, patch).cloned())
        .await?;
    Ok(Json(profile))
}

async fn resolved_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Result<Json<ResolvedView>, ApiError> {
    let view = state
        .session
        .read(|s| {
            let resolved = s.resolved_view(&id)?;
            let validation = s
                .profiles()
                .get(&id)
                .map(|p| p.validation().clone())
                .unwrap_or_default();
            Ok::<_, ProfileError>(ResolvedView {
                resolved,
                validation,
            })
        })
        .await?;
    Ok(Json(view))
}

async fn cover_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
    Json(body): Json<CoverBody>,
) -> Result<Json<TargetProfile>, ApiError> {
    let profile = state
        .session
        .edit(|s| s.set_cover(&id, body.index).cloned())
        .await?;
    Ok(Json(profile))
}

async fn publish_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<PublishBody>,
) -> Result<(StatusCode, Json<PublishStarted>), ApiError> {
    if state.orchestrator.is_running() {
        return Err(PublishError::RunInProgress.into());
    }
    let record_id = ensure_persisted(&state.saver).await?;
    let request = state
        .session
        .read(|s| PublishRequest::from_session(s, body.targets.as_deref()))
        .await?;
    let targets = request.target_ids();
    let mut run = state.orchestrator.start(request)?;
    let run_id = run.run_id;
    *state.current_run.lock().await = Some(run.cancel_token());

    let events = state.events.clone();
    let reports_dir = state.reports_dir.clone();
    tokio::spawn(async move {
        while let Some(event) = run.events.recv().await {
            if let (PublishEvent::Finished(summary), Some(dir)) = (&event, &reports_dir) {
                if let Err(err) = write_run_report(dir, summary).await {
                    warn!(%run_id, error = %err, "could not write publish report");
                }
            }
            let _ = events.send(event);
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(PublishStarted {
            run_id,
            record_id,
            targets,
        }),
    ))
}

async fn cancel_publish_handler(State(state): State<Arc<AppState>>) -> Result<StatusCode, ApiError> {
    let current = state.current_run.lock().await.clone();
    match current {
        Some(token) if state.orchestrator.is_running() => {
            token.cancel();
            Ok(StatusCode::ACCEPTED)
        }
        _ => Err(ApiError::NotFound("no publish run in progress".to_string())),
    }
}

async fn publish_stream_handler(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.events.subscribe();
    let connected =
        stream::once(async { Ok::<_, Infallible>(Event::default().event("connected").data("ok")) });

    let events = BroadcastStream::new(rx).filter_map(|result| async move {
        match result {
            Ok(event) => {
                let name = match &event {
                    PublishEvent::Attempt(_) => "attempt",
                    PublishEvent::Finished(_) => "finished",
                };
                Event::default().event(name).json_data(&event).ok().map(Ok)
            }
            Err(BroadcastStreamRecvError::Lagged(n)) => Event::default()
                .event("lagged")
                .json_data(serde_json::json!({ "missed": n }))
                .ok()
                .map(Ok),
        }
    });

    Sse::new(connected.chain(events)).keep_alive(KeepAlive::default())
}

async fn draft_status_handler(State(state): State<Arc<AppState>>) -> Json<DraftStatusView> {
    Json(DraftStatusView {
        status: state.saver.status(),
        record_id: state.saver.id().await,
    })
}
