//! Draft persistence and publish orchestration over a shared editing session.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use synd_core::{CanonicalRecord, ListingSession, TargetCatalog, TargetProfile};
use synd_storage::{ArtifactMediaStore, JsonFileRecordStore, PgRecordStore, RecordStore};
use synd_targets::{
    AdapterTargetClient, HttpClientConfig, HttpTransport, OutboxTargetClient, TargetClient,
    TargetRateLimit, TargetRegistry,
};
use tracing::info;
use uuid::Uuid;

mod draft;
mod orchestrator;
mod reports;
mod session;

pub use draft::{
    ensure_persisted, spawn_autosave, spawn_listing_writer, AutosaveConfig, DraftSaver,
    DraftStatus, SaveOutcome,
};
pub use orchestrator::{
    PublishAttempt, PublishError, PublishEvent, PublishItem, PublishOptions, PublishOrchestrator,
    PublishRequest, PublishRun, PublishStatus, PublishSummary,
};
pub use reports::{report_recent_runs_markdown, write_run_report, ReportManifest, ReportManifestFile};
pub use session::SharedSession;

#[derive(Debug, Clone)]
pub struct PublishConfig {
    pub database_url: Option<String>,
    pub drafts_dir: PathBuf,
    pub targets_file: PathBuf,
    pub media_dir: PathBuf,
    pub media_base_url: String,
    pub outbox_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub autosave_debounce_ms: u64,
    pub autosave_interval_secs: u64,
    pub publish_concurrency: usize,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub http_global_concurrency: usize,
    pub http_per_target_concurrency: usize,
    /// Requests a target may receive back to back; unset disables pacing.
    pub target_rate_burst: Option<u32>,
    pub target_rate_interval_ms: u64,
    pub web_port: u16,
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parsed<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl PublishConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|v| !v.trim().is_empty()),
            drafts_dir: PathBuf::from(env_or("SYND_DRAFTS_DIR", "./drafts")),
            targets_file: PathBuf::from(env_or("SYND_TARGETS_FILE", "./targets.yaml")),
            media_dir: PathBuf::from(env_or("SYND_MEDIA_DIR", "./media")),
            media_base_url: env_or("SYND_MEDIA_BASE_URL", "file://media"),
            outbox_dir: PathBuf::from(env_or("SYND_OUTBOX_DIR", "./outbox")),
            reports_dir: PathBuf::from(env_or("SYND_REPORTS_DIR", "./reports")),
            autosave_debounce_ms: env_parsed("SYND_AUTOSAVE_DEBOUNCE_MS", 1500),
            autosave_interval_secs: env_parsed("SYND_AUTOSAVE_INTERVAL_SECS", 30),
            publish_concurrency: env_parsed("SYND_PUBLISH_CONCURRENCY", 1usize).max(1),
            user_agent: env_or("SYND_USER_AGENT", "synd-bot/0.1"),
            http_timeout_secs: env_parsed("SYND_HTTP_TIMEOUT_SECS", 20),
            http_global_concurrency: env_parsed("SYND_HTTP_GLOBAL_CONCURRENCY", 8usize).max(1),
            http_per_target_concurrency: env_parsed("SYND_HTTP_PER_TARGET_CONCURRENCY", 1usize)
                .max(1),
            target_rate_burst: std::env::var("SYND_TARGET_RATE_BURST")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|burst: &u32| *burst > 0),
            target_rate_interval_ms: env_parsed("SYND_TARGET_RATE_INTERVAL_MS", 1000),
            web_port: env_parsed("SYND_WEB_PORT", 8000),
        }
    }

    pub fn autosave(&self) -> AutosaveConfig {
        AutosaveConfig {
            debounce: Duration::from_millis(self.autosave_debounce_ms),
            interval: Duration::from_secs(self.autosave_interval_secs.max(1)),
        }
    }

    pub fn publish_options(&self) -> PublishOptions {
        PublishOptions {
            concurrency: self.publish_concurrency,
            ..Default::default()
        }
    }

    pub fn http_client(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            global_concurrency: self.http_global_concurrency,
            per_target_concurrency: self.http_per_target_concurrency,
            rate_limit: self.target_rate_burst.map(|burst| TargetRateLimit {
                burst,
                interval: Duration::from_millis(self.target_rate_interval_ms),
            }),
            ..Default::default()
        }
    }

    /// Where `serve` keeps the listing when no file was named.
    pub fn default_listing_path(&self) -> PathBuf {
        self.drafts_dir.join("listing.yaml")
    }

    pub fn load_registry(&self) -> Result<TargetRegistry> {
        TargetRegistry::load(&self.targets_file)
    }

    pub fn media_store(&self) -> ArtifactMediaStore {
        ArtifactMediaStore::new(self.media_dir.clone(), self.media_base_url.clone())
    }

    /// Postgres when `DATABASE_URL` is set, JSON files under `drafts_dir` otherwise.
    pub async fn open_record_store(&self) -> Result<Arc<dyn RecordStore>> {
        match &self.database_url {
            Some(url) => {
                let store = PgRecordStore::connect(url)
                    .await
                    .context("connecting to postgres record store")?;
                info!("using postgres record store");
                Ok(Arc::new(store))
            }
            None => {
                info!(dir = %self.drafts_dir.display(), "using json file record store");
                Ok(Arc::new(JsonFileRecordStore::new(self.drafts_dir.clone())))
            }
        }
    }

    /// `live` sends over HTTP; otherwise payloads land in the outbox directory.
    pub fn target_client(&self, registry: TargetRegistry, live: bool) -> Result<Arc<dyn TargetClient>> {
        if live {
            let http = HttpTransport::new(self.http_client())?;
            Ok(Arc::new(AdapterTargetClient::new(registry, http)))
        } else {
            Ok(Arc::new(OutboxTargetClient::new(registry, self.outbox_dir.clone())))
        }
    }
}

/// A listing on disk: the canonical record plus the profiles chosen for it.
/// YAML or JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListingDocument {
    pub record: CanonicalRecord,
    #[serde(default)]
    pub profiles: Vec<TargetProfile>,
}

impl ListingDocument {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing listing {}", path.display()))
    }

    /// Writes a sibling temp file and renames it over `path`, so an interrupted
    /// save leaves the previous listing intact.
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let text = serde_yaml::to_string(self).context("serializing listing")?;
        let parent = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        tokio::fs::write(&temp_path, text)
            .await
            .with_context(|| format!("writing {}", temp_path.display()))?;
        if let Err(err) = tokio::fs::rename(&temp_path, path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(err)
                .with_context(|| format!("renaming {} -> {}", temp_path.display(), path.display()));
        }
        Ok(())
    }

    pub fn from_session(session: &ListingSession) -> Self {
        Self {
            record: session.record().clone(),
            profiles: session.profiles().iter().cloned().collect(),
        }
    }

    pub fn into_session(self, catalog: TargetCatalog) -> Result<ListingSession> {
        ListingSession::restore(self.record, catalog, self.profiles)
            .context("restoring listing profiles")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use synd_core::{Target, TargetChannel};

    #[tokio::test]
    async fn listing_document_restores_profiles_against_catalog() {
        let yaml = r#"
record:
  title: Harbour loft
  media: ["https://cdn/a.jpg", "https://cdn/b.jpg"]
profiles:
  - target_id: harbour-feed
    selected_media: [1]
"#;
        let doc: ListingDocument = serde_yaml::from_str(yaml).unwrap();
        let catalog = TargetCatalog::new(vec![Target {
            id: "harbour-feed".into(),
            display_name: "Harbour Feed".into(),
            connected: true,
            channel: TargetChannel::Feed,
            country: None,
            locale: None,
            endpoint: None,
            account_ref: None,
            requirements: Vec::new(),
        }])
        .unwrap();
        let session = doc.into_session(catalog).unwrap();
        let profile = session.profiles().get("harbour-feed").unwrap();
        assert_eq!(profile.selected_media(), &[1]);

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("listing.yaml");
        ListingDocument::from_session(&session).save(&path).await.unwrap();
        let reloaded = ListingDocument::load(&path).unwrap();
        assert_eq!(reloaded.profiles.len(), 1);
        assert_eq!(reloaded.profiles[0].selected_media(), &[1]);
        assert_eq!(reloaded.record.title.as_deref(), Some("Harbour loft"));
    }

    #[test]
    fn listing_document_rejects_dangling_media_indices() {
        let yaml = "record:\n  media: [\"https://cdn/a.jpg\"]\nprofiles:\n  - target_id: x\n    selected_media: [3]\n";
        let doc: ListingDocument = serde_yaml::from_str(yaml).unwrap();
        let catalog = TargetCatalog::new(vec![Target {
            id: "x".into(),
            display_name: "X".into(),
            connected: true,
            channel: TargetChannel::Portal,
            country: None,
            locale: None,
            endpoint: None,
            account_ref: None,
            requirements: Vec::new(),
        }])
        .unwrap();
        assert!(doc.into_session(catalog).is_err());
    }

    #[tokio::test]
    async fn saving_a_listing_replaces_it_without_leaving_temp_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("listing.yaml");
        std::fs::write(&path, "record:\n  title: Old title\n").unwrap();

        let doc = ListingDocument {
            record: CanonicalRecord {
                title: Some("New title".into()),
                ..Default::default()
            },
            profiles: Vec::new(),
        };
        doc.save(&path).await.unwrap();

        let reloaded = ListingDocument::load(&path).unwrap();
        assert_eq!(reloaded.record.title.as_deref(), Some("New title"));
        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["listing.yaml"]);
    }

    #[tokio::test]
    async fn failed_rename_keeps_the_previous_listing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("listing.yaml");
        std::fs::create_dir(&target).unwrap();
        std::fs::write(target.join("keep"), "x").unwrap();

        assert!(ListingDocument::default().save(&target).await.is_err());
        assert!(target.join("keep").exists());
        let leftovers = std::fs::read_dir(dir.path())
            .unwrap()
            .filter(|e| e.as_ref().unwrap().file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn http_settings_flow_into_the_transport_config() {
        let config = PublishConfig {
            http_global_concurrency: 4,
            http_per_target_concurrency: 2,
            target_rate_burst: Some(3),
            target_rate_interval_ms: 250,
            ..test_config()
        };
        let http = config.http_client();
        assert_eq!(http.global_concurrency, 4);
        assert_eq!(http.per_target_concurrency, 2);
        assert_eq!(
            http.rate_limit,
            Some(TargetRateLimit {
                burst: 3,
                interval: Duration::from_millis(250),
            })
        );
        assert_eq!(http.user_agent.as_deref(), Some("synd-test"));

        let unpaced = PublishConfig {
            target_rate_burst: None,
            ..config
        };
        assert!(unpaced.http_client().rate_limit.is_none());
    }

    #[test]
    fn zero_autosave_interval_is_clamped() {
        let config = PublishConfig {
            autosave_interval_secs: 0,
            ..test_config()
        };
        assert_eq!(config.autosave().interval, Duration::from_secs(1));
    }

    fn test_config() -> PublishConfig {
        PublishConfig {
            database_url: None,
            drafts_dir: PathBuf::from("drafts"),
            targets_file: PathBuf::from("targets.yaml"),
            media_dir: PathBuf::from("media"),
            media_base_url: "file://media".into(),
            outbox_dir: PathBuf::from("outbox"),
            reports_dir: PathBuf::from("reports"),
            autosave_debounce_ms: 1500,
            autosave_interval_secs: 30,
            publish_concurrency: 1,
            user_agent: "synd-test".into(),
            http_timeout_secs: 20,
            http_global_concurrency: 8,
            http_per_target_concurrency: 1,
            target_rate_burst: None,
            target_rate_interval_ms: 1000,
            web_port: 8000,
        }
    }
}
