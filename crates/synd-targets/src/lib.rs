//! Target registry, the publish capability, and per-channel payload adapters.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use strsim::jaro_winkler;
use synd_core::{ResolvedProfile, Target, TargetCatalog, TargetChannel};
use thiserror::Error;
use tokio::fs;
use tracing::info;
use uuid::Uuid;

mod http;

pub use http::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, HttpClientConfig,
    HttpResponse, HttpTransport, RetryDisposition, TargetRateLimit, TargetRateLimiter,
};

/// Minimum similarity for an unknown id to be suggested as a typo of a known one.
const SUGGESTION_THRESHOLD: f64 = 0.85;

#[derive(Debug, Error)]
pub enum TargetError {
    #[error("unknown target {id}{}", did_you_mean(.suggestion))]
    UnknownTarget {
        id: String,
        suggestion: Option<String>,
    },
    #[error("target {0} has no endpoint configured")]
    NoEndpoint(String),
    #[error("cannot build payload: {0}")]
    Payload(String),
    #[error("target rejected listing: {0}")]
    Rejected(String),
    #[error(transparent)]
    Http(#[from] FetchError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn did_you_mean(suggestion: &Option<String>) -> String {
    suggestion
        .as_ref()
        .map(|s| format!(" (did you mean {s}?)"))
        .unwrap_or_default()
}

/// What a target reported back for an accepted listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReceipt {
    pub message: String,
    #[serde(default)]
    pub external_id: Option<String>,
}

/// Capability to push one resolved listing to one target. Safe to call repeatedly.
#[async_trait]
pub trait TargetClient: Send + Sync {
    async fn publish(
        &self,
        target_id: &str,
        payload: &ResolvedProfile,
    ) -> Result<PublishReceipt, TargetError>;
}

#[derive(Debug, Clone, Deserialize)]
struct TargetRegistryFile {
    targets: Vec<Target>,
}

/// Targets loaded from `targets.yaml`.
#[derive(Debug, Clone, Default)]
pub struct TargetRegistry {
    catalog: TargetCatalog,
}

impl TargetRegistry {
    pub fn new(targets: Vec<Target>) -> Result<Self> {
        Ok(Self {
            catalog: TargetCatalog::new(targets)?,
        })
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let file: TargetRegistryFile = serde_yaml::from_str(text).context("parsing target registry")?;
        Self::new(file.targets)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    pub fn catalog(&self) -> &TargetCatalog {
        &self.catalog
    }

    pub fn find(&self, target_id: &str) -> Result<&Target, TargetError> {
        self.catalog
            .get(target_id)
            .ok_or_else(|| TargetError::UnknownTarget {
                id: target_id.to_string(),
                suggestion: self.closest_id(target_id),
            })
    }

    pub fn closest_id(&self, target_id: &str) -> Option<String> {
        self.catalog
            .iter()
            .map(|t| (jaro_winkler(&t.id, target_id), &t.id))
            .filter(|(score, _)| *score >= SUGGESTION_THRESHOLD)
            .max_by(|a, b| a.0.total_cmp(&b.0))
            .map(|(_, id)| id.clone())
    }
}

/// Maps a resolved listing onto one channel's wire shape.
pub trait TargetAdapter: Send + Sync {
    fn channel(&self) -> TargetChannel;

    fn method(&self) -> Method {
        Method::POST
    }

    /// Path appended to the target's endpoint.
    fn submit_path(&self, profile: &ResolvedProfile) -> String;

    fn build_payload(&self, target: &Target, profile: &ResolvedProfile) -> Result<JsonValue, TargetError>;

    fn parse_receipt(&self, target: &Target, body: &[u8]) -> PublishReceipt {
        default_receipt(target, body)
    }
}

fn default_receipt(target: &Target, body: &[u8]) -> PublishReceipt {
    let value: JsonValue = serde_json::from_slice(body).unwrap_or(JsonValue::Null);
    let external_id = value
        .get("id")
        .and_then(|v| match v {
            JsonValue::String(s) => Some(s.clone()),
            JsonValue::Number(n) => Some(n.to_string()),
            _ => None,
        });
    let message = value
        .get("message")
        .and_then(JsonValue::as_str)
        .map(ToString::to_string)
        .unwrap_or_else(|| format!("published to {}", target.display_name));
    PublishReceipt {
        message,
        external_id,
    }
}

fn require_record_id(profile: &ResolvedProfile) -> Result<Uuid, TargetError> {
    profile
        .record_id
        .ok_or_else(|| TargetError::Payload("listing has not been saved yet".to_string()))
}

fn agent_json(profile: &ResolvedProfile) -> JsonValue {
    profile
        .agent
        .as_ref()
        .map(|a| serde_json::to_value(a).unwrap_or(JsonValue::Null))
        .unwrap_or(JsonValue::Null)
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", text[..idx].trim_end()),
        None => text.to_string(),
    }
}

#[derive(Debug, Clone, Copy)]
struct PortalAdapter;

#[derive(Debug, Clone, Copy)]
struct FeedAdapter;

#[derive(Debug, Clone, Copy)]
struct DirectoryAdapter;

impl TargetAdapter for PortalAdapter {
    fn channel(&self) -> TargetChannel {
        TargetChannel::Portal
    }

    fn submit_path(&self, _profile: &ResolvedProfile) -> String {
        "listings".to_string()
    }

    fn build_payload(&self, target: &Target, profile: &ResolvedProfile) -> Result<JsonValue, TargetError> {
        let record_id = require_record_id(profile)?;
        let photos = profile
            .media
            .iter()
            .enumerate()
            .map(|(position, media)| {
                json!({
                    "url": media.as_str(),
                    "position": position,
                    "cover": position == 0,
                })
            })
            .collect::<Vec<_>>();
        Ok(json!({
            "external_ref": record_id,
            "account": target.account_ref,
            "title": profile.title,
            "description": profile.description,
            "price": {
                "amount": profile.price,
                "currency": profile.currency,
            },
            "location": profile.location,
            "attributes": profile.attributes,
            "permit_number": profile.permit_number,
            "amenities": profile.amenities,
            "features": profile.features,
            "photos": photos,
            "agent": agent_json(profile),
        }))
    }
}

impl TargetAdapter for FeedAdapter {
    fn channel(&self) -> TargetChannel {
        TargetChannel::Feed
    }

    fn method(&self) -> Method {
        Method::PUT
    }

    fn submit_path(&self, profile: &ResolvedProfile) -> String {
        match profile.record_id {
            Some(id) => format!("entries/{id}"),
            None => "entries".to_string(),
        }
    }

    fn build_payload(&self, target: &Target, profile: &ResolvedProfile) -> Result<JsonValue, TargetError> {
        let record_id = require_record_id(profile)?;
        let price = match (profile.price, profile.currency.as_deref()) {
            (Some(amount), Some(currency)) => Some(format!("{amount} {currency}")),
            (Some(amount), None) => Some(amount.to_string()),
            _ => None,
        };
        Ok(json!({
            "id": record_id,
            "account": target.account_ref,
            "language": target.locale,
            "title": profile.title,
            "summary": profile.description.as_deref().map(|d| truncate_chars(d, 500)),
            "price": price,
            "city": profile.location.city,
            "country": profile.location.country,
            "property_type": profile.attributes.property_type,
            "bedrooms": profile.attributes.bedrooms,
            "bathrooms": profile.attributes.bathrooms,
            "size_sqm": profile.attributes.size_sqm,
            "image": profile.media.first().map(|m| m.as_str()),
            "images": profile.media.iter().map(|m| m.as_str()).collect::<Vec<_>>(),
            "agent": agent_json(profile),
        }))
    }
}

impl TargetAdapter for DirectoryAdapter {
    fn channel(&self) -> TargetChannel {
        TargetChannel::Directory
    }

    fn submit_path(&self, _profile: &ResolvedProfile) -> String {
        "entries".to_string()
    }

    fn build_payload(&self, target: &Target, profile: &ResolvedProfile) -> Result<JsonValue, TargetError> {
        let record_id = require_record_id(profile)?;
        let name = profile
            .title
            .clone()
            .ok_or_else(|| TargetError::Payload("directory entries need a title".to_string()))?;
        let address = [
            profile.location.address.as_deref(),
            profile.location.city.as_deref(),
            profile.location.country.as_deref(),
        ]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(", ");
        Ok(json!({
            "listing_id": record_id,
            "account": target.account_ref,
            "name": name,
            "address": address,
            "thumbnail": profile.media.first().map(|m| m.as_str()),
            "contact_agent": agent_json(profile),
        }))
    }
}

pub fn adapter_for_channel(channel: TargetChannel) -> Box<dyn TargetAdapter> {
    match channel {
        TargetChannel::Portal => Box::new(PortalAdapter),
        TargetChannel::Feed => Box::new(FeedAdapter),
        TargetChannel::Directory => Box::new(DirectoryAdapter),
    }
}

fn idempotency_key(target: &Target, profile: &ResolvedProfile) -> String {
    match profile.record_id {
        Some(id) => format!("{id}:{}", target.id),
        None => format!("unsaved:{}", target.id),
    }
}

/// Live client: resolves the target, builds its channel payload, sends it over HTTP.
#[derive(Debug)]
pub struct AdapterTargetClient {
    registry: TargetRegistry,
    http: HttpTransport,
}

impl AdapterTargetClient {
    pub fn new(registry: TargetRegistry, http: HttpTransport) -> Self {
        Self { registry, http }
    }
}

#[async_trait]
impl TargetClient for AdapterTargetClient {
    async fn publish(
        &self,
        target_id: &str,
        payload: &ResolvedProfile,
    ) -> Result<PublishReceipt, TargetError> {
        let target = self.registry.find(target_id)?;
        let endpoint = target
            .endpoint
            .as_deref()
            .ok_or_else(|| TargetError::NoEndpoint(target.id.clone()))?;
        let adapter = adapter_for_channel(target.channel);
        let body = adapter.build_payload(target, payload)?;
        let url = format!(
            "{}/{}",
            endpoint.trim_end_matches('/'),
            adapter.submit_path(payload)
        );
        let resp = self
            .http
            .send_json(
                &target.id,
                adapter.method(),
                &url,
                &idempotency_key(target, payload),
                &body,
            )
            .await
            .map_err(|err| match err {
                FetchError::HttpStatus { status, body, .. } if (400..500).contains(&status) => {
                    TargetError::Rejected(format!("{status}: {body}"))
                }
                other => TargetError::Http(other),
            })?;
        Ok(adapter.parse_receipt(target, &resp.body))
    }
}

/// Dry-run client: writes each payload to `<root>/<target>/<record>.json` instead of
/// calling the target.
#[derive(Debug, Clone)]
pub struct OutboxTargetClient {
    registry: TargetRegistry,
    root: PathBuf,
}

impl OutboxTargetClient {
    pub fn new(registry: TargetRegistry, root: impl Into<PathBuf>) -> Self {
        Self {
            registry,
            root: root.into(),
        }
    }

    pub fn path_for(&self, target_id: &str, record_id: Uuid) -> PathBuf {
        self.root.join(target_id).join(format!("{record_id}.json"))
    }
}

#[async_trait]
impl TargetClient for OutboxTargetClient {
    async fn publish(
        &self,
        target_id: &str,
        payload: &ResolvedProfile,
    ) -> Result<PublishReceipt, TargetError> {
        let target = self.registry.find(target_id)?;
        let record_id = require_record_id(payload)?;
        let body = adapter_for_channel(target.channel).build_payload(target, payload)?;
        let bytes = serde_json::to_vec_pretty(&body)
            .map_err(|e| TargetError::Payload(e.to_string()))?;

        let path = self.path_for(&target.id, record_id);
        let dir = self.root.join(&target.id);
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating outbox directory {}", dir.display()))?;
        let temp_path = dir.join(format!(".{}.tmp", Uuid::new_v4()));
        fs::write(&temp_path, &bytes)
            .await
            .with_context(|| format!("writing {}", temp_path.display()))?;
        fs::rename(&temp_path, &path)
            .await
            .with_context(|| format!("renaming {} -> {}", temp_path.display(), path.display()))?;

        info!(target_id, record_id = %record_id, path = %path.display(), "payload written to outbox");
        Ok(PublishReceipt {
            message: format!("written to {}", path.display()),
            external_id: None,
        })
    }
}
