//! Core listing model, per-target profiles, media remapping and validation for synd.

use std::collections::{BTreeSet, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

mod media;
mod profiles;
mod session;
pub mod validation;

pub use media::{set_cover, IndexRemap, MediaError, MediaSet};
pub use profiles::{
    resolve, ProfileError, ProfileOverrides, ProfilePatch, ResolvedProfile, TargetProfile,
    TargetProfileStore,
};
pub use session::ListingSession;
pub use validation::{
    evaluate, Requirement, RequirementKind, RequirementLevel, RequirementSet, ValidationResult,
};

/// Opaque handle (usually a URL) to one uploaded media asset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MediaRef(String);

impl MediaRef {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MediaRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Location {
    pub address: Option<String>,
    pub city: Option<String>,
    pub region: Option<String>,
    pub country: Option<String>,
    pub postal_code: Option<String>,
}

impl Location {
    pub fn is_empty(&self) -> bool {
        [
            &self.address,
            &self.city,
            &self.region,
            &self.country,
            &self.postal_code,
        ]
        .iter()
        .all(|part| part.as_deref().map_or(true, |s| s.trim().is_empty()))
    }
}

/// Structured property attributes a target may ask for.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ListingAttributes {
    pub property_type: Option<String>,
    pub bedrooms: Option<u32>,
    pub bathrooms: Option<u32>,
    pub size_sqm: Option<f64>,
}

/// Source-of-truth listing edited by the operator.
///
/// `media` can only be reordered or shrunk through [`ListingSession`], which keeps
/// every profile's selection pointing at the same assets.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CanonicalRecord {
    #[serde(default)]
    pub id: Option<Uuid>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub location: Location,
    #[serde(default)]
    pub attributes: ListingAttributes,
    #[serde(default)]
    pub permit_number: Option<String>,
    #[serde(default)]
    pub media: MediaSet,
    #[serde(default)]
    pub amenities: BTreeSet<String>,
    #[serde(default)]
    pub features: BTreeSet<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Scalar listing fields shared by record edits and profile overrides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingField {
    Title,
    Description,
    Price,
    Currency,
    Location,
    Attributes,
    PermitNumber,
}

/// Partial edit of the canonical record. `Some` sets a field, `clear` resets it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub price: Option<f64>,
    pub currency: Option<String>,
    pub location: Option<Location>,
    pub attributes: Option<ListingAttributes>,
    pub permit_number: Option<String>,
    pub amenities: Option<BTreeSet<String>>,
    pub features: Option<BTreeSet<String>>,
    pub clear: Vec<ListingField>,
}

impl RecordPatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub(crate) fn apply(self, record: &mut CanonicalRecord) {
        for field in &self.clear {
            match field {
                ListingField::Title => record.title = None,
                ListingField::Description => record.description = None,
                ListingField::Price => record.price = None,
                ListingField::Currency => record.currency = None,
                ListingField::Location => record.location = Location::default(),
                ListingField::Attributes => record.attributes = ListingAttributes::default(),
                ListingField::PermitNumber => record.permit_number = None,
            }
        }
        if let Some(v) = self.title {
            record.title = Some(v);
        }
        if let Some(v) = self.description {
            record.description = Some(v);
        }
        if let Some(v) = self.price {
            record.price = Some(v);
        }
        if let Some(v) = self.currency {
            record.currency = Some(v);
        }
        if let Some(v) = self.location {
            record.location = v;
        }
        if let Some(v) = self.attributes {
            record.attributes = v;
        }
        if let Some(v) = self.permit_number {
            record.permit_number = Some(v);
        }
        if let Some(v) = self.amenities {
            record.amenities = v;
        }
        if let Some(v) = self.features {
            record.features = v;
        }
    }
}

/// Agent credited on a target: one of ours, or an id the target assigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum AgentRef {
    Local(Uuid),
    External(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetChannel {
    Portal,
    Feed,
    Directory,
}

/// External system a listing can be pushed to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub connected: bool,
    pub channel: TargetChannel,
    /// ISO country code; drives region-specific requirements.
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub locale: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Operator's account on the target. Publishing without one is an error.
    #[serde(default)]
    pub account_ref: Option<String>,
    #[serde(default)]
    pub requirements: Vec<Requirement>,
}

impl Target {
    pub fn requirement_set(&self) -> RequirementSet<'_> {
        RequirementSet {
            country: self.country.as_deref(),
            requirements: &self.requirements,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatalogError {
    #[error("duplicate target id {0}")]
    DuplicateTarget(String),
}

/// Known targets in a stable order. Ids are unique.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Target>", into = "Vec<Target>")]
pub struct TargetCatalog {
    targets: Vec<Target>,
}

impl TryFrom<Vec<Target>> for TargetCatalog {
    type Error = CatalogError;

    fn try_from(targets: Vec<Target>) -> Result<Self, Self::Error> {
        Self::new(targets)
    }
}

impl From<TargetCatalog> for Vec<Target> {
    fn from(catalog: TargetCatalog) -> Self {
        catalog.targets
    }
}

impl TargetCatalog {
    pub fn new(targets: Vec<Target>) -> Result<Self, CatalogError> {
        let mut seen = HashSet::new();
        if let Some(dup) = targets.iter().find(|t| !seen.insert(t.id.as_str())) {
            return Err(CatalogError::DuplicateTarget(dup.id.clone()));
        }
        Ok(Self { targets })
    }

    pub fn get(&self, target_id: &str) -> Option<&Target> {
        self.targets.iter().find(|t| t.id == target_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Target> {
        self.targets.iter()
    }

    pub fn ids(&self) -> Vec<String> {
        self.targets.iter().map(|t| t.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare_target(id: &str) -> Target {
        Target {
            id: id.into(),
            display_name: id.to_uppercase(),
            connected: true,
            channel: TargetChannel::Feed,
            country: None,
            locale: None,
            endpoint: None,
            account_ref: None,
            requirements: vec![],
        }
    }

    #[test]
    fn catalog_rejects_duplicate_target_ids() {
        let err = TargetCatalog::new(vec![bare_target("a"), bare_target("b"), bare_target("a")])
            .unwrap_err();
        assert_eq!(err, CatalogError::DuplicateTarget("a".into()));
        assert_eq!(err.to_string(), "duplicate target id a");

        let catalog = TargetCatalog::new(vec![bare_target("a"), bare_target("b")]).unwrap();
        assert_eq!(catalog.ids(), vec!["a", "b"]);
    }

    #[test]
    fn deserialized_catalog_rejects_duplicate_target_ids() {
        let json = r#"[{"id":"a","display_name":"A","channel":"feed"},{"id":"a","display_name":"A2","channel":"feed"}]"#;
        let err = serde_json::from_str::<TargetCatalog>(json).unwrap_err();
        assert!(err.to_string().contains("duplicate target id a"));
    }

    #[test]
    fn location_with_only_blank_parts_is_empty() {
        let loc = Location {
            city: Some("  ".into()),
            ..Default::default()
        };
        assert!(loc.is_empty());
        let loc = Location {
            city: Some("Lisbon".into()),
            ..Default::default()
        };
        assert!(!loc.is_empty());
    }

    #[test]
    fn record_patch_clears_before_setting() {
        let mut record = CanonicalRecord {
            title: Some("Old".into()),
            price: Some(10.0),
            ..Default::default()
        };
        RecordPatch {
            title: Some("New".into()),
            clear: vec![ListingField::Title, ListingField::Price],
            ..Default::default()
        }
        .apply(&mut record);
        assert_eq!(record.title.as_deref(), Some("New"));
        assert_eq!(record.price, None);
    }

    #[test]
    fn target_deserializes_from_yaml_with_requirements() {
        let yaml = r#"
id: casa-portal
display_name: Casa Portal
connected: true
channel: portal
country: AE
account_ref: acct-1
requirements:
  - kind: title
  - kind: min_images
    count: 3
  - kind: permit_number
    countries: [AE]
  - kind: description
    level: recommended
"#;
        let target: Target = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(target.channel, TargetChannel::Portal);
        assert_eq!(target.requirements.len(), 4);
        assert_eq!(
            target.requirements[1].kind,
            RequirementKind::MinImages { count: 3 }
        );
        assert_eq!(target.requirements[2].countries, vec!["AE".to_string()]);
        assert_eq!(target.requirements[3].level, RequirementLevel::Recommended);
    }

    #[test]
    fn agent_ref_serializes_tagged() {
        let agent = AgentRef::External("ag-77".into());
        let json = serde_json::to_value(&agent).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "external", "id": "ag-77"}));
    }
}
