//! Per-target customization profiles.

use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::media::{self, IndexRemap, MediaError};
use crate::validation::{evaluate, RequirementSet, ValidationResult};
use crate::{
    AgentRef, CanonicalRecord, ListingAttributes, ListingField, Location, MediaRef, Target,
    TargetCatalog,
};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProfileError {
    #[error("unknown target {0}")]
    UnknownTarget(String),
    #[error("target {0} is not selected")]
    NotSelected(String),
    #[error(transparent)]
    Media(#[from] MediaError),
}

/// Field overrides; `None` inherits from the canonical record.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileOverrides {
    pub title: Option<String>,
    pub description: Option<String>,
    pub price: Option<f64>,
    pub currency: Option<String>,
    pub location: Option<Location>,
    pub attributes: Option<ListingAttributes>,
    pub permit_number: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetProfile {
    pub target_id: String,
    #[serde(default)]
    pub overrides: ProfileOverrides,
    #[serde(default)]
    selected_media: Vec<usize>,
    #[serde(default)]
    pub agent: Option<AgentRef>,
    #[serde(default)]
    validation: ValidationResult,
}

impl TargetProfile {
    fn seeded(target: &Target, record: &CanonicalRecord) -> Self {
        let mut profile = Self {
            target_id: target.id.clone(),
            overrides: ProfileOverrides::default(),
            selected_media: (0..record.media.len()).collect(),
            agent: None,
            validation: ValidationResult::default(),
        };
        profile.revalidate(target, record);
        profile
    }

    /// Indices into the canonical media, cover first.
    pub fn selected_media(&self) -> &[usize] {
        &self.selected_media
    }

    pub fn validation(&self) -> &ValidationResult {
        &self.validation
    }

    fn revalidate(&mut self, target: &Target, record: &CanonicalRecord) {
        let resolved = resolve(record, self);
        self.validation = evaluate(&resolved, &target.requirement_set());
    }
}

/// Partial profile update. `clear` resets overrides back to inheriting.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfilePatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub price: Option<f64>,
    pub currency: Option<String>,
    pub location: Option<Location>,
    pub attributes: Option<ListingAttributes>,
    pub permit_number: Option<String>,
    pub selected_media: Option<Vec<usize>>,
    pub agent: Option<AgentRef>,
    pub clear: Vec<ListingField>,
    pub clear_agent: bool,
}

impl ProfilePatch {
    fn apply(self, profile: &mut TargetProfile) {
        let o = &mut profile.overrides;
        for field in &self.clear {
            match field {
                ListingField::Title => o.title = None,
                ListingField::Description => o.description = None,
                ListingField::Price => o.price = None,
                ListingField::Currency => o.currency = None,
                ListingField::Location => o.location = None,
                ListingField::Attributes => o.attributes = None,
                ListingField::PermitNumber => o.permit_number = None,
            }
        }
        if self.clear_agent {
            profile.agent = None;
        }
        if self.title.is_some() {
            o.title = self.title;
        }
        if self.description.is_some() {
            o.description = self.description;
        }
        if self.price.is_some() {
            o.price = self.price;
        }
        if self.currency.is_some() {
            o.currency = self.currency;
        }
        if self.location.is_some() {
            o.location = self.location;
        }
        if self.attributes.is_some() {
            o.attributes = self.attributes;
        }
        if self.permit_number.is_some() {
            o.permit_number = self.permit_number;
        }
        if self.agent.is_some() {
            profile.agent = self.agent;
        }
        if let Some(selection) = self.selected_media {
            profile.selected_media = selection;
        }
    }
}

/// Profile overrides merged over the canonical record: what previews show and
/// what gets sent to a target.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResolvedProfile {
    pub target_id: String,
    pub record_id: Option<Uuid>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub price: Option<f64>,
    pub currency: Option<String>,
    pub location: Location,
    pub attributes: ListingAttributes,
    pub permit_number: Option<String>,
    pub amenities: BTreeSet<String>,
    pub features: BTreeSet<String>,
    /// Selected media in display order; the first entry is the cover.
    pub media: Vec<MediaRef>,
    pub agent: Option<AgentRef>,
}

pub fn resolve(record: &CanonicalRecord, profile: &TargetProfile) -> ResolvedProfile {
    let o = &profile.overrides;
    ResolvedProfile {
        target_id: profile.target_id.clone(),
        record_id: record.id,
        title: o.title.clone().or_else(|| record.title.clone()),
        description: o.description.clone().or_else(|| record.description.clone()),
        price: o.price.or(record.price),
        currency: o.currency.clone().or_else(|| record.currency.clone()),
        location: o.location.clone().unwrap_or_else(|| record.location.clone()),
        attributes: o
            .attributes
            .clone()
            .unwrap_or_else(|| record.attributes.clone()),
        permit_number: o
            .permit_number
            .clone()
            .or_else(|| record.permit_number.clone()),
        amenities: record.amenities.clone(),
        features: record.features.clone(),
        media: profile
            .selected_media
            .iter()
            .filter_map(|&i| record.media.get(i).cloned())
            .collect(),
        agent: profile.agent.clone(),
    }
}

/// One profile per selected target, in selection order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetProfileStore {
    profiles: Vec<TargetProfile>,
}

impl TargetProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, target_id: &str) -> Option<&TargetProfile> {
        self.profiles.iter().find(|p| p.target_id == target_id)
    }

    fn get_mut(&mut self, target_id: &str) -> Result<&mut TargetProfile, ProfileError> {
        self.profiles
            .iter_mut()
            .find(|p| p.target_id == target_id)
            .ok_or_else(|| ProfileError::NotSelected(target_id.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &TargetProfile> {
        self.profiles.iter()
    }

    pub fn target_ids(&self) -> Vec<String> {
        self.profiles.iter().map(|p| p.target_id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    /// Returns the existing profile, or seeds a fresh one from the record.
    pub fn select(&mut self, target: &Target, record: &CanonicalRecord) -> &TargetProfile {
        let pos = match self.profiles.iter().position(|p| p.target_id == target.id) {
            Some(pos) => pos,
            None => {
                self.profiles.push(TargetProfile::seeded(target, record));
                self.profiles.len() - 1
            }
        };
        &self.profiles[pos]
    }

    /// Drops the profile and its edits. Returns whether the target was selected.
    pub fn deselect(&mut self, target_id: &str) -> bool {
        let before = self.profiles.len();
        self.profiles.retain(|p| p.target_id != target_id);
        before != self.profiles.len()
    }

    /// Merges `patch` and recomputes validation before returning.
    ///
    /// A patch carrying an out-of-range media index is rejected whole.
    pub fn update(
        &mut self,
        target: &Target,
        record: &CanonicalRecord,
        patch: ProfilePatch,
    ) -> Result<&TargetProfile, ProfileError> {
        let mut patch = patch;
        if let Some(selection) = patch.selected_media.take() {
            patch.selected_media = Some(checked_selection(selection, record)?);
        }
        let profile = self.get_mut(&target.id)?;
        patch.apply(profile);
        profile.revalidate(target, record);
        Ok(profile)
    }

    pub fn resolved_view(
        &self,
        target_id: &str,
        record: &CanonicalRecord,
    ) -> Result<ResolvedProfile, ProfileError> {
        self.get(target_id)
            .map(|p| resolve(record, p))
            .ok_or_else(|| ProfileError::NotSelected(target_id.to_string()))
    }

    pub(crate) fn set_cover(
        &mut self,
        target: &Target,
        record: &CanonicalRecord,
        index: usize,
    ) -> Result<&TargetProfile, ProfileError> {
        record.media.check_index(index)?;
        let profile = self.get_mut(&target.id)?;
        media::set_cover(&mut profile.selected_media, index);
        profile.revalidate(target, record);
        Ok(profile)
    }

    pub(crate) fn apply_remap(&mut self, remap: IndexRemap) {
        for profile in &mut self.profiles {
            remap.apply_to(&mut profile.selected_media);
        }
    }

    pub(crate) fn revalidate_all(&mut self, catalog: &TargetCatalog, record: &CanonicalRecord) {
        for profile in &mut self.profiles {
            match catalog.get(&profile.target_id) {
                Some(target) => profile.revalidate(target, record),
                None => {
                    let resolved = resolve(record, profile);
                    profile.validation = evaluate(&resolved, &RequirementSet::empty());
                }
            }
        }
    }

    /// Adopts externally stored profiles, checking every selection against `record`.
    pub(crate) fn restore(
        profiles: Vec<TargetProfile>,
        catalog: &TargetCatalog,
        record: &CanonicalRecord,
    ) -> Result<Self, ProfileError> {
        let mut store = Self::new();
        for mut profile in profiles {
            if catalog.get(&profile.target_id).is_none() {
                return Err(ProfileError::UnknownTarget(profile.target_id));
            }
            if store.get(&profile.target_id).is_some() {
                continue;
            }
            profile.selected_media =
                checked_selection(std::mem::take(&mut profile.selected_media), record)?;
            store.profiles.push(profile);
        }
        store.revalidate_all(catalog, record);
        Ok(store)
    }
}

fn checked_selection(
    selection: Vec<usize>,
    record: &CanonicalRecord,
) -> Result<Vec<usize>, ProfileError> {
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(selection.len());
    for index in selection {
        record.media.check_index(index)?;
        if seen.insert(index) {
            out.push(index);
        }
    }
    Ok(out)
}
