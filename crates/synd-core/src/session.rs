//! Single-owner editing session over one canonical record and its target profiles.

use std::ops::Range;

use chrono::Utc;
use uuid::Uuid;

use crate::media::MediaError;
use crate::profiles::{ProfileError, ProfilePatch, ResolvedProfile, TargetProfile, TargetProfileStore};
use crate::{CanonicalRecord, MediaRef, RecordPatch, Target, TargetCatalog};

/// Owns the record, the target catalog and every profile, so media mutations can
/// remap all dependent selections before returning.
///
/// `revision` advances on every change to the canonical record (fields or media);
/// draft persistence uses it to tell whether a snapshot is already saved.
#[derive(Debug, Clone)]
pub struct ListingSession {
    record: CanonicalRecord,
    catalog: TargetCatalog,
    profiles: TargetProfileStore,
    revision: u64,
}

impl ListingSession {
    pub fn new(record: CanonicalRecord, catalog: TargetCatalog) -> Self {
        Self {
            record,
            catalog,
            profiles: TargetProfileStore::new(),
            revision: 0,
        }
    }

    /// Rebuilds a session from stored profiles, rejecting any that reference
    /// unknown targets or media positions that no longer exist.
    pub fn restore(
        record: CanonicalRecord,
        catalog: TargetCatalog,
        profiles: Vec<TargetProfile>,
    ) -> Result<Self, ProfileError> {
        let profiles = TargetProfileStore::restore(profiles, &catalog, &record)?;
        Ok(Self {
            record,
            catalog,
            profiles,
            revision: 0,
        })
    }

    pub fn record(&self) -> &CanonicalRecord {
        &self.record
    }

    pub fn catalog(&self) -> &TargetCatalog {
        &self.catalog
    }

    pub fn profiles(&self) -> &TargetProfileStore {
        &self.profiles
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn selected_target_ids(&self) -> Vec<String> {
        self.profiles.target_ids()
    }

    fn target(&self, target_id: &str) -> Result<&Target, ProfileError> {
        self.catalog
            .get(target_id)
            .ok_or_else(|| ProfileError::UnknownTarget(target_id.to_string()))
    }

    fn touch(&mut self) {
        self.revision += 1;
        self.record.updated_at = Some(Utc::now());
        self.profiles.revalidate_all(&self.catalog, &self.record);
    }

    pub fn edit_record(&mut self, patch: RecordPatch) {
        if patch.is_empty() {
            return;
        }
        patch.apply(&mut self.record);
        self.touch();
    }

    /// Records the id handed out by the store on first save. Not an edit, so the
    /// revision does not move.
    pub fn assign_record_id(&mut self, id: Uuid) {
        self.record.id = Some(id);
    }

    pub fn append_media(&mut self, refs: Vec<MediaRef>) -> Range<usize> {
        if refs.is_empty() {
            let end = self.record.media.len();
            return end..end;
        }
        let range = self.record.media.append(refs);
        self.touch();
        range
    }

    pub fn reorder_media(&mut self, from: usize, to: usize) -> Result<(), MediaError> {
        let remap = self.record.media.reorder(from, to)?;
        self.profiles.apply_remap(remap);
        self.touch();
        Ok(())
    }

    pub fn remove_media(&mut self, at: usize) -> Result<MediaRef, MediaError> {
        let (removed, remap) = self.record.media.remove(at)?;
        self.profiles.apply_remap(remap);
        self.touch();
        Ok(removed)
    }

    /// Per-target cover choice; the canonical order is left alone.
    pub fn set_cover(&mut self, target_id: &str, index: usize) -> Result<&TargetProfile, ProfileError> {
        let target = self
            .catalog
            .get(target_id)
            .ok_or_else(|| ProfileError::UnknownTarget(target_id.to_string()))?;
        self.profiles.set_cover(target, &self.record, index)
    }

    pub fn select_target(&mut self, target_id: &str) -> Result<&TargetProfile, ProfileError> {
        let target = self
            .catalog
            .get(target_id)
            .ok_or_else(|| ProfileError::UnknownTarget(target_id.to_string()))?;
        Ok(self.profiles.select(target, &self.record))
    }

    pub fn deselect_target(&mut self, target_id: &str) -> bool {
        self.profiles.deselect(target_id)
    }

    pub fn update_profile(
        &mut self,
        target_id: &str,
        patch: ProfilePatch,
    ) -> Result<&TargetProfile, ProfileError> {
        let target = self
            .catalog
            .get(target_id)
            .ok_or_else(|| ProfileError::UnknownTarget(target_id.to_string()))?;
        self.profiles.update(target, &self.record, patch)
    }

    pub fn resolved_view(&self, target_id: &str) -> Result<ResolvedProfile, ProfileError> {
        self.target(target_id)?;
        self.profiles.resolved_view(target_id, &self.record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::{Requirement, RequirementKind};
    use crate::{MediaSet, TargetChannel};

    fn catalog() -> TargetCatalog {
        let mk = |id: &str, min_images: usize| Target {
            id: id.into(),
            display_name: id.to_uppercase(),
            connected: true,
            channel: TargetChannel::Portal,
            country: None,
            locale: None,
            endpoint: None,
            account_ref: Some(format!("acct-{id}")),
            requirements: vec![
                Requirement::required(RequirementKind::Title),
                Requirement::required(RequirementKind::MinImages { count: min_images }),
            ],
        };
        TargetCatalog::new(vec![mk("a", 3), mk("b", 1)]).unwrap()
    }

    fn session() -> ListingSession {
        let record = CanonicalRecord {
            title: Some("Loft".into()),
            media: MediaSet::from_refs((0..5).map(|i| MediaRef::new(format!("m{i}"))).collect()),
            ..Default::default()
        };
        ListingSession::new(record, catalog())
    }

    #[test]
    fn reorder_remaps_every_profile() {
        let mut s = session();
        s.select_target("a").unwrap();
        s.select_target("b").unwrap();
        s.update_profile(
            "a",
            ProfilePatch {
                selected_media: Some(vec![0, 2, 4]),
                ..Default::default()
            },
        )
        .unwrap();
        s.reorder_media(0, 4).unwrap();
        assert_eq!(s.profiles().get("a").unwrap().selected_media(), &[4, 1, 3]);
        assert_eq!(
            s.profiles().get("b").unwrap().selected_media(),
            &[4, 0, 1, 2, 3]
        );
        let view = s.resolved_view("a").unwrap();
        let names: Vec<&str> = view.media.iter().map(MediaRef::as_str).collect();
        assert_eq!(names, vec!["m0", "m2", "m4"]);
    }

    #[test]
    fn remove_revalidates_dependent_profiles() {
        let mut s = session();
        s.select_target("a").unwrap();
        s.update_profile(
            "a",
            ProfilePatch {
                selected_media: Some(vec![1, 2, 3]),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(s.profiles().get("a").unwrap().validation().is_valid);

        let removed = s.remove_media(2).unwrap();
        assert_eq!(removed.as_str(), "m2");
        let profile = s.profiles().get("a").unwrap();
        assert_eq!(profile.selected_media(), &[1, 2]);
        assert_eq!(profile.validation().errors, vec!["minimum 3 images".to_string()]);
    }

    #[test]
    fn invalid_media_ops_do_not_bump_revision() {
        let mut s = session();
        let rev = s.revision();
        assert!(s.reorder_media(0, 5).is_err());
        assert!(s.remove_media(5).is_err());
        assert_eq!(s.revision(), rev);
        assert_eq!(s.record().media.len(), 5);
    }

    #[test]
    fn record_edits_flow_into_inheriting_profiles() {
        let mut s = session();
        s.select_target("b").unwrap();
        s.edit_record(RecordPatch {
            clear: vec![crate::ListingField::Title],
            ..Default::default()
        });
        assert_eq!(s.revision(), 1);
        let profile = s.profiles().get("b").unwrap();
        assert_eq!(profile.validation().errors, vec!["missing title".to_string()]);
    }

    #[test]
    fn set_cover_only_touches_one_profile() {
        let mut s = session();
        s.select_target("a").unwrap();
        s.select_target("b").unwrap();
        let rev = s.revision();
        s.set_cover("a", 3).unwrap();
        assert_eq!(s.profiles().get("a").unwrap().selected_media(), &[3, 0, 1, 2, 4]);
        assert_eq!(s.profiles().get("b").unwrap().selected_media(), &[0, 1, 2, 3, 4]);
        assert_eq!(s.record().media.get(0).unwrap().as_str(), "m0");
        assert_eq!(s.revision(), rev);
        assert!(s.set_cover("a", 9).is_err());
    }

    #[test]
    fn unknown_target_is_rejected() {
        let mut s = session();
        assert_eq!(
            s.select_target("nope").unwrap_err(),
            ProfileError::UnknownTarget("nope".into())
        );
    }

    #[test]
    fn restore_rejects_stale_selection() {
        let mut s = session();
        s.select_target("a").unwrap();
        let profiles: Vec<TargetProfile> = s.profiles().iter().cloned().collect();
        let mut record = s.record().clone();
        record.media = MediaSet::from_refs(vec![MediaRef::new("only")]);
        let err = ListingSession::restore(record, catalog(), profiles).unwrap_err();
        assert!(matches!(err, ProfileError::Media(MediaError::InvalidIndex { .. })));
    }
}
