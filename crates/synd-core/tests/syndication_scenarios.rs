use synd_core::{
    CanonicalRecord, ListingSession, MediaRef, MediaSet, ProfilePatch, RecordPatch, Requirement,
    RequirementKind, Target, TargetCatalog, TargetChannel,
};

fn portal(id: &str, requirements: Vec<Requirement>) -> Target {
    Target {
        id: id.to_string(),
        display_name: id.to_string(),
        connected: true,
        channel: TargetChannel::Portal,
        country: Some("AE".to_string()),
        locale: Some("en-AE".to_string()),
        endpoint: None,
        account_ref: Some("acct".to_string()),
        requirements,
    }
}

fn five_photo_record() -> CanonicalRecord {
    CanonicalRecord {
        title: Some("Marina two-bed".to_string()),
        price: Some(1_850_000.0),
        currency: Some("AED".to_string()),
        media: MediaSet::from_refs(
            ["living", "kitchen", "bed", "bath", "view"]
                .iter()
                .map(|s| MediaRef::new(format!("https://cdn.example/{s}.jpg")))
                .collect(),
        ),
        ..Default::default()
    }
}

#[test]
fn deletion_never_leaves_dangling_indices() {
    let catalog = TargetCatalog::new(vec![
        portal("a", vec![]),
        portal("b", vec![]),
        portal("c", vec![]),
    ])
    .unwrap();
    let mut session = ListingSession::new(five_photo_record(), catalog);
    for id in ["a", "b", "c"] {
        session.select_target(id).unwrap();
    }
    session
        .update_profile(
            "b",
            ProfilePatch {
                selected_media: Some(vec![4, 2]),
                ..Default::default()
            },
        )
        .unwrap();
    session.set_cover("c", 2).unwrap();

    let before: Vec<Vec<usize>> = session
        .profiles()
        .iter()
        .map(|p| p.selected_media().to_vec())
        .collect();
    session.remove_media(2).unwrap();

    for (profile, old) in session.profiles().iter().zip(before) {
        assert!(profile
            .selected_media()
            .iter()
            .all(|&i| i < session.record().media.len()));
        let expected: Vec<usize> = old
            .into_iter()
            .filter(|&i| i != 2)
            .map(|i| if i > 2 { i - 1 } else { i })
            .collect();
        assert_eq!(profile.selected_media(), expected.as_slice());
    }
}

#[test]
fn validation_follows_record_and_profile_edits() {
    let catalog = TargetCatalog::new(vec![portal(
        "dubai-portal",
        vec![
            Requirement::required(RequirementKind::Title),
            Requirement::required(RequirementKind::Price),
            Requirement::required(RequirementKind::MinImages { count: 3 }),
            Requirement::required(RequirementKind::PermitNumber).only_in(["AE"]),
        ],
    )])
    .unwrap();
    let mut session = ListingSession::new(five_photo_record(), catalog);
    let profile = session.select_target("dubai-portal").unwrap();
    assert_eq!(profile.validation().errors, vec!["missing permit number".to_string()]);
    assert_eq!(profile.validation().score, 75);

    session.edit_record(RecordPatch {
        permit_number: Some("RERA-1234".to_string()),
        ..Default::default()
    });
    let profile = session
        .update_profile(
            "dubai-portal",
            ProfilePatch {
                selected_media: Some(vec![3]),
                ..Default::default()
            },
        )
        .unwrap();
    assert!(!profile.validation().is_valid);
    assert_eq!(profile.validation().errors, vec!["minimum 3 images".to_string()]);

    let profile = session
        .update_profile(
            "dubai-portal",
            ProfilePatch {
                selected_media: Some(vec![3, 0, 1]),
                ..Default::default()
            },
        )
        .unwrap();
    assert!(profile.validation().is_valid);
    assert_eq!(profile.validation().score, 100);

    let view = session.resolved_view("dubai-portal").unwrap();
    assert_eq!(view.media[0].as_str(), "https://cdn.example/bath.jpg");
    assert_eq!(view.permit_number.as_deref(), Some("RERA-1234"));
}

#[test]
fn moving_first_photo_to_last_keeps_each_selection_on_the_same_photos() {
    let catalog = TargetCatalog::new(vec![portal("a", vec![])]).unwrap();
    let mut session = ListingSession::new(five_photo_record(), catalog);
    session.select_target("a").unwrap();
    session
        .update_profile(
            "a",
            ProfilePatch {
                selected_media: Some(vec![0, 2, 4]),
                ..Default::default()
            },
        )
        .unwrap();
    let before = session.resolved_view("a").unwrap().media;

    session.reorder_media(0, 4).unwrap();

    let profile = session.profiles().get("a").unwrap();
    assert_eq!(profile.selected_media(), &[4, 1, 3]);
    assert_eq!(session.resolved_view("a").unwrap().media, before);
    assert_eq!(
        session.record().media.get(4).unwrap().as_str(),
        "https://cdn.example/living.jpg"
    );
}

#[test]
fn reselecting_a_target_starts_from_a_fresh_profile() {
    let catalog = TargetCatalog::new(vec![portal("a", vec![])]).unwrap();
    let mut session = ListingSession::new(five_photo_record(), catalog);
    session.select_target("a").unwrap();
    session
        .update_profile(
            "a",
            ProfilePatch {
                title: Some("Custom title".to_string()),
                selected_media: Some(vec![1]),
                ..Default::default()
            },
        )
        .unwrap();

    assert!(session.deselect_target("a"));
    assert!(!session.deselect_target("a"));

    let profile = session.select_target("a").unwrap();
    assert_eq!(profile.overrides.title, None);
    assert_eq!(profile.selected_media(), &[0, 1, 2, 3, 4]);
    assert_eq!(session.selected_target_ids(), vec!["a".to_string()]);
}
