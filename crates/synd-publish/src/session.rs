use std::sync::Arc;

use synd_core::ListingSession;
use tokio::sync::{watch, Mutex};
use uuid::Uuid;

/// Cloneable handle to the one editing session. Every edit goes through the
/// mutex. Two channels fan out from it: record revisions (draft autosave) and
/// a change generation that also counts profile edits and id adoption (the
/// listing file writer).
#[derive(Debug, Clone)]
pub struct SharedSession {
    inner: Arc<Mutex<ListingSession>>,
    revisions: Arc<watch::Sender<u64>>,
    changes: Arc<watch::Sender<u64>>,
}

impl SharedSession {
    pub fn new(session: ListingSession) -> Self {
        let (tx, _rx) = watch::channel(session.revision());
        let (changes, _rx) = watch::channel(0);
        Self {
            inner: Arc::new(Mutex::new(session)),
            revisions: Arc::new(tx),
            changes: Arc::new(changes),
        }
    }

    /// Runs `f` with exclusive access. Revision subscribers hear about it only
    /// when the record revision moved; change subscribers also when a profile did.
    pub async fn edit<R>(&self, f: impl FnOnce(&mut ListingSession) -> R) -> R {
        let mut session = self.inner.lock().await;
        let before = session.revision();
        let profiles_before = session.profiles().clone();
        let out = f(&mut session);
        let after = session.revision();
        let profiles_changed = *session.profiles() != profiles_before;
        drop(session);
        if after != before {
            self.revisions.send_replace(after);
        }
        if after != before || profiles_changed {
            self.changes.send_modify(|generation| *generation += 1);
        }
        out
    }

    pub async fn read<R>(&self, f: impl FnOnce(&ListingSession) -> R) -> R {
        let session = self.inner.lock().await;
        f(&session)
    }

    pub async fn snapshot(&self) -> ListingSession {
        self.inner.lock().await.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revisions.subscribe()
    }

    pub fn subscribe_changes(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    pub fn generation(&self) -> u64 {
        *self.changes.borrow()
    }

    pub async fn adopt_record_id(&self, id: Uuid) {
        self.inner.lock().await.assign_record_id(id);
        self.changes.send_modify(|generation| *generation += 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use synd_core::{
        CanonicalRecord, ProfilePatch, RecordPatch, Target, TargetCatalog, TargetChannel,
    };

    fn shared() -> SharedSession {
        SharedSession::new(ListingSession::new(
            CanonicalRecord::default(),
            TargetCatalog::default(),
        ))
    }

    #[tokio::test]
    async fn edits_that_change_the_record_notify_subscribers() {
        let session = shared();
        let mut rx = session.subscribe();

        session
            .edit(|s| {
                s.edit_record(RecordPatch {
                    title: Some("Canal flat".into()),
                    ..Default::default()
                })
            })
            .await;
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), 1);

        session.edit(|s| s.deselect_target("nothing")).await;
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn profile_edits_change_the_document_but_not_the_revision() {
        let target = Target {
            id: "casa".into(),
            display_name: "Casa".into(),
            connected: true,
            channel: TargetChannel::Portal,
            country: None,
            locale: None,
            endpoint: None,
            account_ref: None,
            requirements: vec![],
        };
        let session = SharedSession::new(ListingSession::new(
            CanonicalRecord::default(),
            TargetCatalog::new(vec![target]).unwrap(),
        ));
        let revisions = session.subscribe();
        let mut changes = session.subscribe_changes();

        session.edit(|s| s.select_target("casa").map(|_| ())).await.unwrap();
        assert!(!revisions.has_changed().unwrap());
        assert!(changes.has_changed().unwrap());
        assert_eq!(*changes.borrow_and_update(), 1);

        session
            .edit(|s| {
                s.update_profile(
                    "casa",
                    ProfilePatch {
                        title: Some("Sea views".into()),
                        ..Default::default()
                    },
                )
                .map(|_| ())
            })
            .await
            .unwrap();
        assert_eq!(session.generation(), 2);

        session.edit(|s| s.deselect_target("nothing")).await;
        assert_eq!(session.generation(), 2);
    }

    #[tokio::test]
    async fn adopting_an_id_is_not_an_edit() {
        let session = shared();
        let rx = session.subscribe();
        let id = Uuid::new_v4();
        session.adopt_record_id(id).await;
        assert!(!rx.has_changed().unwrap());
        assert_eq!(session.generation(), 1);
        let snap = session.snapshot().await;
        assert_eq!(snap.record().id, Some(id));
        assert_eq!(snap.revision(), 0);
    }
}
