use crate::application::event_store::{EventStore, StoreChange};
use crate::domain::models::{Event, EventKey};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::event_repository::EventRepository;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DraftStatus {
    Idle,
    Drafting,
}

/// A sync update for the drafted event, held back until the draft resolves.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingSync {
    Updated(Event),
    Deleted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DraftSnapshot {
    pub status: DraftStatus,
    /// The event as it was when editing started; `None` for a new event.
    pub original: Option<Event>,
    pub candidate: Option<Event>,
    pub conflict_deferred: bool,
}

impl DraftSnapshot {
    fn idle() -> Self {
        Self {
            status: DraftStatus::Idle,
            original: None,
            candidate: None,
            conflict_deferred: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum DraftError {
    #[error("a draft is already in progress")]
    AlreadyDrafting,
    #[error("no draft in progress")]
    NotDrafting,
    #[error("event not found: {0}")]
    EventNotFound(String),
    #[error("invalid draft: {0}")]
    Invalid(String),
    #[error("failed to persist draft: {0}")]
    Persistence(#[source] InfraError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplySummary {
    pub applied: usize,
    pub removed: usize,
    pub rejected: usize,
    pub deferred: usize,
}

#[derive(Debug, Clone)]
struct Draft {
    original: Option<Event>,
    candidate: Event,
    pending: Option<PendingSync>,
}

impl Draft {
    fn targets_key(&self, key: &EventKey) -> bool {
        self.original
            .as_ref()
            .map(|original| original.matches_key(key))
            .unwrap_or(false)
    }

    fn targets(&self, event: &Event) -> bool {
        [event.id.as_deref(), event.g_event_id.as_deref()]
            .into_iter()
            .flatten()
            .any(|event_id| self.targets_key(&EventKey::new(event.calendar_id.clone(), event_id)))
    }
}

/// Owns the single in-progress draft of a session and the background event
/// store, and keeps incoming sync updates from clobbering unsaved edits.
pub struct DraftReconciler<R>
where
    R: EventRepository,
{
    repository: Arc<R>,
    store: EventStore,
    draft: Option<Draft>,
    snapshot_tx: watch::Sender<DraftSnapshot>,
}

impl<R> DraftReconciler<R>
where
    R: EventRepository,
{
    pub fn new(repository: Arc<R>) -> Self {
        let (snapshot_tx, _) = watch::channel(DraftSnapshot::idle());
        Self {
            repository,
            store: EventStore::default(),
            draft: None,
            snapshot_tx,
        }
    }

    pub fn store(&self) -> &EventStore {
        &self.store
    }

    pub fn status(&self) -> DraftStatus {
        if self.draft.is_some() {
            DraftStatus::Drafting
        } else {
            DraftStatus::Idle
        }
    }

    pub fn snapshot(&self) -> DraftSnapshot {
        match &self.draft {
            None => DraftSnapshot::idle(),
            Some(draft) => DraftSnapshot {
                status: DraftStatus::Drafting,
                original: draft.original.clone(),
                candidate: Some(draft.candidate.clone()),
                conflict_deferred: draft.pending.is_some(),
            },
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<DraftSnapshot> {
        self.snapshot_tx.subscribe()
    }

    pub fn pending_sync(&self) -> Option<&PendingSync> {
        self.draft.as_ref().and_then(|draft| draft.pending.as_ref())
    }

    /// Loads a user's persisted events into the background store.
    pub async fn load_user_events(&mut self, user_id: &str) -> Result<usize, InfraError> {
        let events = self.repository.list_for_user(user_id).await?;
        let loaded = events.len();
        for event in events {
            self.store.put(event);
        }
        tracing::debug!(user_id, loaded, "loaded persisted events");
        Ok(loaded)
    }

    pub fn start_edit(&mut self, event_id: &str) -> Result<DraftSnapshot, DraftError> {
        if self.draft.is_some() {
            return Err(DraftError::AlreadyDrafting);
        }
        let original = self
            .store
            .get(event_id)
            .cloned()
            .ok_or_else(|| DraftError::EventNotFound(event_id.to_string()))?;
        self.draft = Some(Draft {
            candidate: original.clone(),
            original: Some(original),
            pending: None,
        });
        tracing::debug!(event_id, "draft started for existing event");
        Ok(self.publish())
    }

    pub fn start_create(&mut self, event: Event) -> Result<DraftSnapshot, DraftError> {
        if self.draft.is_some() {
            return Err(DraftError::AlreadyDrafting);
        }
        self.draft = Some(Draft {
            original: None,
            candidate: event,
            pending: None,
        });
        tracing::debug!("draft started for new event");
        Ok(self.publish())
    }

    /// Edits the candidate. Identity fields (ids, owner, origin) are fixed for
    /// the lifetime of a draft; an edit touching them is refused.
    pub fn update_draft<F>(&mut self, edit: F) -> Result<DraftSnapshot, DraftError>
    where
        F: FnOnce(&mut Event),
    {
        let draft = self.draft.as_mut().ok_or(DraftError::NotDrafting)?;
        let mut candidate = draft.candidate.clone();
        edit(&mut candidate);

        let current = &draft.candidate;
        if candidate.id != current.id
            || candidate.g_event_id != current.g_event_id
            || candidate.user != current.user
            || candidate.origin != current.origin
        {
            return Err(DraftError::Invalid(
                "draft edits cannot change event identity or origin".to_string(),
            ));
        }
        draft.candidate = candidate;
        Ok(self.publish())
    }

    /// Routes a sync batch: updates for the drafted event are buffered, the
    /// rest go straight to the background store.
    pub fn apply_sync(&mut self, events: Vec<Event>, deleted: &[EventKey]) -> ApplySummary {
        let mut summary = ApplySummary::default();

        for event in events {
            if let Some(draft) = self.draft.as_mut().filter(|draft| draft.targets(&event)) {
                tracing::info!(
                    event_id = event.logical_id().unwrap_or(""),
                    "deferring sync update for drafted event"
                );
                draft.pending = Some(PendingSync::Updated(event));
                summary.deferred += 1;
                continue;
            }
            match self.store.apply(event) {
                StoreChange::Inserted | StoreChange::Updated => summary.applied += 1,
                StoreChange::Unchanged => {}
                StoreChange::Rejected => summary.rejected += 1,
            }
        }

        for key in deleted {
            if let Some(draft) = self.draft.as_mut().filter(|draft| draft.targets_key(key)) {
                tracing::info!(
                    calendar_id = %key.calendar_id,
                    event_id = %key.event_id,
                    "deferring sync deletion for drafted event"
                );
                draft.pending = Some(PendingSync::Deleted);
                summary.deferred += 1;
                continue;
            }
            if self.store.remove(key).is_some() {
                summary.removed += 1;
            }
        }

        if summary.deferred > 0 {
            self.publish();
        }
        summary
    }

    /// Persists the candidate. The committed value supersedes any buffered
    /// sync update. On failure the draft stays as it was.
    pub async fn commit_draft(&mut self) -> Result<Event, DraftError> {
        let draft = self.draft.as_ref().ok_or(DraftError::NotDrafting)?;
        draft.candidate.validate().map_err(DraftError::Invalid)?;

        let saved_id = self
            .repository
            .save(&draft.candidate)
            .await
            .map_err(|error| {
                tracing::warn!(%error, "draft commit failed; keeping draft");
                DraftError::Persistence(error)
            })?;

        let Some(draft) = self.draft.take() else {
            return Err(DraftError::NotDrafting);
        };
        if draft.pending.is_some() {
            tracing::debug!(event_id = %saved_id, "dropping sync update superseded by commit");
        }
        let mut committed = draft.candidate;
        committed.id = Some(saved_id);
        self.store.put(committed.clone());
        self.publish();
        Ok(committed)
    }

    /// Abandons the local edit; a buffered sync update becomes visible.
    pub fn discard_draft(&mut self) -> Result<(), DraftError> {
        let draft = self.draft.take().ok_or(DraftError::NotDrafting)?;
        match draft.pending {
            Some(PendingSync::Updated(event)) => {
                self.store.apply(event);
            }
            Some(PendingSync::Deleted) => {
                if let Some(key) = draft.original.as_ref().and_then(Event::key) {
                    self.store.remove(&key);
                }
            }
            None => {}
        }
        self.publish();
        Ok(())
    }

    /// Deletes the drafted event through the repository and ends the draft.
    pub async fn delete_draft_target(&mut self) -> Result<(), DraftError> {
        let draft = self.draft.as_ref().ok_or(DraftError::NotDrafting)?;
        let persisted_id = draft
            .original
            .as_ref()
            .and_then(|original| original.id.clone());
        let store_key = draft.original.as_ref().and_then(Event::key);

        if let Some(id) = persisted_id.as_deref() {
            self.repository.delete(id).await.map_err(|error| {
                tracing::warn!(%error, event_id = id, "draft delete failed; keeping draft");
                DraftError::Persistence(error)
            })?;
        }

        self.draft = None;
        if let Some(key) = store_key {
            self.store.remove(&key);
        }
        self.publish();
        Ok(())
    }

    fn publish(&self) -> DraftSnapshot {
        let snapshot = self.snapshot();
        self.snapshot_tx.send_replace(snapshot.clone());
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{EventTime, Origin};
    use crate::infrastructure::event_repository::InMemoryEventRepository;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    struct FlakyRepository {
        inner: InMemoryEventRepository,
        fail: AtomicBool,
        save_calls: AtomicUsize,
    }

    #[async_trait]
    impl EventRepository for FlakyRepository {
        async fn save(&self, event: &Event) -> Result<String, InfraError> {
            self.save_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(InfraError::Persistence("document store unavailable".to_string()));
            }
            self.inner.save(event).await
        }

        async fn delete(&self, event_id: &str) -> Result<(), InfraError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(InfraError::Persistence("document store unavailable".to_string()));
            }
            self.inner.delete(event_id).await
        }

        async fn get(&self, event_id: &str) -> Result<Option<Event>, InfraError> {
            self.inner.get(event_id).await
        }

        async fn list_for_user(&self, user_id: &str) -> Result<Vec<Event>, InfraError> {
            self.inner.list_for_user(user_id).await
        }
    }

    fn event(id: &str, title: &str) -> Event {
        let mut event = Event::new_local(
            "user-1",
            title,
            EventTime::timed("2026-02-16T12:00:00Z"),
            EventTime::timed("2026-02-16T13:00:00Z"),
        );
        event.id = Some(id.to_string());
        event
    }

    fn synced(id: &str, title: &str) -> Event {
        let mut update = event(id, title);
        update.origin = Origin::Google;
        update
    }

    fn reconciler_with(
        events: Vec<Event>,
    ) -> (DraftReconciler<FlakyRepository>, Arc<FlakyRepository>) {
        let repository = Arc::new(FlakyRepository::default());
        let mut reconciler = DraftReconciler::new(Arc::clone(&repository));
        reconciler.apply_sync(events, &[]);
        (reconciler, repository)
    }

    fn stored_title(reconciler: &DraftReconciler<FlakyRepository>, id: &str) -> Option<String> {
        reconciler.store().get(id).map(|event| event.title.clone())
    }

    #[tokio::test]
    async fn local_edit_wins_over_concurrent_sync_on_save() {
        let (mut reconciler, repository) = reconciler_with(vec![event("e1", "Lunch")]);

        reconciler.start_edit("e1").expect("start edit");
        let summary = reconciler.apply_sync(vec![synced("e1", "Lunch with Bob")], &[]);
        assert_eq!(summary.deferred, 1);
        assert!(reconciler.snapshot().conflict_deferred);

        reconciler
            .update_draft(|draft| draft.title = "Lunch (moved)".to_string())
            .expect("edit");
        let committed = reconciler.commit_draft().await.expect("commit");

        assert_eq!(committed.title, "Lunch (moved)");
        assert_eq!(stored_title(&reconciler, "e1").as_deref(), Some("Lunch (moved)"));
        let persisted = repository.get("e1").await.expect("get").expect("persisted");
        assert_eq!(persisted.title, "Lunch (moved)");
        assert_eq!(reconciler.status(), DraftStatus::Idle);
        assert!(!reconciler.snapshot().conflict_deferred);
    }

    #[tokio::test]
    async fn discard_applies_buffered_update() {
        let (mut reconciler, _) = reconciler_with(vec![event("e1", "Lunch")]);

        reconciler.start_edit("e1").expect("start edit");
        reconciler.apply_sync(vec![synced("e1", "Lunch with Bob")], &[]);
        reconciler
            .update_draft(|draft| draft.title = "Lunch (moved)".to_string())
            .expect("edit");

        assert_eq!(stored_title(&reconciler, "e1").as_deref(), Some("Lunch"));
        let snapshot = reconciler.snapshot();
        assert_eq!(
            snapshot.candidate.map(|candidate| candidate.title),
            Some("Lunch (moved)".to_string())
        );

        reconciler.discard_draft().expect("discard");
        assert_eq!(stored_title(&reconciler, "e1").as_deref(), Some("Lunch with Bob"));
        assert_eq!(reconciler.status(), DraftStatus::Idle);
    }

    #[tokio::test]
    async fn updates_for_other_events_apply_immediately() {
        let (mut reconciler, _) =
            reconciler_with(vec![event("e1", "Lunch"), event("e2", "Gym")]);

        reconciler.start_edit("e1").expect("start edit");
        let summary = reconciler.apply_sync(vec![synced("e2", "Gym (cancelled class)")], &[]);

        assert_eq!(summary.applied, 1);
        assert_eq!(summary.deferred, 0);
        assert_eq!(
            stored_title(&reconciler, "e2").as_deref(),
            Some("Gym (cancelled class)")
        );
        assert!(!reconciler.snapshot().conflict_deferred);
    }

    #[tokio::test]
    async fn failed_commit_keeps_draft_and_edits() {
        let (mut reconciler, repository) = reconciler_with(vec![event("e1", "Lunch")]);
        reconciler.start_edit("e1").expect("start edit");
        reconciler
            .update_draft(|draft| draft.title = "Lunch (moved)".to_string())
            .expect("edit");

        repository.fail.store(true, Ordering::SeqCst);
        let result = reconciler.commit_draft().await;
        assert!(matches!(result, Err(DraftError::Persistence(_))));
        assert_eq!(reconciler.status(), DraftStatus::Drafting);
        assert_eq!(
            reconciler.snapshot().candidate.map(|candidate| candidate.title),
            Some("Lunch (moved)".to_string())
        );

        repository.fail.store(false, Ordering::SeqCst);
        let committed = reconciler.commit_draft().await.expect("retry commit");
        assert_eq!(committed.title, "Lunch (moved)");
        assert_eq!(repository.save_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn new_event_gets_identifier_on_commit() {
        let (mut reconciler, repository) = reconciler_with(Vec::new());
        let mut fresh = event("unused", "Focus time");
        fresh.id = None;

        let snapshot = reconciler.start_create(fresh).expect("start create");
        assert!(snapshot.original.is_none());
        let committed = reconciler.commit_draft().await.expect("commit");

        let id = committed.id.clone().expect("assigned id");
        assert!(repository.get(&id).await.expect("get").is_some());
        assert_eq!(stored_title(&reconciler, &id).as_deref(), Some("Focus time"));
    }

    #[test]
    fn only_one_draft_at_a_time() {
        let (mut reconciler, _) = reconciler_with(vec![event("e1", "Lunch"), event("e2", "Gym")]);
        reconciler.start_edit("e1").expect("start edit");

        assert!(matches!(reconciler.start_edit("e2"), Err(DraftError::AlreadyDrafting)));
        assert!(matches!(
            reconciler.start_create(event("e3", "Other")),
            Err(DraftError::AlreadyDrafting)
        ));
    }

    #[test]
    fn operations_without_draft_are_rejected() {
        let (mut reconciler, _) = reconciler_with(Vec::new());
        assert!(matches!(reconciler.discard_draft(), Err(DraftError::NotDrafting)));
        assert!(matches!(
            reconciler.update_draft(|draft| draft.title.clear()),
            Err(DraftError::NotDrafting)
        ));
        assert!(matches!(
            reconciler.start_edit("missing"),
            Err(DraftError::EventNotFound(_))
        ));
    }

    #[test]
    fn identity_edits_are_refused() {
        let (mut reconciler, _) = reconciler_with(vec![event("e1", "Lunch")]);
        reconciler.start_edit("e1").expect("start edit");

        let result = reconciler.update_draft(|draft| draft.origin = Origin::Unsure);
        assert!(matches!(result, Err(DraftError::Invalid(_))));
        assert_eq!(
            reconciler.snapshot().candidate.map(|candidate| candidate.origin),
            Some(Origin::Compass)
        );
    }

    #[tokio::test]
    async fn buffered_deletion_applies_on_discard_only() {
        let (mut reconciler, _) = reconciler_with(vec![event("e1", "Lunch")]);
        reconciler.start_edit("e1").expect("start edit");

        let summary = reconciler.apply_sync(Vec::new(), &[EventKey::new("primary", "e1")]);
        assert_eq!(summary.deferred, 1);
        assert_eq!(reconciler.pending_sync(), Some(&PendingSync::Deleted));
        assert!(reconciler.store().get("e1").is_some());

        reconciler.discard_draft().expect("discard");
        assert!(reconciler.store().get("e1").is_none());
    }

    #[test]
    fn cancellation_in_one_calendar_keeps_the_other_copy() {
        let mut shared = synced("unused", "Offsite");
        shared.id = None;
        shared.g_event_id = Some("shared-g1".to_string());
        let (mut reconciler, _) =
            reconciler_with(vec![shared.clone(), shared.clone().in_calendar("work")]);
        assert_eq!(reconciler.store().len(), 2);

        let summary = reconciler.apply_sync(Vec::new(), &[EventKey::new("work", "shared-g1")]);
        assert_eq!(summary.removed, 1);
        assert_eq!(reconciler.store().len(), 1);
        assert!(reconciler
            .store()
            .get_in(&EventKey::new("primary", "shared-g1"))
            .is_some());
    }

    #[test]
    fn update_from_other_calendar_is_not_deferred() {
        let mut shared = synced("unused", "Offsite");
        shared.id = None;
        shared.g_event_id = Some("shared-g1".to_string());
        let (mut reconciler, _) =
            reconciler_with(vec![shared.clone(), shared.clone().in_calendar("work")]);
        reconciler.start_edit("shared-g1").expect("start edit");
        let drafted_calendar = reconciler
            .snapshot()
            .original
            .map(|original| original.calendar_id)
            .expect("original");
        let other_calendar = if drafted_calendar == "work" { "primary" } else { "work" };

        let mut update = shared.clone().in_calendar(other_calendar);
        update.title = "Offsite (room 4)".to_string();
        let summary = reconciler.apply_sync(vec![update], &[]);

        assert_eq!(summary.deferred, 0);
        assert_eq!(summary.applied, 1);
        assert!(!reconciler.snapshot().conflict_deferred);
    }

    #[tokio::test]
    async fn delete_draft_target_removes_persisted_event() {
        let (mut reconciler, repository) = reconciler_with(Vec::new());
        reconciler.start_create(event("e9", "Dentist")).expect("create");
        reconciler.commit_draft().await.expect("commit");
        assert!(repository.get("e9").await.expect("get").is_some());

        reconciler.start_edit("e9").expect("edit");
        repository.fail.store(true, Ordering::SeqCst);
        assert!(reconciler.delete_draft_target().await.is_err());
        assert_eq!(reconciler.status(), DraftStatus::Drafting);

        repository.fail.store(false, Ordering::SeqCst);
        reconciler.delete_draft_target().await.expect("delete");
        assert!(repository.get("e9").await.expect("get").is_none());
        assert!(reconciler.store().get("e9").is_none());
    }

    #[tokio::test]
    async fn subscribers_observe_draft_transitions() {
        let (mut reconciler, _) = reconciler_with(vec![event("e1", "Lunch")]);
        let mut receiver = reconciler.subscribe();
        assert_eq!(receiver.borrow().status, DraftStatus::Idle);

        reconciler.start_edit("e1").expect("start edit");
        receiver.changed().await.expect("changed");
        assert_eq!(receiver.borrow_and_update().status, DraftStatus::Drafting);

        reconciler.apply_sync(vec![synced("e1", "Lunch with Bob")], &[]);
        receiver.changed().await.expect("changed");
        assert!(receiver.borrow_and_update().conflict_deferred);

        reconciler.discard_draft().expect("discard");
        receiver.changed().await.expect("changed");
        assert_eq!(receiver.borrow_and_update().status, DraftStatus::Idle);
    }

    #[tokio::test]
    async fn load_user_events_primes_store() {
        let repository = Arc::new(FlakyRepository::default());
        repository.save(&event("e1", "Lunch")).await.expect("seed");
        let mut reconciler = DraftReconciler::new(Arc::clone(&repository));

        assert_eq!(reconciler.load_user_events("user-1").await.expect("load"), 1);
        assert_eq!(stored_title(&reconciler, "e1").as_deref(), Some("Lunch"));
    }
}
