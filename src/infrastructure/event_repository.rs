use crate::domain::models::Event;
use crate::infrastructure::error::InfraError;
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Per-repository source of internal event ids.
#[derive(Debug, Default)]
pub struct EventIdGenerator {
    sequence: AtomicU64,
}

impl EventIdGenerator {
    pub fn next_id(&self) -> String {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        format!("evt-{}-{sequence}", Utc::now().timestamp_micros())
    }
}

/// Durable event storage used when a draft is committed or deleted.
#[async_trait]
pub trait EventRepository: Send + Sync {
    /// Stores the event, assigning an id when it has none, and returns the id.
    async fn save(&self, event: &Event) -> Result<String, InfraError>;
    async fn delete(&self, event_id: &str) -> Result<(), InfraError>;
    async fn get(&self, event_id: &str) -> Result<Option<Event>, InfraError>;
    async fn list_for_user(&self, user_id: &str) -> Result<Vec<Event>, InfraError>;
}

fn assign_id(event: &Event, ids: &EventIdGenerator) -> Result<Event, InfraError> {
    event
        .validate()
        .map_err(|message| InfraError::Persistence(format!("refusing to save invalid event: {message}")))?;
    let mut stored = event.clone();
    if stored.id.is_none() {
        stored.id = Some(ids.next_id());
    }
    Ok(stored)
}

#[derive(Debug)]
pub struct SqliteEventRepository {
    db_path: PathBuf,
    ids: EventIdGenerator,
}

impl SqliteEventRepository {
    pub fn new(db_path: impl AsRef<Path>) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
            ids: EventIdGenerator::default(),
        }
    }

    fn connect(&self) -> Result<Connection, InfraError> {
        Connection::open(&self.db_path).map_err(InfraError::from)
    }
}

#[async_trait]
impl EventRepository for SqliteEventRepository {
    async fn save(&self, event: &Event) -> Result<String, InfraError> {
        let stored = assign_id(event, &self.ids)?;
        let id = stored.id.clone().unwrap_or_default();
        let payload = serde_json::to_string(&stored)?;
        let connection = self.connect()?;
        connection.execute(
            "INSERT INTO events (id, user_id, g_event_id, payload, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
               user_id = excluded.user_id,
               g_event_id = excluded.g_event_id,
               payload = excluded.payload,
               updated_at = excluded.updated_at",
            params![
                id,
                stored.user,
                stored.g_event_id,
                payload,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(id)
    }

    async fn delete(&self, event_id: &str) -> Result<(), InfraError> {
        let connection = self.connect()?;
        connection.execute("DELETE FROM events WHERE id = ?1", params![event_id.trim()])?;
        Ok(())
    }

    async fn get(&self, event_id: &str) -> Result<Option<Event>, InfraError> {
        let connection = self.connect()?;
        let payload: Option<String> = connection
            .query_row(
                "SELECT payload FROM events WHERE id = ?1",
                params![event_id.trim()],
                |row| row.get(0),
            )
            .optional()?;
        payload
            .map(|payload| serde_json::from_str(&payload).map_err(InfraError::from))
            .transpose()
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<Event>, InfraError> {
        let connection = self.connect()?;
        let mut statement =
            connection.prepare("SELECT payload FROM events WHERE user_id = ?1 ORDER BY id")?;
        let payloads = statement
            .query_map(params![user_id.trim()], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        payloads
            .iter()
            .map(|payload| serde_json::from_str(payload).map_err(InfraError::from))
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct InMemoryEventRepository {
    events: Mutex<HashMap<String, Event>>,
    ids: EventIdGenerator,
}

impl InMemoryEventRepository {
    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Event>>, InfraError> {
        self.events
            .lock()
            .map_err(|error| InfraError::lock_poisoned("event repository", error))
    }
}

#[async_trait]
impl EventRepository for InMemoryEventRepository {
    async fn save(&self, event: &Event) -> Result<String, InfraError> {
        let stored = assign_id(event, &self.ids)?;
        let id = stored.id.clone().unwrap_or_default();
        self.lock()?.insert(id.clone(), stored);
        Ok(id)
    }

    async fn delete(&self, event_id: &str) -> Result<(), InfraError> {
        self.lock()?.remove(event_id.trim());
        Ok(())
    }

    async fn get(&self, event_id: &str) -> Result<Option<Event>, InfraError> {
        Ok(self.lock()?.get(event_id.trim()).cloned())
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<Event>, InfraError> {
        let mut events: Vec<Event> = self
            .lock()?
            .values()
            .filter(|event| event.user == user_id.trim())
            .cloned()
            .collect();
        events.sort_by(|left, right| left.id.cmp(&right.id));
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::EventTime;
    use crate::infrastructure::storage::initialize_database;
    use std::fs;
    use std::sync::atomic::AtomicUsize;

    static NEXT_TEMP_ID: AtomicUsize = AtomicUsize::new(0);

    fn temp_database() -> PathBuf {
        let sequence = NEXT_TEMP_ID.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!(
            "compass-sync-events-{}-{sequence}",
            std::process::id()
        ));
        fs::create_dir_all(&dir).expect("create temp dir");
        let path = dir.join("events.sqlite");
        let _ = fs::remove_file(&path);
        initialize_database(&path).expect("initialize database");
        path
    }

    fn sample_event(title: &str) -> Event {
        Event::new_local(
            "user-1",
            title,
            EventTime::timed("2026-02-16T12:00:00Z"),
            EventTime::timed("2026-02-16T13:00:00Z"),
        )
    }

    async fn exercise_repository(repository: &dyn EventRepository) {
        let id = repository.save(&sample_event("Lunch")).await.expect("save new");
        assert!(!id.is_empty());

        let mut stored = repository.get(&id).await.expect("get").expect("stored");
        assert_eq!(stored.id.as_deref(), Some(id.as_str()));
        assert_eq!(stored.title, "Lunch");

        stored.title = "Lunch (moved)".to_string();
        let same_id = repository.save(&stored).await.expect("save existing");
        assert_eq!(same_id, id);
        assert_eq!(repository.list_for_user("user-1").await.expect("list").len(), 1);

        repository.delete(&id).await.expect("delete");
        assert!(repository.get(&id).await.expect("get deleted").is_none());
    }

    #[tokio::test]
    async fn in_memory_repository_saves_and_deletes() {
        exercise_repository(&InMemoryEventRepository::default()).await;
    }

    #[tokio::test]
    async fn sqlite_repository_saves_and_deletes() {
        exercise_repository(&SqliteEventRepository::new(temp_database())).await;
    }

    #[tokio::test]
    async fn invalid_events_are_rejected() {
        let repository = InMemoryEventRepository::default();
        let mut event = sample_event("Broken");
        event.end = EventTime::timed("2026-02-16T11:00:00Z");

        let result = repository.save(&event).await;
        assert!(matches!(result, Err(InfraError::Persistence(_))));
    }

    #[test]
    fn generated_ids_are_unique() {
        let ids = EventIdGenerator::default();
        assert_ne!(ids.next_id(), ids.next_id());
    }
}
