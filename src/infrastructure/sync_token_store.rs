use crate::domain::models::{CalendarListEntry, WatchChannel};
use crate::infrastructure::error::InfraError;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Per (user, calendar) incremental sync cursor plus push-channel metadata.
/// Cursor writes replace the previous value in one step; readers never see a
/// partially written cursor.
pub trait SyncTokenStore: Send + Sync {
    fn get_cursor(&self, user_id: &str, calendar_id: &str) -> Result<Option<String>, InfraError>;
    fn set_cursor(
        &self,
        user_id: &str,
        calendar_id: &str,
        token: &str,
        synced_at: DateTime<Utc>,
    ) -> Result<(), InfraError>;
    /// Drops the cursor so the next sync is a full one.
    fn clear_cursor(&self, user_id: &str, calendar_id: &str) -> Result<(), InfraError>;
    fn save_watch(
        &self,
        user_id: &str,
        calendar_id: &str,
        watch: &WatchChannel,
    ) -> Result<(), InfraError>;
    fn clear_watch(&self, user_id: &str, calendar_id: &str) -> Result<(), InfraError>;
    fn find_by_channel(&self, channel_id: &str) -> Result<Option<CalendarListEntry>, InfraError>;
    fn list_entries(&self, user_id: &str) -> Result<Vec<CalendarListEntry>, InfraError>;
    fn expiring_watches(&self, before: DateTime<Utc>) -> Result<Vec<CalendarListEntry>, InfraError>;
}

fn normalized_key(user_id: &str, calendar_id: &str) -> Result<(String, String), InfraError> {
    let user_id = user_id.trim();
    let calendar_id = calendar_id.trim();
    if user_id.is_empty() || calendar_id.is_empty() {
        return Err(InfraError::InvalidConfig(
            "user id and calendar id are required for sync state".to_string(),
        ));
    }
    Ok((user_id.to_string(), calendar_id.to_string()))
}

#[derive(Debug, Clone)]
pub struct SqliteSyncTokenStore {
    db_path: PathBuf,
}

impl SqliteSyncTokenStore {
    pub fn new(db_path: impl AsRef<Path>) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
        }
    }

    fn connect(&self) -> Result<Connection, InfraError> {
        Connection::open(&self.db_path).map_err(InfraError::from)
    }

    fn query_entries(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<CalendarListEntry>, InfraError> {
        let connection = self.connect()?;
        let mut statement = connection.prepare(sql)?;
        let rows = statement
            .query_map(params, read_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(RawEntry::into_entry).collect()
    }
}

const SELECT_ENTRY: &str = "SELECT user_id, calendar_id, next_sync_token, last_synced_at,
        channel_id, resource_id, channel_expiration
   FROM calendar_sync";

struct RawEntry {
    user_id: String,
    calendar_id: String,
    next_sync_token: Option<String>,
    last_synced_at: Option<String>,
    channel_id: Option<String>,
    resource_id: Option<String>,
    channel_expiration: Option<String>,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawEntry> {
    Ok(RawEntry {
        user_id: row.get(0)?,
        calendar_id: row.get(1)?,
        next_sync_token: row.get(2)?,
        last_synced_at: row.get(3)?,
        channel_id: row.get(4)?,
        resource_id: row.get(5)?,
        channel_expiration: row.get(6)?,
    })
}

impl RawEntry {
    fn into_entry(self) -> Result<CalendarListEntry, InfraError> {
        let last_synced_at = self
            .last_synced_at
            .as_deref()
            .map(|value| parse_timestamp(value, "calendar_sync.last_synced_at"))
            .transpose()?;
        let watch = match (self.channel_id, self.resource_id, self.channel_expiration) {
            (Some(channel_id), Some(resource_id), Some(expiration)) => Some(WatchChannel {
                channel_id,
                resource_id,
                expiration: parse_timestamp(&expiration, "calendar_sync.channel_expiration")?,
            }),
            _ => None,
        };
        Ok(CalendarListEntry {
            user_id: self.user_id,
            calendar_id: self.calendar_id,
            next_sync_token: self.next_sync_token,
            last_synced_at,
            watch,
        })
    }
}

fn parse_timestamp(value: &str, field_name: &str) -> Result<DateTime<Utc>, InfraError> {
    DateTime::parse_from_rfc3339(value)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|error| InfraError::InvalidConfig(format!("invalid {field_name} '{value}': {error}")))
}

impl SyncTokenStore for SqliteSyncTokenStore {
    fn get_cursor(&self, user_id: &str, calendar_id: &str) -> Result<Option<String>, InfraError> {
        let (user_id, calendar_id) = normalized_key(user_id, calendar_id)?;
        let connection = self.connect()?;
        let token: Option<Option<String>> = connection
            .query_row(
                "SELECT next_sync_token FROM calendar_sync WHERE user_id = ?1 AND calendar_id = ?2",
                params![user_id, calendar_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(token.flatten())
    }

    fn set_cursor(
        &self,
        user_id: &str,
        calendar_id: &str,
        token: &str,
        synced_at: DateTime<Utc>,
    ) -> Result<(), InfraError> {
        let (user_id, calendar_id) = normalized_key(user_id, calendar_id)?;
        let connection = self.connect()?;
        connection.execute(
            "INSERT INTO calendar_sync (user_id, calendar_id, next_sync_token, last_synced_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(user_id, calendar_id) DO UPDATE SET
               next_sync_token = excluded.next_sync_token,
               last_synced_at = excluded.last_synced_at",
            params![user_id, calendar_id, token, synced_at.to_rfc3339()],
        )?;
        Ok(())
    }

    fn clear_cursor(&self, user_id: &str, calendar_id: &str) -> Result<(), InfraError> {
        let (user_id, calendar_id) = normalized_key(user_id, calendar_id)?;
        let connection = self.connect()?;
        connection.execute(
            "UPDATE calendar_sync SET next_sync_token = NULL WHERE user_id = ?1 AND calendar_id = ?2",
            params![user_id, calendar_id],
        )?;
        Ok(())
    }

    fn save_watch(
        &self,
        user_id: &str,
        calendar_id: &str,
        watch: &WatchChannel,
    ) -> Result<(), InfraError> {
        let (user_id, calendar_id) = normalized_key(user_id, calendar_id)?;
        watch.validate().map_err(InfraError::InvalidConfig)?;
        let connection = self.connect()?;
        connection.execute(
            "INSERT INTO calendar_sync (user_id, calendar_id, channel_id, resource_id, channel_expiration)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(user_id, calendar_id) DO UPDATE SET
               channel_id = excluded.channel_id,
               resource_id = excluded.resource_id,
               channel_expiration = excluded.channel_expiration",
            params![
                user_id,
                calendar_id,
                watch.channel_id,
                watch.resource_id,
                watch.expiration.to_rfc3339()
            ],
        )?;
        Ok(())
    }

    fn clear_watch(&self, user_id: &str, calendar_id: &str) -> Result<(), InfraError> {
        let (user_id, calendar_id) = normalized_key(user_id, calendar_id)?;
        let connection = self.connect()?;
        connection.execute(
            "UPDATE calendar_sync
               SET channel_id = NULL, resource_id = NULL, channel_expiration = NULL
             WHERE user_id = ?1 AND calendar_id = ?2",
            params![user_id, calendar_id],
        )?;
        Ok(())
    }

    fn find_by_channel(&self, channel_id: &str) -> Result<Option<CalendarListEntry>, InfraError> {
        let channel_id = channel_id.trim();
        if channel_id.is_empty() {
            return Ok(None);
        }
        let sql = format!("{SELECT_ENTRY} WHERE channel_id = ?1 LIMIT 1");
        Ok(self.query_entries(&sql, params![channel_id])?.into_iter().next())
    }

    fn list_entries(&self, user_id: &str) -> Result<Vec<CalendarListEntry>, InfraError> {
        let sql = format!("{SELECT_ENTRY} WHERE user_id = ?1 ORDER BY calendar_id");
        self.query_entries(&sql, params![user_id.trim()])
    }

    fn expiring_watches(&self, before: DateTime<Utc>) -> Result<Vec<CalendarListEntry>, InfraError> {
        let sql = format!("{SELECT_ENTRY} WHERE channel_expiration IS NOT NULL ORDER BY user_id, calendar_id");
        let entries = self.query_entries(&sql, params![])?;
        Ok(entries
            .into_iter()
            .filter(|entry| {
                entry
                    .watch
                    .as_ref()
                    .map(|watch| watch.expiration <= before)
                    .unwrap_or(false)
            })
            .collect())
    }
}

#[derive(Debug, Default)]
pub struct InMemorySyncTokenStore {
    entries: Mutex<HashMap<(String, String), CalendarListEntry>>,
}

impl InMemorySyncTokenStore {
    fn with_entries<T>(
        &self,
        action: impl FnOnce(&mut HashMap<(String, String), CalendarListEntry>) -> T,
    ) -> Result<T, InfraError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|error| InfraError::lock_poisoned("sync token store", error))?;
        Ok(action(&mut entries))
    }

    fn entry_mut<'a>(
        entries: &'a mut HashMap<(String, String), CalendarListEntry>,
        key: (String, String),
    ) -> &'a mut CalendarListEntry {
        let (user_id, calendar_id) = key.clone();
        entries.entry(key).or_insert_with(|| CalendarListEntry {
            user_id,
            calendar_id,
            next_sync_token: None,
            last_synced_at: None,
            watch: None,
        })
    }
}

impl SyncTokenStore for InMemorySyncTokenStore {
    fn get_cursor(&self, user_id: &str, calendar_id: &str) -> Result<Option<String>, InfraError> {
        let key = normalized_key(user_id, calendar_id)?;
        self.with_entries(|entries| {
            entries
                .get(&key)
                .and_then(|entry| entry.next_sync_token.clone())
        })
    }

    fn set_cursor(
        &self,
        user_id: &str,
        calendar_id: &str,
        token: &str,
        synced_at: DateTime<Utc>,
    ) -> Result<(), InfraError> {
        let key = normalized_key(user_id, calendar_id)?;
        self.with_entries(|entries| {
            let entry = Self::entry_mut(entries, key);
            entry.next_sync_token = Some(token.to_string());
            entry.last_synced_at = Some(synced_at);
        })
    }

    fn clear_cursor(&self, user_id: &str, calendar_id: &str) -> Result<(), InfraError> {
        let key = normalized_key(user_id, calendar_id)?;
        self.with_entries(|entries| {
            if let Some(entry) = entries.get_mut(&key) {
                entry.next_sync_token = None;
            }
        })
    }

    fn save_watch(
        &self,
        user_id: &str,
        calendar_id: &str,
        watch: &WatchChannel,
    ) -> Result<(), InfraError> {
        let key = normalized_key(user_id, calendar_id)?;
        watch.validate().map_err(InfraError::InvalidConfig)?;
        self.with_entries(|entries| {
            Self::entry_mut(entries, key).watch = Some(watch.clone());
        })
    }

    fn clear_watch(&self, user_id: &str, calendar_id: &str) -> Result<(), InfraError> {
        let key = normalized_key(user_id, calendar_id)?;
        self.with_entries(|entries| {
            if let Some(entry) = entries.get_mut(&key) {
                entry.watch = None;
            }
        })
    }

    fn find_by_channel(&self, channel_id: &str) -> Result<Option<CalendarListEntry>, InfraError> {
        let channel_id = channel_id.trim();
        if channel_id.is_empty() {
            return Ok(None);
        }
        self.with_entries(|entries| {
            entries
                .values()
                .find(|entry| {
                    entry
                        .watch
                        .as_ref()
                        .map(|watch| watch.channel_id == channel_id)
                        .unwrap_or(false)
                })
                .cloned()
        })
    }

    fn list_entries(&self, user_id: &str) -> Result<Vec<CalendarListEntry>, InfraError> {
        let user_id = user_id.trim();
        self.with_entries(|entries| {
            let mut listed: Vec<CalendarListEntry> = entries
                .values()
                .filter(|entry| entry.user_id == user_id)
                .cloned()
                .collect();
            listed.sort_by(|left, right| left.calendar_id.cmp(&right.calendar_id));
            listed
        })
    }

    fn expiring_watches(&self, before: DateTime<Utc>) -> Result<Vec<CalendarListEntry>, InfraError> {
        self.with_entries(|entries| {
            let mut expiring: Vec<CalendarListEntry> = entries
                .values()
                .filter(|entry| {
                    entry
                        .watch
                        .as_ref()
                        .map(|watch| watch.expiration <= before)
                        .unwrap_or(false)
                })
                .cloned()
                .collect();
            expiring.sort_by(|left, right| {
                (&left.user_id, &left.calendar_id).cmp(&(&right.user_id, &right.calendar_id))
            });
            expiring
        })
    }
}
