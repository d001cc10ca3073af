use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const DEFAULT_CALENDAR_ID: &str = "primary";

fn default_calendar_id() -> String {
    DEFAULT_CALENDAR_ID.to_string()
}

/// Provenance of an event. Set once when the event is created and never
/// rewritten by later sync passes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Compass,
    Google,
    GoogleImport,
    Unsure,
}

impl Origin {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Compass => "compass",
            Self::Google => "google",
            Self::GoogleImport => "googleimport",
            Self::Unsure => "unsure",
        }
    }

    pub fn from_label(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "compass" => Self::Compass,
            "google" => Self::Google,
            "googleimport" | "google_import" => Self::GoogleImport,
            _ => Self::Unsure,
        }
    }

    pub fn is_known(self) -> bool {
        !matches!(self, Self::Unsure)
    }

    /// Whether an update carrying `self` may overwrite an event stored with
    /// `existing`. Unsure never overrides a known origin.
    pub fn may_override(self, existing: Origin) -> bool {
        match (self, existing) {
            (Self::Unsure, existing) => !existing.is_known(),
            (Self::Compass | Self::Google | Self::GoogleImport, _) => true,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Work,
    #[serde(rename = "self")]
    Self_,
    Relationships,
    #[default]
    Unassigned,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Work => "work",
            Self::Self_ => "self",
            Self::Relationships => "relationships",
            Self::Unassigned => "unassigned",
        }
    }

    pub fn from_label(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "work" => Self::Work,
            "self" => Self::Self_,
            "relationships" => Self::Relationships,
            _ => Self::Unassigned,
        }
    }
}

/// A start or end boundary. `value` is an RFC 3339 date-time for timed events
/// and a `YYYY-MM-DD` date for all-day events, kept exactly as received.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventTime {
    pub value: String,
    pub time_zone: Option<String>,
}

impl EventTime {
    pub fn timed(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            time_zone: None,
        }
    }

    pub fn all_day(date: impl Into<String>) -> Self {
        Self {
            value: date.into(),
            time_zone: None,
        }
    }

    pub fn instant(&self, is_all_day: bool) -> Option<DateTime<Utc>> {
        if is_all_day {
            NaiveDate::parse_from_str(&self.value, "%Y-%m-%d")
                .ok()
                .and_then(|date| date.and_hms_opt(0, 0, 0))
                .map(|naive| naive.and_utc())
        } else {
            DateTime::parse_from_rfc3339(&self.value)
                .ok()
                .map(|value| value.with_timezone(&Utc))
        }
    }
}

/// Provider fields carried through untouched: sync metadata plus everything
/// the internal schema does not model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ProviderPayload {
    pub etag: Option<String>,
    pub updated: Option<String>,
    pub status: Option<String>,
    #[serde(default)]
    pub private_properties: HashMap<String, String>,
    #[serde(default)]
    pub shared_properties: HashMap<String, String>,
    #[serde(default)]
    pub extra: serde_json::Map<String, serde_json::Value>,
    /// The provider sent `summary: ""` rather than omitting it.
    #[serde(default)]
    pub empty_summary: bool,
    /// The provider copy had no `extendedProperties` object at all.
    #[serde(default)]
    pub extended_properties_absent: bool,
    /// Raw tagging keys (origin, priority, internal id) as the provider copy
    /// carried them. `None` when they match what the event would write.
    #[serde(default)]
    pub tagged_properties: Option<HashMap<String, String>>,
}

impl ProviderPayload {
    pub fn is_empty(&self) -> bool {
        self.etag.is_none()
            && self.updated.is_none()
            && self.status.is_none()
            && self.private_properties.is_empty()
            && self.shared_properties.is_empty()
            && self.extra.is_empty()
            && !self.empty_summary
            && !self.extended_properties_absent
            && self.tagged_properties.is_none()
    }
}

/// Identity of an event within one calendar. The provider reuses an event's
/// id on every calendar it appears on, so ids alone are not unique.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventKey {
    pub calendar_id: String,
    pub event_id: String,
}

impl EventKey {
    pub fn new(calendar_id: impl Into<String>, event_id: impl Into<String>) -> Self {
        Self {
            calendar_id: calendar_id.into(),
            event_id: event_id.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub id: Option<String>,
    pub user: String,
    #[serde(default = "default_calendar_id")]
    pub calendar_id: String,
    pub title: String,
    pub description: Option<String>,
    pub start: EventTime,
    pub end: EventTime,
    pub is_all_day: bool,
    pub origin: Origin,
    #[serde(default)]
    pub priority: Priority,
    pub recurrence: Option<Vec<String>>,
    pub g_event_id: Option<String>,
    #[serde(default)]
    pub provider: ProviderPayload,
}

impl Event {
    /// A locally created, unsaved event.
    pub fn new_local(
        user: impl Into<String>,
        title: impl Into<String>,
        start: EventTime,
        end: EventTime,
    ) -> Self {
        Self {
            id: None,
            user: user.into(),
            calendar_id: default_calendar_id(),
            title: title.into(),
            description: None,
            start,
            end,
            is_all_day: false,
            origin: Origin::Compass,
            priority: Priority::Unassigned,
            recurrence: None,
            g_event_id: None,
            provider: ProviderPayload::default(),
        }
    }

    pub fn in_calendar(mut self, calendar_id: impl Into<String>) -> Self {
        self.calendar_id = calendar_id.into();
        self
    }

    pub fn key(&self) -> Option<EventKey> {
        self.logical_id()
            .map(|event_id| EventKey::new(self.calendar_id.clone(), event_id))
    }

    pub fn matches_key(&self, key: &EventKey) -> bool {
        self.calendar_id == key.calendar_id && self.matches(&key.event_id)
    }

    /// Identity used to match sync updates, drafts and store entries: the
    /// internal id, or the external id for events never stored internally.
    pub fn logical_id(&self) -> Option<&str> {
        self.id
            .as_deref()
            .or(self.g_event_id.as_deref())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    pub fn matches(&self, key: &str) -> bool {
        let key = key.trim();
        if key.is_empty() {
            return false;
        }
        self.id.as_deref() == Some(key) || self.g_event_id.as_deref() == Some(key)
    }

    pub fn start_at(&self) -> Option<DateTime<Utc>> {
        self.start.instant(self.is_all_day)
    }

    pub fn end_at(&self) -> Option<DateTime<Utc>> {
        self.end.instant(self.is_all_day)
    }

    pub fn validate(&self) -> Result<(), String> {
        validate_non_empty(&self.user, "event.user")?;
        validate_non_empty(&self.calendar_id, "event.calendar_id")?;
        validate_identifier(self.id.as_deref(), "event.id")?;
        validate_identifier(self.g_event_id.as_deref(), "event.g_event_id")?;
        let kind = if self.is_all_day { "date" } else { "dateTime" };
        let start_at = self
            .start_at()
            .ok_or_else(|| format!("event.start is not a valid {kind}: '{}'", self.start.value))?;
        let end_at = self
            .end_at()
            .ok_or_else(|| format!("event.end is not a valid {kind}: '{}'", self.end.value))?;
        if end_at < start_at {
            return Err("event.end must not be before event.start".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WatchChannel {
    pub channel_id: String,
    pub resource_id: String,
    pub expiration: DateTime<Utc>,
}

impl WatchChannel {
    pub fn validate(&self) -> Result<(), String> {
        validate_non_empty(&self.channel_id, "watch.channel_id")?;
        validate_non_empty(&self.resource_id, "watch.resource_id")
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiration <= now
    }
}

/// One subscribed calendar of a user, owning its incremental sync cursor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CalendarListEntry {
    pub user_id: String,
    pub calendar_id: String,
    pub next_sync_token: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub watch: Option<WatchChannel>,
}

fn validate_non_empty(value: &str, field_name: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        return Err(format!("{field_name} must not be empty"));
    }
    Ok(())
}

fn validate_identifier(value: Option<&str>, field_name: &str) -> Result<(), String> {
    match value {
        Some(value) if value.is_empty() || value.trim() != value => Err(format!(
            "{field_name} must be non-empty without surrounding whitespace"
        )),
        _ => Ok(()),
    }
}
