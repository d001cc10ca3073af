use crate::domain::models::{Event, EventTime, Origin, Priority, ProviderPayload};
use crate::infrastructure::error::InfraError;
use std::collections::HashMap;

const KEY_ORIGIN: &str = "origin";
const KEY_PRIORITY: &str = "priority";
const KEY_EVENT_ID: &str = "compassEventId";

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq, Default)]
pub struct CalendarEventDateTime {
    #[serde(rename = "dateTime", skip_serializing_if = "Option::is_none")]
    pub date_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(rename = "timeZone", skip_serializing_if = "Option::is_none")]
    pub time_zone: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq, Default)]
pub struct CalendarEventExtendedProperties {
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub private: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub shared: HashMap<String, String>,
}

/// Provider-side event. Every field is optional so that a structurally odd
/// item still decodes and can be judged by the mapper; unknown fields are
/// collected in `extra`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Default)]
pub struct GoogleCalendarEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<CalendarEventDateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<CalendarEventDateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recurrence: Option<Vec<String>>,
    #[serde(rename = "extendedProperties", skip_serializing_if = "Option::is_none")]
    pub extended_properties: Option<CalendarEventExtendedProperties>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl GoogleCalendarEvent {
    pub fn is_cancelled(&self) -> bool {
        self.status
            .as_deref()
            .map(|status| status.eq_ignore_ascii_case("cancelled"))
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MappedBatch {
    pub events: Vec<Event>,
    pub malformed: usize,
}

pub fn decode_event(value: serde_json::Value) -> Result<GoogleCalendarEvent, InfraError> {
    serde_json::from_value(value)
        .map_err(|error| InfraError::MalformedInput(format!("undecodable calendar event: {error}")))
}

/// Maps a provider batch from one calendar into internal events. Malformed
/// entries are skipped and counted; they never abort the batch.
pub fn to_internal(
    user_id: &str,
    calendar_id: &str,
    events: &[GoogleCalendarEvent],
    origin: Origin,
) -> MappedBatch {
    let mut batch = MappedBatch::default();
    for (index, event) in events.iter().enumerate() {
        match map_event(user_id, calendar_id, event, origin) {
            Ok(mapped) => batch.events.push(mapped),
            Err(error) => {
                tracing::warn!(
                    index,
                    calendar_id,
                    g_event_id = event.id.as_deref().unwrap_or(""),
                    %error,
                    "skipping malformed calendar event"
                );
                batch.malformed += 1;
            }
        }
    }
    batch
}

/// Inverse of `to_internal`. Provider fields the event came with are written
/// back exactly; tagging keys are only added where the event needs them.
pub fn to_external(event: &Event) -> GoogleCalendarEvent {
    let tags = match &event.provider.tagged_properties {
        None => canonical_tags(event.origin, event.priority, event.id.as_deref()),
        Some(raw) => retag(raw, event),
    };
    let mut private = event.provider.private_properties.clone();
    private.extend(tags);
    let shared = event.provider.shared_properties.clone();

    let extended_properties = if event.provider.extended_properties_absent
        && private.is_empty()
        && shared.is_empty()
    {
        None
    } else {
        Some(CalendarEventExtendedProperties { private, shared })
    };
    let summary = if event.title.is_empty() && !event.provider.empty_summary {
        None
    } else {
        Some(event.title.clone())
    };

    GoogleCalendarEvent {
        id: event.g_event_id.clone(),
        summary,
        description: event.description.clone(),
        status: event.provider.status.clone(),
        updated: event.provider.updated.clone(),
        etag: event.provider.etag.clone(),
        start: Some(encode_boundary(&event.start, event.is_all_day)),
        end: Some(encode_boundary(&event.end, event.is_all_day)),
        recurrence: event.recurrence.clone(),
        extended_properties,
        extra: event.provider.extra.clone(),
    }
}

fn canonical_tags(origin: Origin, priority: Priority, id: Option<&str>) -> HashMap<String, String> {
    let mut tags = HashMap::from([
        (KEY_ORIGIN.to_string(), origin.as_str().to_string()),
        (KEY_PRIORITY.to_string(), priority.as_str().to_string()),
    ]);
    if let Some(id) = id {
        tags.insert(KEY_EVENT_ID.to_string(), id.to_string());
    }
    tags
}

fn decode_event_id(raw: &HashMap<String, String>) -> Option<&str> {
    raw.get(KEY_EVENT_ID)
        .map(String::as_str)
        .filter(|value| !value.is_empty())
}

// Keeps each raw key whose decoded value still matches the event.
fn retag(raw: &HashMap<String, String>, event: &Event) -> HashMap<String, String> {
    let mut tags = raw.clone();

    if let Some(value) = raw.get(KEY_ORIGIN) {
        if Origin::from_label(value) != event.origin {
            tags.insert(KEY_ORIGIN.to_string(), event.origin.as_str().to_string());
        }
    }

    let priority_matches = match raw.get(KEY_PRIORITY) {
        Some(value) => Priority::from_label(value) == event.priority,
        None => event.priority == Priority::default(),
    };
    if !priority_matches {
        tags.insert(KEY_PRIORITY.to_string(), event.priority.as_str().to_string());
    }

    if decode_event_id(raw) != event.id.as_deref() {
        match event.id.as_deref() {
            Some(id) => tags.insert(KEY_EVENT_ID.to_string(), id.to_string()),
            None => tags.remove(KEY_EVENT_ID),
        };
    }
    tags
}

fn map_event(
    user_id: &str,
    calendar_id: &str,
    event: &GoogleCalendarEvent,
    default_origin: Origin,
) -> Result<Event, InfraError> {
    let start = event
        .start
        .as_ref()
        .ok_or_else(|| InfraError::MalformedInput("missing start".to_string()))?;
    let end = event
        .end
        .as_ref()
        .ok_or_else(|| InfraError::MalformedInput("missing end".to_string()))?;

    let (start, start_all_day) = decode_boundary(start, "start")?;
    let (end, end_all_day) = decode_boundary(end, "end")?;
    if start_all_day != end_all_day {
        return Err(InfraError::MalformedInput(
            "start and end disagree on all-day".to_string(),
        ));
    }

    let (mut private, shared) = event
        .extended_properties
        .clone()
        .map(|properties| (properties.private, properties.shared))
        .unwrap_or_default();
    let raw_tags: HashMap<String, String> = [KEY_ORIGIN, KEY_PRIORITY, KEY_EVENT_ID]
        .into_iter()
        .filter_map(|key| private.remove(key).map(|value| (key.to_string(), value)))
        .collect();

    let origin = raw_tags
        .get(KEY_ORIGIN)
        .map(|value| Origin::from_label(value))
        .unwrap_or(default_origin);
    let priority = raw_tags
        .get(KEY_PRIORITY)
        .map(|value| Priority::from_label(value))
        .unwrap_or_default();
    let id = decode_event_id(&raw_tags).map(ToOwned::to_owned);
    let tagged_properties = if raw_tags == canonical_tags(origin, priority, id.as_deref()) {
        None
    } else {
        Some(raw_tags)
    };

    let mapped = Event {
        id,
        user: user_id.to_string(),
        calendar_id: calendar_id.to_string(),
        title: event.summary.clone().unwrap_or_default(),
        description: event.description.clone(),
        start,
        end,
        is_all_day: start_all_day,
        origin,
        priority,
        recurrence: event.recurrence.clone(),
        g_event_id: event.id.clone(),
        provider: ProviderPayload {
            etag: event.etag.clone(),
            updated: event.updated.clone(),
            status: event.status.clone(),
            private_properties: private,
            shared_properties: shared,
            extra: event.extra.clone(),
            empty_summary: event.summary.as_deref() == Some(""),
            extended_properties_absent: event.extended_properties.is_none(),
            tagged_properties,
        },
    };
    mapped.validate().map_err(InfraError::MalformedInput)?;
    Ok(mapped)
}

fn decode_boundary(
    value: &CalendarEventDateTime,
    field_name: &str,
) -> Result<(EventTime, bool), InfraError> {
    let (raw, is_all_day) = match (value.date_time.as_deref(), value.date.as_deref()) {
        (Some(date_time), None) => (date_time, false),
        (None, Some(date)) => (date, true),
        (Some(_), Some(_)) => {
            return Err(InfraError::MalformedInput(format!(
                "{field_name} has both date and dateTime"
            )));
        }
        (None, None) => {
            return Err(InfraError::MalformedInput(format!(
                "{field_name} has neither date nor dateTime"
            )));
        }
    };
    Ok((
        EventTime {
            value: raw.to_string(),
            time_zone: value.time_zone.clone(),
        },
        is_all_day,
    ))
}

fn encode_boundary(value: &EventTime, is_all_day: bool) -> CalendarEventDateTime {
    if is_all_day {
        CalendarEventDateTime {
            date_time: None,
            date: Some(value.value.clone()),
            time_zone: value.time_zone.clone(),
        }
    } else {
        CalendarEventDateTime {
            date_time: Some(value.value.clone()),
            date: None,
            time_zone: value.time_zone.clone(),
        }
    }
}
