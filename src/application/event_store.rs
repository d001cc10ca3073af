use crate::domain::models::{Event, EventKey};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreChange {
    Inserted,
    Updated,
    Unchanged,
    /// An update of lower origin precedence was dropped.
    Rejected,
}

/// Background store of synced and committed events, keyed per calendar by
/// logical id.
#[derive(Debug, Default, Clone)]
pub struct EventStore {
    events: HashMap<EventKey, Event>,
}

impl EventStore {
    /// Looks an event up by internal or external id in any calendar.
    pub fn get(&self, event_id: &str) -> Option<&Event> {
        self.events.values().find(|event| event.matches(event_id))
    }

    pub fn get_in(&self, key: &EventKey) -> Option<&Event> {
        self.find_stored_key(key)
            .and_then(|stored_key| self.events.get(&stored_key))
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Applies an incoming update. The stored origin is kept, and an update
    /// tagged `Unsure` never replaces an event of known origin.
    pub fn apply(&mut self, incoming: Event) -> StoreChange {
        let Some(key) = incoming.key() else {
            tracing::warn!(title = %incoming.title, "dropping event without identifier");
            return StoreChange::Rejected;
        };

        let Some(existing_key) = self.find_key(&incoming) else {
            self.events.insert(key, incoming);
            return StoreChange::Inserted;
        };

        let Some(existing) = self.events.get(&existing_key) else {
            return StoreChange::Rejected;
        };
        if !incoming.origin.may_override(existing.origin) {
            tracing::debug!(
                calendar_id = %existing_key.calendar_id,
                event_id = %existing_key.event_id,
                existing_origin = existing.origin.as_str(),
                "ignoring update of lower origin precedence"
            );
            return StoreChange::Rejected;
        }

        let mut merged = incoming;
        merged.origin = existing.origin;
        if merged.id.is_none() {
            merged.id = existing.id.clone();
        }
        if merged.g_event_id.is_none() {
            merged.g_event_id = existing.g_event_id.clone();
        }
        if existing == &merged {
            return StoreChange::Unchanged;
        }

        self.events.remove(&existing_key);
        let merged_key = merged.key().unwrap_or(existing_key);
        self.events.insert(merged_key, merged);
        StoreChange::Updated
    }

    /// Stores a committed event, replacing whatever is there.
    pub fn put(&mut self, event: Event) {
        if let Some(existing_key) = self.find_key(&event) {
            self.events.remove(&existing_key);
        }
        if let Some(key) = event.key() {
            self.events.insert(key, event);
        }
    }

    /// Removes the event matching `key` by internal or external id within
    /// the key's calendar.
    pub fn remove(&mut self, key: &EventKey) -> Option<Event> {
        self.find_stored_key(key)
            .and_then(|stored_key| self.events.remove(&stored_key))
    }

    fn find_stored_key(&self, key: &EventKey) -> Option<EventKey> {
        if self.events.contains_key(key) {
            return Some(key.clone());
        }
        self.events
            .iter()
            .find(|(_, stored)| stored.matches_key(key))
            .map(|(stored_key, _)| stored_key.clone())
    }

    fn find_key(&self, event: &Event) -> Option<EventKey> {
        [event.id.as_deref(), event.g_event_id.as_deref()]
            .into_iter()
            .flatten()
            .find_map(|event_id| self.find_stored_key(&EventKey::new(event.calendar_id.clone(), event_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{EventTime, Origin};

    fn synced(g_event_id: &str, title: &str, origin: Origin) -> Event {
        let mut event = Event::new_local(
            "user-1",
            title,
            EventTime::timed("2026-02-16T12:00:00Z"),
            EventTime::timed("2026-02-16T13:00:00Z"),
        );
        event.origin = origin;
        event.g_event_id = Some(g_event_id.to_string());
        event
    }

    #[test]
    fn apply_inserts_then_updates() {
        let mut store = EventStore::default();
        assert_eq!(store.apply(synced("g1", "Standup", Origin::Google)), StoreChange::Inserted);
        assert_eq!(store.apply(synced("g1", "Standup", Origin::Google)), StoreChange::Unchanged);
        assert_eq!(store.apply(synced("g1", "Retro", Origin::Google)), StoreChange::Updated);
        assert_eq!(store.get("g1").map(|event| event.title.as_str()), Some("Retro"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn apply_keeps_existing_origin() {
        let mut store = EventStore::default();
        store.apply(synced("g1", "Planning", Origin::Compass));
        store.apply(synced("g1", "Planning v2", Origin::Google));

        let stored = store.get("g1").expect("stored");
        assert_eq!(stored.title, "Planning v2");
        assert_eq!(stored.origin, Origin::Compass);
    }

    #[test]
    fn unsure_update_is_rejected_for_known_origin() {
        let mut store = EventStore::default();
        store.apply(synced("g1", "Known", Origin::Google));
        assert_eq!(store.apply(synced("g1", "Guess", Origin::Unsure)), StoreChange::Rejected);
        assert_eq!(store.get("g1").map(|event| event.title.as_str()), Some("Known"));
    }

    #[test]
    fn internal_id_update_matches_external_key() {
        let mut store = EventStore::default();
        store.apply(synced("g1", "Lunch", Origin::Google));

        let mut committed = synced("g1", "Lunch (moved)", Origin::Google);
        committed.id = Some("e1".to_string());
        store.put(committed);

        assert_eq!(store.len(), 1);
        assert_eq!(store.get("e1").map(|event| event.title.as_str()), Some("Lunch (moved)"));
        assert!(store.get("g1").is_some());
        assert!(store.remove(&EventKey::new("primary", "g1")).is_some());
        assert!(store.is_empty());
    }

    #[test]
    fn same_provider_id_in_two_calendars_is_kept_apart() {
        let mut store = EventStore::default();
        store.apply(synced("shared-g1", "Offsite", Origin::Google));
        store.apply(synced("shared-g1", "Offsite", Origin::Google).in_calendar("work"));
        assert_eq!(store.len(), 2);

        assert!(store.remove(&EventKey::new("work", "shared-g1")).is_some());
        assert_eq!(store.len(), 1);
        assert!(store.get_in(&EventKey::new("primary", "shared-g1")).is_some());
        assert!(store.get_in(&EventKey::new("work", "shared-g1")).is_none());
    }

    #[test]
    fn events_without_identifier_are_rejected() {
        let mut store = EventStore::default();
        let mut event = synced("g1", "Anonymous", Origin::Google);
        event.g_event_id = None;
        assert_eq!(store.apply(event), StoreChange::Rejected);
        assert!(store.is_empty());
    }
}
