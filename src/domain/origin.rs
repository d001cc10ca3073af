use crate::domain::models::Origin;

/// Where a batch of events came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventSource {
    /// Incremental provider sync or a push-notification callback.
    ProviderNotification,
    /// A user action inside the app.
    LocalMutation,
    /// Full (cursorless) import of a provider calendar.
    BulkImport,
    Unrecognized(String),
}

impl EventSource {
    pub fn from_label(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "google" | "provider" | "notification" | "incremental" => Self::ProviderNotification,
            "compass" | "local" | "user" => Self::LocalMutation,
            "import" | "googleimport" | "full" => Self::BulkImport,
            other => Self::Unrecognized(other.to_string()),
        }
    }
}

pub fn tag_origin(source: &EventSource) -> Origin {
    match source {
        EventSource::ProviderNotification => Origin::Google,
        EventSource::LocalMutation => Origin::Compass,
        EventSource::BulkImport => Origin::GoogleImport,
        EventSource::Unrecognized(label) => {
            tracing::debug!(source = %label, "unrecognized event source tagged as unsure");
            Origin::Unsure
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_sources_map_to_their_origin() {
        assert_eq!(tag_origin(&EventSource::ProviderNotification), Origin::Google);
        assert_eq!(tag_origin(&EventSource::LocalMutation), Origin::Compass);
        assert_eq!(tag_origin(&EventSource::BulkImport), Origin::GoogleImport);
    }

    #[test]
    fn unrecognized_source_is_unsure() {
        let source = EventSource::from_label("outlook-webhook");
        assert_eq!(source, EventSource::Unrecognized("outlook-webhook".to_string()));
        assert_eq!(tag_origin(&source), Origin::Unsure);
    }

    #[test]
    fn labels_are_case_insensitive() {
        assert_eq!(EventSource::from_label(" Import "), EventSource::BulkImport);
        assert_eq!(EventSource::from_label("LOCAL"), EventSource::LocalMutation);
        assert_eq!(EventSource::from_label(""), EventSource::Unrecognized(String::new()));
    }
}
