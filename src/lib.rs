//! Event synchronization and draft reconciliation for a calendar app that
//! syncs with Google Calendar.

pub mod application;
pub mod domain;
pub mod infrastructure;

pub use application::bootstrap::{bootstrap_workspace, BootstrapResult};
pub use application::calendar_sync::{CalendarSyncService, RetryPolicy, SyncOutcome};
pub use application::draft_reconciler::{
    ApplySummary, DraftError, DraftReconciler, DraftSnapshot, DraftStatus, PendingSync,
};
pub use application::event_store::{EventStore, StoreChange};
pub use domain::models::{
    CalendarListEntry, Event, EventKey, EventTime, Origin, Priority, ProviderPayload, WatchChannel,
};
pub use domain::origin::{tag_origin, EventSource};
pub use infrastructure::config::{SyncConfig, WatchConfig};
pub use infrastructure::error::InfraError;
pub use infrastructure::event_mapper::{to_external, to_internal, GoogleCalendarEvent, MappedBatch};
pub use infrastructure::event_repository::{
    EventRepository, InMemoryEventRepository, SqliteEventRepository,
};
pub use infrastructure::google_calendar_client::{GoogleCalendarClient, ReqwestGoogleCalendarClient};
pub use infrastructure::sync_token_store::{
    InMemorySyncTokenStore, SqliteSyncTokenStore, SyncTokenStore,
};
