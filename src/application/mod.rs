pub mod bootstrap;
pub mod calendar_sync;
pub mod draft_reconciler;
pub mod event_store;
