pub mod config;
pub mod error;
pub mod event_mapper;
pub mod event_repository;
pub mod google_calendar_client;
pub mod logging;
pub mod storage;
pub mod sync_token_store;
