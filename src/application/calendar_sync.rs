use crate::application::draft_reconciler::{ApplySummary, DraftReconciler};
use crate::domain::models::{Event, EventKey, WatchChannel};
use crate::domain::origin::{tag_origin, EventSource};
use crate::infrastructure::config::{SyncConfig, WatchConfig};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::event_mapper::{to_external, to_internal, GoogleCalendarEvent};
use crate::infrastructure::event_repository::EventRepository;
use crate::infrastructure::google_calendar_client::{
    GoogleCalendarClient, ListEventsRequest, ListEventsResponse, WatchRequest,
};
use crate::infrastructure::sync_token_store::SyncTokenStore;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::time::{sleep, timeout, Duration as TokioDuration};

type NowProvider = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;
type CalendarLocks = Mutex<HashMap<(String, String), Arc<tokio::sync::Mutex<()>>>>;

const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u8,
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub user_id: String,
    pub calendar_id: String,
    pub events: Vec<Event>,
    /// Events the provider reported as cancelled on this calendar.
    pub deleted: Vec<EventKey>,
    pub malformed: usize,
    pub next_sync_token: Option<String>,
    pub full_sync: bool,
}

impl SyncOutcome {
    pub fn apply_to<R>(self, reconciler: &mut DraftReconciler<R>) -> ApplySummary
    where
        R: EventRepository,
    {
        reconciler.apply_sync(self.events, &self.deleted)
    }
}

pub struct CalendarSyncService<C, S>
where
    C: GoogleCalendarClient,
    S: SyncTokenStore,
{
    calendar_client: Arc<C>,
    token_store: Arc<S>,
    retry_policy: RetryPolicy,
    request_timeout: TokioDuration,
    now_provider: NowProvider,
    watch_config: WatchConfig,
    calendar_locks: CalendarLocks,
}

impl<C, S> CalendarSyncService<C, S>
where
    C: GoogleCalendarClient,
    S: SyncTokenStore,
{
    pub fn new(calendar_client: Arc<C>, token_store: Arc<S>) -> Self {
        Self {
            calendar_client,
            token_store,
            retry_policy: RetryPolicy::default(),
            request_timeout: TokioDuration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            now_provider: Arc::new(Utc::now),
            watch_config: WatchConfig::default(),
            calendar_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_config(self, config: &SyncConfig) -> Self {
        self.with_retry_policy(RetryPolicy {
            max_attempts: config.retry.max_attempts,
            base_delay_ms: config.retry.base_delay_ms,
        })
        .with_request_timeout(TokioDuration::from_millis(config.request_timeout_ms))
        .with_watch_config(config.watch.clone())
    }

    pub fn with_watch_config(mut self, watch_config: WatchConfig) -> Self {
        self.watch_config = watch_config;
        self
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn with_request_timeout(mut self, request_timeout: TokioDuration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    /// Pulls changes for one calendar. Runs incrementally from the stored
    /// cursor when there is one, otherwise as a full import. At most one sync
    /// per (user, calendar) runs at a time; later callers wait their turn.
    pub async fn sync(
        &self,
        user_id: &str,
        access_token: &str,
        calendar_id: &str,
    ) -> Result<SyncOutcome, InfraError> {
        let calendar_lock = self.calendar_lock(user_id, calendar_id)?;
        let outcome = {
            let _in_flight = calendar_lock.lock().await;
            self.sync_locked(user_id, access_token, calendar_id).await
        };
        self.release_calendar_lock(user_id, calendar_id, calendar_lock);
        outcome
    }

    async fn sync_locked(
        &self,
        user_id: &str,
        access_token: &str,
        calendar_id: &str,
    ) -> Result<SyncOutcome, InfraError> {
        let previous_cursor = self.token_store.get_cursor(user_id, calendar_id)?;
        let (response, full_sync) = match self
            .list_events_with_retry(
                access_token,
                calendar_id,
                ListEventsRequest {
                    sync_token: previous_cursor.clone(),
                },
            )
            .await
        {
            Ok(response) => (response, previous_cursor.is_none()),
            Err(InfraError::CursorExpired) if previous_cursor.is_some() => {
                tracing::warn!(user_id, calendar_id, "sync cursor expired; running full sync");
                self.token_store.clear_cursor(user_id, calendar_id)?;
                let response = self
                    .list_events_with_retry(access_token, calendar_id, ListEventsRequest::default())
                    .await?;
                (response, true)
            }
            Err(error) => {
                tracing::warn!(user_id, calendar_id, %error, "calendar sync failed; cursor unchanged");
                return Err(error);
            }
        };

        let source = if full_sync {
            EventSource::BulkImport
        } else {
            EventSource::ProviderNotification
        };
        let (cancelled, active): (Vec<GoogleCalendarEvent>, Vec<GoogleCalendarEvent>) = response
            .events
            .into_iter()
            .partition(GoogleCalendarEvent::is_cancelled);
        let deleted: Vec<EventKey> = cancelled
            .into_iter()
            .filter_map(|event| event.id)
            .filter(|id| !id.is_empty())
            .map(|id| EventKey::new(calendar_id, id))
            .collect();
        let mapped = to_internal(user_id, calendar_id, &active, tag_origin(&source));

        match response.next_sync_token.as_deref() {
            Some(token) => {
                self.token_store
                    .set_cursor(user_id, calendar_id, token, (self.now_provider)())?;
            }
            None => {
                tracing::warn!(user_id, calendar_id, "provider returned no sync cursor");
            }
        }

        let malformed = mapped.malformed + response.undecodable;
        tracing::info!(
            user_id,
            calendar_id,
            full_sync,
            events = mapped.events.len(),
            deleted = deleted.len(),
            malformed,
            "calendar sync completed"
        );

        Ok(SyncOutcome {
            user_id: user_id.to_string(),
            calendar_id: calendar_id.to_string(),
            events: mapped.events,
            deleted,
            malformed,
            next_sync_token: response.next_sync_token,
            full_sync,
        })
    }

    /// Routes a provider push notification to the calendar that owns the
    /// channel and syncs it.
    pub async fn handle_notification(
        &self,
        access_token: &str,
        channel_id: &str,
        resource_id: &str,
    ) -> Result<SyncOutcome, InfraError> {
        let entry = self
            .token_store
            .find_by_channel(channel_id)?
            .ok_or_else(|| InfraError::UnknownChannel(channel_id.to_string()))?;
        let matches_resource = entry
            .watch
            .as_ref()
            .map(|watch| watch.resource_id == resource_id.trim())
            .unwrap_or(false);
        if !matches_resource {
            return Err(InfraError::UnknownChannel(format!(
                "{channel_id} (resource {resource_id} does not match)"
            )));
        }
        let now = (self.now_provider)();
        if entry.watch.as_ref().is_some_and(|watch| watch.is_expired_at(now)) {
            return Err(InfraError::UnknownChannel(format!("{channel_id} (expired)")));
        }
        tracing::debug!(
            user_id = %entry.user_id,
            calendar_id = %entry.calendar_id,
            channel_id,
            "push notification received"
        );
        self.sync(&entry.user_id, access_token, &entry.calendar_id).await
    }

    pub async fn watch_calendar(
        &self,
        user_id: &str,
        access_token: &str,
        calendar_id: &str,
        request: WatchRequest,
    ) -> Result<WatchChannel, InfraError> {
        let channel = self
            .bounded(
                "starting events watch",
                self.calendar_client
                    .watch_events(access_token, calendar_id, request),
            )
            .await?;
        self.token_store.save_watch(user_id, calendar_id, &channel)?;
        tracing::info!(
            user_id,
            calendar_id,
            channel_id = %channel.channel_id,
            expiration = %channel.expiration,
            "calendar watch registered"
        );
        Ok(channel)
    }

    pub async fn stop_watch(
        &self,
        user_id: &str,
        access_token: &str,
        calendar_id: &str,
    ) -> Result<bool, InfraError> {
        let watch = self
            .token_store
            .list_entries(user_id)?
            .into_iter()
            .find(|entry| entry.calendar_id == calendar_id.trim())
            .and_then(|entry| entry.watch);
        let Some(watch) = watch else {
            return Ok(false);
        };
        self.bounded(
            "stopping channel",
            self.calendar_client.stop_channel(access_token, &watch),
        )
        .await?;
        self.token_store.clear_watch(user_id, calendar_id)?;
        Ok(true)
    }

    /// Replaces the user's channels that expire within the configured renewal
    /// window. The new channel is registered before the old one is stopped.
    /// Does nothing while no notification address is configured.
    pub async fn renew_expiring_watches(
        &self,
        user_id: &str,
        access_token: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<WatchChannel>, InfraError> {
        let Some(address) = self.watch_config.address.clone() else {
            tracing::debug!(user_id, "no watch address configured; skipping renewal");
            return Ok(Vec::new());
        };
        let horizon = i64::try_from(self.watch_config.renew_before_seconds)
            .ok()
            .and_then(chrono::TimeDelta::try_seconds)
            .and_then(|window| now.checked_add_signed(window))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let expiring: Vec<(String, WatchChannel)> = self
            .token_store
            .expiring_watches(horizon)?
            .into_iter()
            .filter(|entry| entry.user_id == user_id.trim())
            .filter_map(|entry| entry.watch.map(|watch| (entry.calendar_id, watch)))
            .collect();

        let mut renewed = Vec::with_capacity(expiring.len());
        for (index, (calendar_id, previous)) in expiring.into_iter().enumerate() {
            let request = WatchRequest {
                channel_id: format!("compass-{}-{index}", now.timestamp_micros()),
                address: address.clone(),
                ttl_seconds: self.watch_config.ttl_seconds,
            };
            let channel = self
                .watch_calendar(user_id, access_token, &calendar_id, request)
                .await?;
            if let Err(error) = self
                .bounded(
                    "stopping channel",
                    self.calendar_client.stop_channel(access_token, &previous),
                )
                .await
            {
                tracing::warn!(
                    user_id,
                    calendar_id = %calendar_id,
                    channel_id = %previous.channel_id,
                    %error,
                    "failed to stop replaced channel"
                );
            }
            renewed.push(channel);
        }
        Ok(renewed)
    }

    /// Writes a local event to the provider, creating it when it has no
    /// external id yet. Returns the external id.
    pub async fn push_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        event: &Event,
    ) -> Result<String, InfraError> {
        let external = to_external(event);
        match event.g_event_id.as_deref().filter(|id| !id.trim().is_empty()) {
            Some(g_event_id) => {
                self.bounded(
                    "updating event",
                    self.calendar_client
                        .update_event(access_token, calendar_id, g_event_id, &external),
                )
                .await?;
                Ok(g_event_id.to_string())
            }
            None => {
                self.bounded(
                    "creating event",
                    self.calendar_client
                        .create_event(access_token, calendar_id, &external),
                )
                .await
            }
        }
    }

    /// Removes the provider copy of an event. Counterpart of `push_event` for
    /// events deleted locally.
    pub async fn delete_remote(
        &self,
        access_token: &str,
        calendar_id: &str,
        g_event_id: &str,
    ) -> Result<(), InfraError> {
        self.bounded(
            "deleting event",
            self.calendar_client
                .delete_event(access_token, calendar_id, g_event_id),
        )
        .await?;
        tracing::info!(calendar_id, g_event_id, "provider event deleted");
        Ok(())
    }

    fn calendar_lock(
        &self,
        user_id: &str,
        calendar_id: &str,
    ) -> Result<Arc<tokio::sync::Mutex<()>>, InfraError> {
        let mut locks = self
            .calendar_locks
            .lock()
            .map_err(|error| InfraError::lock_poisoned("calendar sync", error))?;
        let key = (user_id.trim().to_string(), calendar_id.trim().to_string());
        Ok(Arc::clone(locks.entry(key).or_default()))
    }

    // Drops the map entry once no other caller holds or waits on the lock.
    fn release_calendar_lock(
        &self,
        user_id: &str,
        calendar_id: &str,
        calendar_lock: Arc<tokio::sync::Mutex<()>>,
    ) {
        let Ok(mut locks) = self.calendar_locks.lock() else {
            tracing::warn!(user_id, calendar_id, "calendar sync lock map poisoned");
            return;
        };
        if Arc::strong_count(&calendar_lock) <= 2 {
            locks.remove(&(user_id.trim().to_string(), calendar_id.trim().to_string()));
        }
    }

    async fn bounded<T>(
        &self,
        action: &str,
        call: impl Future<Output = Result<T, InfraError>>,
    ) -> Result<T, InfraError> {
        match timeout(self.request_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(InfraError::Timeout(format!(
                "{action} exceeded {}ms",
                self.request_timeout.as_millis()
            ))),
        }
    }

    async fn list_events_with_retry(
        &self,
        access_token: &str,
        calendar_id: &str,
        request: ListEventsRequest,
    ) -> Result<ListEventsResponse, InfraError> {
        let max_attempts = self.retry_policy.max_attempts.max(1);
        let mut attempt: u8 = 0;

        loop {
            let result = self
                .bounded(
                    "listing calendar events",
                    self.calendar_client
                        .list_events(access_token, calendar_id, request.clone()),
                )
                .await;
            match result {
                Ok(response) => return Ok(response),
                Err(error) if self.should_retry(&error) && attempt + 1 < max_attempts => {
                    let delay = self
                        .retry_policy
                        .base_delay_ms
                        .saturating_mul(2u64.saturating_pow(attempt as u32));
                    tracing::debug!(calendar_id, attempt, delay, %error, "retrying event listing");
                    sleep(TokioDuration::from_millis(delay)).await;
                    attempt = attempt.saturating_add(1);
                }
                Err(error) => return Err(error),
            }
        }
    }

    // Timeouts are left to the next scheduled sync rather than retried here.
    fn should_retry(&self, error: &InfraError) -> bool {
        match error {
            InfraError::Provider(message) => {
                let message = message.to_ascii_lowercase();
                message.contains("network error")
                    || message.contains("temporarily unavailable")
                    || message.contains("connection reset")
                    || message.contains("http 503")
            }
            _ => false,
        }
    }
}
