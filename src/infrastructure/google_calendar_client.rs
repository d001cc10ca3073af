use crate::domain::models::WatchChannel;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::event_mapper::{decode_event, GoogleCalendarEvent};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use url::Url;

const CHANNEL_STOP_ENDPOINT: &str = "https://www.googleapis.com/calendar/v3/channels/stop";
const CALENDAR_API_BASE: &str = "https://www.googleapis.com/calendar/v3/";

#[derive(Debug, Clone, Default)]
pub struct ListEventsRequest {
    pub sync_token: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ListEventsResponse {
    pub events: Vec<GoogleCalendarEvent>,
    /// Items the client could not decode at all.
    pub undecodable: usize,
    pub next_sync_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct WatchRequest {
    pub channel_id: String,
    pub address: String,
    pub ttl_seconds: u64,
}

#[async_trait]
pub trait GoogleCalendarClient: Send + Sync {
    /// Lists events, incrementally when the request carries a sync token.
    /// A rejected token surfaces as `InfraError::CursorExpired`.
    async fn list_events(
        &self,
        access_token: &str,
        calendar_id: &str,
        request: ListEventsRequest,
    ) -> Result<ListEventsResponse, InfraError>;

    async fn create_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        event: &GoogleCalendarEvent,
    ) -> Result<String, InfraError>;

    async fn update_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        event_id: &str,
        event: &GoogleCalendarEvent,
    ) -> Result<(), InfraError>;

    async fn delete_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        event_id: &str,
    ) -> Result<(), InfraError>;

    async fn watch_events(
        &self,
        access_token: &str,
        calendar_id: &str,
        request: WatchRequest,
    ) -> Result<WatchChannel, InfraError>;

    async fn stop_channel(
        &self,
        access_token: &str,
        channel: &WatchChannel,
    ) -> Result<(), InfraError>;
}

#[derive(Debug, Clone, Default)]
pub struct ReqwestGoogleCalendarClient {
    client: Client,
}

impl ReqwestGoogleCalendarClient {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    fn ensure_non_empty(value: &str, field: &str) -> Result<(), InfraError> {
        if value.trim().is_empty() {
            return Err(InfraError::Provider(format!("{field} must not be empty")));
        }
        Ok(())
    }

    fn http_error(status: reqwest::StatusCode, body: &str) -> InfraError {
        let message = if body.trim().is_empty() {
            format!("google calendar api error: http {}", status.as_u16())
        } else {
            format!("google calendar api error: http {}; body={body}", status.as_u16())
        };
        InfraError::Provider(message)
    }

    fn network_error(action: &str, error: reqwest::Error) -> InfraError {
        if error.is_timeout() {
            InfraError::Timeout(format!("{action}: {error}"))
        } else {
            InfraError::Provider(format!("network error while {action}: {error}"))
        }
    }

    fn calendar_endpoint(calendar_id: &str, trailing: &[&str]) -> Result<Url, InfraError> {
        let mut url = Url::parse(CALENDAR_API_BASE)
            .map_err(|error| InfraError::Provider(format!("invalid calendar api base url: {error}")))?;
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                InfraError::Provider("calendar api base URL cannot be a base".to_string())
            })?;
            segments.pop_if_empty();
            segments.push("calendars");
            segments.push(calendar_id);
            segments.extend(trailing);
        }
        Ok(url)
    }

    async fn read_body(
        response: reqwest::Response,
        action: &str,
    ) -> Result<(reqwest::StatusCode, String), InfraError> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|error| InfraError::Provider(format!("failed reading {action} response: {error}")))?;
        Ok((status, body))
    }
}

#[derive(Debug, serde::Deserialize)]
struct EventsPageResponse {
    items: Option<Vec<serde_json::Value>>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
    #[serde(rename = "nextSyncToken")]
    next_sync_token: Option<String>,
}

#[derive(Debug, serde::Serialize)]
struct WatchRequestBody<'a> {
    id: &'a str,
    #[serde(rename = "type")]
    kind: &'static str,
    address: &'a str,
    params: WatchParams,
}

#[derive(Debug, serde::Serialize)]
struct WatchParams {
    ttl: String,
}

#[derive(Debug, serde::Deserialize)]
struct WatchResponseBody {
    id: Option<String>,
    #[serde(rename = "resourceId")]
    resource_id: Option<String>,
    expiration: Option<String>,
}

#[derive(Debug, serde::Serialize)]
struct StopChannelBody<'a> {
    id: &'a str,
    #[serde(rename = "resourceId")]
    resource_id: &'a str,
}

fn parse_expiration(value: Option<&str>) -> Result<DateTime<Utc>, InfraError> {
    let raw = value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| InfraError::Provider("watch response did not include expiration".to_string()))?;
    let millis = raw
        .parse::<i64>()
        .map_err(|error| InfraError::Provider(format!("invalid watch expiration '{raw}': {error}")))?;
    DateTime::<Utc>::from_timestamp_millis(millis)
        .ok_or_else(|| InfraError::Provider(format!("watch expiration out of range: {raw}")))
}

#[async_trait]
impl GoogleCalendarClient for ReqwestGoogleCalendarClient {
    async fn list_events(
        &self,
        access_token: &str,
        calendar_id: &str,
        request: ListEventsRequest,
    ) -> Result<ListEventsResponse, InfraError> {
        Self::ensure_non_empty(access_token, "access token")?;
        Self::ensure_non_empty(calendar_id, "calendar id")?;

        let endpoint = Self::calendar_endpoint(calendar_id, &["events"])?;
        let mut page_token: Option<String> = None;
        let mut listed = ListEventsResponse::default();

        loop {
            let mut req = self.client.get(endpoint.clone()).bearer_auth(access_token);
            req = req.query(&[("showDeleted", "true"), ("maxResults", "2500")]);
            if let Some(sync_token) = request.sync_token.as_deref() {
                req = req.query(&[("syncToken", sync_token)]);
            } else {
                req = req.query(&[("singleEvents", "false")]);
            }
            if let Some(page_token) = page_token.as_deref() {
                req = req.query(&[("pageToken", page_token)]);
            }

            let response = req
                .send()
                .await
                .map_err(|error| Self::network_error("listing calendar events", error))?;
            let (status, body) = Self::read_body(response, "events list").await?;

            if status == reqwest::StatusCode::GONE {
                return Err(InfraError::CursorExpired);
            }
            if !status.is_success() {
                return Err(Self::http_error(status, &body));
            }

            let mut parsed: EventsPageResponse = serde_json::from_str(&body).map_err(|error| {
                InfraError::Provider(format!("invalid events list payload: {error}; body={body}"))
            })?;

            for item in parsed.items.take().unwrap_or_default() {
                match decode_event(item) {
                    Ok(event) => listed.events.push(event),
                    Err(error) => {
                        tracing::warn!(calendar_id, %error, "dropping undecodable event item");
                        listed.undecodable += 1;
                    }
                }
            }
            if parsed.next_sync_token.is_some() {
                listed.next_sync_token = parsed.next_sync_token.take();
            }

            if let Some(next_page_token) = parsed.next_page_token.take() {
                page_token = Some(next_page_token);
                continue;
            }
            break;
        }

        Ok(listed)
    }

    async fn create_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        event: &GoogleCalendarEvent,
    ) -> Result<String, InfraError> {
        Self::ensure_non_empty(access_token, "access token")?;
        Self::ensure_non_empty(calendar_id, "calendar id")?;

        let endpoint = Self::calendar_endpoint(calendar_id, &["events"])?;
        let response = self
            .client
            .post(endpoint)
            .bearer_auth(access_token)
            .json(event)
            .send()
            .await
            .map_err(|error| Self::network_error("creating event", error))?;

        let (status, body) = Self::read_body(response, "event create").await?;
        if !status.is_success() {
            return Err(Self::http_error(status, &body));
        }

        let parsed: GoogleCalendarEvent = serde_json::from_str(&body).map_err(|error| {
            InfraError::Provider(format!("invalid event create payload: {error}; body={body}"))
        })?;
        parsed
            .id
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| InfraError::Provider("event create response did not include id".to_string()))
    }

    async fn update_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        event_id: &str,
        event: &GoogleCalendarEvent,
    ) -> Result<(), InfraError> {
        Self::ensure_non_empty(access_token, "access token")?;
        Self::ensure_non_empty(calendar_id, "calendar id")?;
        Self::ensure_non_empty(event_id, "event id")?;

        let endpoint = Self::calendar_endpoint(calendar_id, &["events", event_id])?;
        let response = self
            .client
            .put(endpoint)
            .bearer_auth(access_token)
            .json(event)
            .send()
            .await
            .map_err(|error| Self::network_error("updating event", error))?;

        let (status, body) = Self::read_body(response, "event update").await?;
        if !status.is_success() {
            return Err(Self::http_error(status, &body));
        }
        Ok(())
    }

    async fn delete_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        event_id: &str,
    ) -> Result<(), InfraError> {
        Self::ensure_non_empty(access_token, "access token")?;
        Self::ensure_non_empty(calendar_id, "calendar id")?;
        Self::ensure_non_empty(event_id, "event id")?;

        let endpoint = Self::calendar_endpoint(calendar_id, &["events", event_id])?;
        let response = self
            .client
            .delete(endpoint)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|error| Self::network_error("deleting event", error))?;

        let (status, body) = Self::read_body(response, "event delete").await?;
        if !status.is_success() {
            return Err(Self::http_error(status, &body));
        }
        Ok(())
    }

    async fn watch_events(
        &self,
        access_token: &str,
        calendar_id: &str,
        request: WatchRequest,
    ) -> Result<WatchChannel, InfraError> {
        Self::ensure_non_empty(access_token, "access token")?;
        Self::ensure_non_empty(calendar_id, "calendar id")?;
        Self::ensure_non_empty(&request.channel_id, "channel id")?;
        Self::ensure_non_empty(&request.address, "webhook address")?;

        let endpoint = Self::calendar_endpoint(calendar_id, &["events", "watch"])?;
        let body = WatchRequestBody {
            id: &request.channel_id,
            kind: "web_hook",
            address: &request.address,
            params: WatchParams {
                ttl: request.ttl_seconds.to_string(),
            },
        };
        let response = self
            .client
            .post(endpoint)
            .bearer_auth(access_token)
            .json(&body)
            .send()
            .await
            .map_err(|error| Self::network_error("starting events watch", error))?;

        let (status, body) = Self::read_body(response, "events watch").await?;
        if !status.is_success() {
            return Err(Self::http_error(status, &body));
        }

        let parsed: WatchResponseBody = serde_json::from_str(&body).map_err(|error| {
            InfraError::Provider(format!("invalid events watch payload: {error}; body={body}"))
        })?;
        let resource_id = parsed
            .resource_id
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| InfraError::Provider("watch response did not include resourceId".to_string()))?;

        Ok(WatchChannel {
            channel_id: parsed.id.unwrap_or(request.channel_id),
            resource_id,
            expiration: parse_expiration(parsed.expiration.as_deref())?,
        })
    }

    async fn stop_channel(
        &self,
        access_token: &str,
        channel: &WatchChannel,
    ) -> Result<(), InfraError> {
        Self::ensure_non_empty(access_token, "access token")?;

        let response = self
            .client
            .post(CHANNEL_STOP_ENDPOINT)
            .bearer_auth(access_token)
            .json(&StopChannelBody {
                id: &channel.channel_id,
                resource_id: &channel.resource_id,
            })
            .send()
            .await
            .map_err(|error| Self::network_error("stopping channel", error))?;

        let (status, body) = Self::read_body(response, "channel stop").await?;
        // An already-expired channel is reported as not found.
        if !status.is_success() && status != reqwest::StatusCode::NOT_FOUND {
            return Err(Self::http_error(status, &body));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calendar_endpoint_escapes_calendar_id() {
        let url = ReqwestGoogleCalendarClient::calendar_endpoint("team@group.calendar.google.com", &["events"])
            .expect("endpoint");
        assert_eq!(
            url.as_str(),
            "https://www.googleapis.com/calendar/v3/calendars/team@group.calendar.google.com/events"
        );

        let url = ReqwestGoogleCalendarClient::calendar_endpoint("a/b", &["events", "evt 1"])
            .expect("endpoint");
        assert_eq!(
            url.as_str(),
            "https://www.googleapis.com/calendar/v3/calendars/a%2Fb/events/evt%201"
        );
    }

    #[test]
    fn watch_expiration_is_parsed_from_millis() {
        let parsed = parse_expiration(Some("1771200000000")).expect("expiration");
        assert_eq!(parsed.timestamp_millis(), 1_771_200_000_000);
        assert!(parse_expiration(None).is_err());
        assert!(parse_expiration(Some("soon")).is_err());
    }

    #[tokio::test]
    async fn empty_access_token_is_rejected_before_network() {
        let client = ReqwestGoogleCalendarClient::new();
        let result = client
            .list_events(" ", "primary", ListEventsRequest::default())
            .await;
        assert!(matches!(result, Err(InfraError::Provider(_))));
    }
}
