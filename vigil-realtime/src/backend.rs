//! Backend HTTP contracts: acknowledgments and gap catch-up.

use crate::config::RealtimeConfig;
use crate::error::{RealtimeError, RealtimeResult};
use crate::types::RealtimeEvent;
use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

#[async_trait]
pub trait BackendApi: Send + Sync {
    /// `POST /ack/{eventId}`. Idempotent on the server.
    async fn ack_event(&self, event_id: &str) -> RealtimeResult<()>;

    /// `POST /messages/{id}/ack-delivered`. Idempotent on the server.
    async fn ack_delivered(&self, message_id: &str) -> RealtimeResult<()>;

    /// `GET /catchup?since={ts}`: events with `serverTimestamp > since`.
    async fn catch_up(&self, since: i64) -> RealtimeResult<Vec<RealtimeEvent>>;
}

/// Catch-up body: a bare ordered array, or the same array under `events`.
#[derive(Deserialize)]
#[serde(untagged)]
enum CatchUpResponse {
    Bare(Vec<RealtimeEvent>),
    Wrapped {
        #[serde(default)]
        events: Vec<RealtimeEvent>,
    },
}

impl CatchUpResponse {
    fn into_events(self) -> Vec<RealtimeEvent> {
        match self {
            CatchUpResponse::Bare(events) | CatchUpResponse::Wrapped { events } => events,
        }
    }
}

/// `reqwest` implementation of [`BackendApi`].
pub struct HttpBackend {
    client: Client,
    base_url: String,
    auth_token: Option<String>,
}

impl HttpBackend {
    pub fn new(config: &RealtimeConfig) -> RealtimeResult<Self> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            client,
            base_url: config.base().to_string(),
            auth_token: config.auth_token.clone(),
        })
    }

    async fn post_empty(&self, path: &str) -> RealtimeResult<()> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.client.post(&url);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }
        let resp = request.send().await?;
        check_status(resp).await?;
        Ok(())
    }
}

/// Maps a non-2xx response to [`RealtimeError::Api`].
async fn check_status(resp: Response) -> RealtimeResult<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let message = resp.text().await.unwrap_or_default();
    Err(RealtimeError::Api {
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl BackendApi for HttpBackend {
    async fn ack_event(&self, event_id: &str) -> RealtimeResult<()> {
        debug!("backend: ack {event_id}");
        self.post_empty(&format!("/ack/{}", urlencoding::encode(event_id)))
            .await
    }

    async fn ack_delivered(&self, message_id: &str) -> RealtimeResult<()> {
        debug!("backend: ack-delivered {message_id}");
        self.post_empty(&format!(
            "/messages/{}/ack-delivered",
            urlencoding::encode(message_id)
        ))
        .await
    }

    async fn catch_up(&self, since: i64) -> RealtimeResult<Vec<RealtimeEvent>> {
        let url = format!("{}/catchup", self.base_url);
        let mut request = self.client.get(&url).query(&[("since", since)]);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }
        let resp = check_status(request.send().await?).await?;
        let events = resp.json::<CatchUpResponse>().await?.into_events();
        debug!("backend: catch-up since {since} returned {} events", events.len());
        Ok(events)
    }
}
