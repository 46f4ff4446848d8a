//! Push-stream transport.
//!
//! The pool only needs "open a URL, get a stream of named messages"; the
//! `StreamConnector` trait is that seam. `SseConnector` is the production
//! implementation over HTTP server-sent events.

use crate::error::{RealtimeError, RealtimeResult};
use crate::sse::{SseDecoder, StreamMessage};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::Client;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::debug;

/// Messages from one open connection. The stream ending means the transport
/// closed; an `Err` item means it failed.
pub type MessageStream = BoxStream<'static, RealtimeResult<StreamMessage>>;

#[async_trait]
pub trait StreamConnector: Send + Sync {
    /// Opens a long-lived push connection to `url`.
    async fn connect(&self, url: &str) -> RealtimeResult<MessageStream>;
}

/// Server-sent events over `reqwest`.
pub struct SseConnector {
    client: Client,
    auth_token: Option<String>,
}

impl SseConnector {
    pub fn new(auth_token: Option<String>) -> RealtimeResult<Self> {
        // No overall timeout: the response body is meant to stay open.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { client, auth_token })
    }
}

#[async_trait]
impl StreamConnector for SseConnector {
    async fn connect(&self, url: &str) -> RealtimeResult<MessageStream> {
        let mut request = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .header(reqwest::header::CACHE_CONTROL, "no-cache");
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        let resp = request.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(RealtimeError::Api {
                status: status.as_u16(),
                message,
            });
        }
        debug!("sse stream open: {url}");

        let bytes = resp.bytes_stream().boxed();
        let state = (bytes, SseDecoder::new(), VecDeque::<StreamMessage>::new());

        let messages = stream::unfold(state, |(mut bytes, mut decoder, mut ready)| async move {
            loop {
                if let Some(message) = ready.pop_front() {
                    return Some((Ok(message), (bytes, decoder, ready)));
                }
                match bytes.next().await {
                    Some(Ok(chunk)) => ready.extend(decoder.feed(&chunk)),
                    Some(Err(e)) => {
                        return Some((
                            Err(RealtimeError::Stream(e.to_string())),
                            (bytes, decoder, ready),
                        ));
                    }
                    None => return None,
                }
            }
        });

        Ok(messages.boxed())
    }
}
