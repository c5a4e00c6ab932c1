use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use pulse_core::errors::PipelineError;
use pulse_core::event::{Channel, ReplayPosition};

use crate::transport::{PollTransport, PushSubscription, PushTransport, RawMessage};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
// The server holds an events request open for up to 60s; leave headroom.
const LONG_POLL_TIMEOUT: Duration = Duration::from_secs(70);
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Both delivery paths against the change-event gateway: push via
/// subscription + long-polled event fetches, pull via the changes query
/// endpoint.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: String,
    token: SecretString,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, token: SecretString) -> Result<Self, PipelineError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| PipelineError::Connect(format!("http client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.header(
            "authorization",
            format!("Bearer {}", self.token.expose_secret()),
        )
        .header("accept", "application/json")
    }
}

#[derive(Serialize)]
struct SubscribeRequest<'a> {
    channel: &'a str,
    #[serde(rename = "replayAfter", skip_serializing_if = "Option::is_none")]
    replay_after: Option<i64>,
}

#[derive(Deserialize)]
struct SubscribeResponse {
    #[serde(rename = "subscriptionId")]
    subscription_id: String,
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "replayId")]
    replay_id: i64,
    payload: serde_json::Value,
}

impl From<Envelope> for RawMessage {
    fn from(env: Envelope) -> Self {
        Self {
            replay_id: env.replay_id,
            payload: env.payload,
        }
    }
}

fn transport_error(context: &str, err: reqwest::Error) -> PipelineError {
    if err.is_timeout() {
        PipelineError::Timeout(FETCH_TIMEOUT)
    } else {
        PipelineError::Connect(format!("{context}: {err}"))
    }
}

/// Gone or unimplemented means push is not on offer; everything else is
/// a transient transport fault.
fn subscribe_status_error(status: StatusCode, body: &str) -> PipelineError {
    match status.as_u16() {
        404 | 410 | 501 => {
            PipelineError::SubscriptionUnavailable(format!("subscribe: {status}"))
        }
        _ => PipelineError::Connect(format!("subscribe: {status} {body}")),
    }
}

#[async_trait]
impl PushTransport for HttpTransport {
    #[instrument(skip(self), fields(channel = %channel))]
    async fn subscribe(
        &self,
        channel: &Channel,
        resume_after: Option<ReplayPosition>,
    ) -> Result<Box<dyn PushSubscription>, PipelineError> {
        let body = SubscribeRequest {
            channel: channel.as_str(),
            replay_after: resume_after.map(|p| p.as_i64()),
        };
        let resp = self
            .authorize(self.client.post(format!("{}/subscriptions", self.base_url)))
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error("subscribe", e))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(subscribe_status_error(status, &body));
        }

        let parsed: SubscribeResponse = resp
            .json()
            .await
            .map_err(|e| PipelineError::Connect(format!("subscribe response: {e}")))?;
        debug!(channel = %channel, subscription_id = %parsed.subscription_id, "subscription created");

        Ok(Box::new(HttpSubscription {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            token: self.token.clone(),
            subscription_id: parsed.subscription_id,
            queue: VecDeque::new(),
        }))
    }
}

struct HttpSubscription {
    client: Client,
    base_url: String,
    token: SecretString,
    subscription_id: String,
    queue: VecDeque<RawMessage>,
}

#[async_trait]
impl PushSubscription for HttpSubscription {
    async fn recv(&mut self) -> Result<RawMessage, PipelineError> {
        loop {
            if let Some(raw) = self.queue.pop_front() {
                return Ok(raw);
            }

            let url = format!(
                "{}/subscriptions/{}/events",
                self.base_url, self.subscription_id
            );
            let resp = self
                .client
                .get(url)
                .header(
                    "authorization",
                    format!("Bearer {}", self.token.expose_secret()),
                )
                .header("accept", "application/json")
                .timeout(LONG_POLL_TIMEOUT)
                .send()
                .await
                .map_err(|e| transport_error("events", e))?;

            match resp.status().as_u16() {
                200 => {
                    let batch: Vec<Envelope> = resp
                        .json()
                        .await
                        .map_err(|e| PipelineError::Connect(format!("events body: {e}")))?;
                    // An empty batch is a long-poll timeout on the server
                    // side; ask again.
                    self.queue.extend(batch.into_iter().map(RawMessage::from));
                }
                404 | 410 => {
                    return Err(PipelineError::SubscriptionUnavailable(
                        "subscription expired".into(),
                    ));
                }
                status => {
                    let body = resp.text().await.unwrap_or_default();
                    return Err(PipelineError::Connect(format!("events: {status} {body}")));
                }
            }
        }
    }

    async fn unsubscribe(&mut self) {
        let url = format!("{}/subscriptions/{}", self.base_url, self.subscription_id);
        let result = self
            .client
            .delete(url)
            .header(
                "authorization",
                format!("Bearer {}", self.token.expose_secret()),
            )
            .send()
            .await;
        if let Err(e) = result {
            warn!(subscription_id = %self.subscription_id, error = %e, "unsubscribe failed");
        }
    }
}

#[async_trait]
impl PollTransport for HttpTransport {
    #[instrument(skip(self), fields(channel = %channel))]
    async fn fetch_since(
        &self,
        channel: &Channel,
        after: Option<ReplayPosition>,
        limit: u32,
    ) -> Result<Vec<RawMessage>, PipelineError> {
        let mut query: Vec<(&str, String)> = vec![
            ("channel", channel.as_str().to_string()),
            ("limit", limit.to_string()),
        ];
        if let Some(after) = after {
            query.push(("after", after.as_i64().to_string()));
        }

        let resp = self
            .authorize(self.client.get(format!("{}/changes", self.base_url)))
            .query(&query)
            .timeout(FETCH_TIMEOUT)
            .send()
            .await
            .map_err(|e| transport_error("changes", e))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(PipelineError::Connect(format!("changes: {status} {body}")));
        }

        let batch: Vec<Envelope> = resp
            .json()
            .await
            .map_err(|e| PipelineError::Connect(format!("changes body: {e}")))?;
        Ok(batch.into_iter().map(RawMessage::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_trailing_slash_trimmed() {
        let t =
            HttpTransport::new("https://gateway.example/api/", SecretString::from("tok")).unwrap();
        assert_eq!(t.base_url, "https://gateway.example/api");
    }

    #[test]
    fn subscribe_request_omits_missing_resume() {
        let body = SubscribeRequest {
            channel: "/data/TaskChangeEvent",
            replay_after: None,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert!(json.get("replayAfter").is_none());

        let body = SubscribeRequest {
            channel: "/data/TaskChangeEvent",
            replay_after: Some(42),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["replayAfter"], 42);
    }

    #[test]
    fn envelope_deserializes() {
        let env: Envelope = serde_json::from_str(
            r#"{"replayId": 7, "payload": {"ChangeEventHeader": {}}}"#,
        )
        .unwrap();
        let raw = RawMessage::from(env);
        assert_eq!(raw.replay_id, 7);
        assert!(raw.payload.is_object());
    }

    #[test]
    fn gone_endpoints_mean_push_unavailable() {
        assert!(matches!(
            subscribe_status_error(StatusCode::GONE, ""),
            PipelineError::SubscriptionUnavailable(_)
        ));
        assert!(matches!(
            subscribe_status_error(StatusCode::NOT_IMPLEMENTED, ""),
            PipelineError::SubscriptionUnavailable(_)
        ));
        assert!(matches!(
            subscribe_status_error(StatusCode::INTERNAL_SERVER_ERROR, "boom"),
            PipelineError::Connect(_)
        ));
    }
}
