use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use pulse_core::errors::PipelineError;
use pulse_core::ids::{RecordId, ResponderId};
use pulse_core::sink::{StateSink, WriteOutcome, WritePrecondition};
use pulse_core::state::{FirstResponseState, FirstResponseUpdate, ResponseSource};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// State sink backed by the record store's REST interface. The store
/// evaluates the write precondition server-side and answers 409 when an
/// earlier or equal response is already recorded.
#[derive(Clone)]
pub struct HttpRecordSink {
    client: Client,
    base_url: String,
    token: SecretString,
}

impl HttpRecordSink {
    pub fn new(base_url: impl Into<String>, token: SecretString) -> Result<Self, PipelineError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| PipelineError::SinkUnavailable(format!("http client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    fn record_url(&self, record_id: &RecordId) -> String {
        format!(
            "{}/records/{}/first-response",
            self.base_url,
            record_id.as_str()
        )
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.header(
            "authorization",
            format!("Bearer {}", self.token.expose_secret()),
        )
        .header("accept", "application/json")
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecordStateDto {
    record_id: RecordId,
    created_at: DateTime<Utc>,
    #[serde(default)]
    first_responded_at: Option<DateTime<Utc>>,
    #[serde(default)]
    responder_id: Option<ResponderId>,
    #[serde(default)]
    response_source: Option<ResponseSource>,
    #[serde(default)]
    minutes_to_first_response: Option<i64>,
}

impl From<RecordStateDto> for FirstResponseState {
    fn from(dto: RecordStateDto) -> Self {
        Self {
            record_id: dto.record_id,
            created_at: dto.created_at,
            first_responded_at: dto.first_responded_at,
            responder_id: dto.responder_id,
            response_source: dto.response_source,
            minutes_to_first_response: dto.minutes_to_first_response,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UpdateDto<'a> {
    first_responded_at: DateTime<Utc>,
    responder_id: &'a ResponderId,
    response_source: ResponseSource,
    minutes_to_first_response: i64,
    precondition: &'static str,
}

fn precondition_name(precondition: WritePrecondition) -> &'static str {
    match precondition {
        WritePrecondition::IfEarlierThanStored => "if_earlier",
        WritePrecondition::Unconditional => "unconditional",
    }
}

fn sink_error(context: &str, err: reqwest::Error) -> PipelineError {
    if err.is_timeout() {
        PipelineError::Timeout(REQUEST_TIMEOUT)
    } else {
        PipelineError::SinkUnavailable(format!("{context}: {err}"))
    }
}

fn status_error(context: &str, status: StatusCode, body: &str) -> PipelineError {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        PipelineError::SinkUnavailable(format!("{context}: {status} {body}"))
    } else {
        PipelineError::Extraction(format!("{context}: {status} {body}"))
    }
}

#[async_trait]
impl StateSink for HttpRecordSink {
    #[instrument(skip(self), fields(record_id = %record_id))]
    async fn read_state(
        &self,
        record_id: &RecordId,
    ) -> Result<Option<FirstResponseState>, PipelineError> {
        let resp = self
            .authorize(self.client.get(self.record_url(record_id)))
            .send()
            .await
            .map_err(|e| sink_error("read state", e))?;

        match resp.status() {
            StatusCode::OK => {
                let dto: RecordStateDto = resp
                    .json()
                    .await
                    .map_err(|e| PipelineError::SinkUnavailable(format!("state body: {e}")))?;
                Ok(Some(dto.into()))
            }
            StatusCode::NOT_FOUND => Ok(None),
            status => {
                let body = resp.text().await.unwrap_or_default();
                Err(status_error("read state", status, &body))
            }
        }
    }

    #[instrument(skip(self, update), fields(record_id = %record_id))]
    async fn conditional_write(
        &self,
        record_id: &RecordId,
        update: FirstResponseUpdate,
        precondition: WritePrecondition,
    ) -> Result<WriteOutcome, PipelineError> {
        let body = UpdateDto {
            first_responded_at: update.first_responded_at,
            responder_id: &update.responder_id,
            response_source: update.response_source,
            minutes_to_first_response: update.minutes_to_first_response,
            precondition: precondition_name(precondition),
        };

        let resp = self
            .authorize(self.client.patch(self.record_url(record_id)))
            .json(&body)
            .send()
            .await
            .map_err(|e| sink_error("write state", e))?;

        match resp.status() {
            StatusCode::OK | StatusCode::NO_CONTENT => Ok(WriteOutcome::Applied),
            StatusCode::CONFLICT => Ok(WriteOutcome::Rejected),
            StatusCode::NOT_FOUND => Err(PipelineError::Extraction(format!(
                "record {record_id} not present at sink"
            ))),
            status => {
                let body = resp.text().await.unwrap_or_default();
                Err(status_error("write state", status, &body))
            }
        }
    }
}
