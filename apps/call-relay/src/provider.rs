use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::Deserialize;
use serde_json::Value;

use crate::config::{Config, ProviderCredentials};
use crate::types::{CallStatus, RecordingDescriptor, normalize_recording_url};

const TWILIO_API_VERSION: &str = "2010-04-01";
const TWILIO_NOT_FOUND_CODE: i64 = 20404;
const STATUS_CALLBACK_EVENTS: [&str; 4] = ["initiated", "ringing", "answered", "completed"];

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("provider resource not found: {0}")]
    NotFound(String),
    #[error("provider rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("provider transport error: {0}")]
    Transport(String),
    #[error("unexpected provider response: {0}")]
    InvalidResponse(String),
    #[error("refusing provider url: {0}")]
    InvalidUrl(String),
}

impl ProviderError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "provider_not_found",
            Self::Rejected { .. } => "provider_rejected",
            Self::Transport(_) => "provider_transport_error",
            Self::InvalidResponse(_) => "provider_invalid_response",
            Self::InvalidUrl(_) => "provider_invalid_url",
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginateRequest {
    pub to: String,
    pub display_name: String,
    pub record: bool,
}

/// Live call state as the provider reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderCall {
    pub sid: String,
    pub status: CallStatus,
    pub duration_seconds: Option<u64>,
}

pub struct RecordingMedia {
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub body: BoxStream<'static, Result<Bytes, ProviderError>>,
}

/// The only boundary that talks to the telephony provider.
#[async_trait]
pub trait ProviderGateway: Send + Sync {
    fn backend(&self) -> &'static str;

    async fn originate_call(&self, request: &OriginateRequest) -> Result<String, ProviderError>;

    async fn fetch_call(&self, call_sid: &str) -> Result<ProviderCall, ProviderError>;

    async fn terminate_call(&self, call_sid: &str) -> Result<(), ProviderError>;

    /// Finalized recordings for a call, newest first.
    async fn list_recordings(
        &self,
        call_sid: &str,
    ) -> Result<Vec<RecordingDescriptor>, ProviderError>;

    async fn fetch_recording_media(&self, url: &str) -> Result<RecordingMedia, ProviderError>;
}

/// Builds the Twilio gateway when credentials are present.
pub fn from_config(config: &Config) -> Option<Arc<dyn ProviderGateway>> {
    let credentials = config.provider.clone()?;
    Some(Arc::new(TwilioGateway::new(
        credentials,
        config.public_base_url.clone(),
        config.twiml_url.clone(),
        config.provider_timeout_ms,
    )))
}

pub struct TwilioGateway {
    client: reqwest::Client,
    credentials: ProviderCredentials,
    public_base_url: Option<String>,
    twiml_url: Option<String>,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct TwilioCallResource {
    sid: String,
    status: String,
    #[serde(default)]
    duration: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct TwilioRecordingList {
    #[serde(default)]
    recordings: Vec<TwilioRecordingResource>,
}

#[derive(Debug, Deserialize)]
struct TwilioRecordingResource {
    sid: String,
    #[serde(default)]
    uri: Option<String>,
    #[serde(default)]
    duration: Option<Value>,
    #[serde(default)]
    date_created: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

impl TwilioGateway {
    pub fn new(
        credentials: ProviderCredentials,
        public_base_url: Option<String>,
        twiml_url: Option<String>,
        timeout_ms: u64,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            credentials,
            public_base_url,
            twiml_url,
            timeout: Duration::from_millis(timeout_ms.clamp(250, 120_000)),
        }
    }

    fn api_base(&self) -> Result<reqwest::Url, ProviderError> {
        reqwest::Url::parse(&self.credentials.api_base_url).map_err(|error| {
            ProviderError::InvalidUrl(format!("{}: {error}", self.credentials.api_base_url))
        })
    }

    /// Account-scoped resource URL. Each segment is percent-encoded on its own,
    /// so a sid can never climb out of its resource path.
    fn account_url(&self, segments: &[&str]) -> Result<reqwest::Url, ProviderError> {
        let mut url = self.api_base()?;
        url.path_segments_mut()
            .map_err(|()| ProviderError::InvalidUrl(self.credentials.api_base_url.clone()))?
            .pop_if_empty()
            .extend([TWILIO_API_VERSION, "Accounts", self.credentials.account_sid.as_str()])
            .extend(segments);
        Ok(url)
    }

    /// Recording media is fetched with account credentials, so it must live on
    /// the provider API origin.
    fn media_url(&self, raw: &str) -> Result<reqwest::Url, ProviderError> {
        let url = reqwest::Url::parse(raw)
            .map_err(|error| ProviderError::InvalidUrl(format!("{raw}: {error}")))?;
        if url.origin() != self.api_base()?.origin() {
            return Err(ProviderError::InvalidUrl(format!(
                "{raw} is not on the provider api origin"
            )));
        }
        Ok(url)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .timeout(self.timeout)
            .basic_auth(
                &self.credentials.account_sid,
                Some(&self.credentials.auth_token),
            )
    }

    fn callback_url(&self, path: &str) -> Option<String> {
        self.public_base_url
            .as_deref()
            .map(|base| format!("{}{path}", base.trim_end_matches('/')))
    }

    fn originate_form(&self, request: &OriginateRequest) -> Vec<(&'static str, String)> {
        let mut form = vec![
            ("To", request.to.clone()),
            ("From", self.credentials.from_number.clone()),
        ];
        match self.twiml_url.as_deref() {
            Some(url) => form.push(("Url", url.to_string())),
            None => form.push(("Twiml", greeting_twiml(&request.display_name))),
        }
        if let Some(callback) = self.callback_url("/webhooks/call-status") {
            form.push(("StatusCallback", callback));
            form.push(("StatusCallbackMethod", "POST".to_string()));
            for event in STATUS_CALLBACK_EVENTS {
                form.push(("StatusCallbackEvent", event.to_string()));
            }
        }
        if request.record {
            form.push(("Record", "true".to_string()));
            if let Some(callback) = self.callback_url("/webhooks/recording-status") {
                form.push(("RecordingStatusCallback", callback));
                form.push(("RecordingStatusCallbackEvent", "completed".to_string()));
            }
        }
        form
    }

    fn recording_descriptor(
        &self,
        resource: TwilioRecordingResource,
    ) -> Result<RecordingDescriptor, ProviderError> {
        let uri = match resource.uri {
            Some(uri) => uri,
            None => self.account_url(&["Recordings", &resource.sid])?.to_string(),
        };
        let absolute = if uri.starts_with("http") {
            uri
        } else {
            format!(
                "{}{}",
                self.credentials.api_base_url.trim_end_matches('/'),
                uri
            )
        };
        let without_ext = absolute.strip_suffix(".json").unwrap_or(&absolute);
        Ok(RecordingDescriptor {
            id: resource.sid,
            url: normalize_recording_url(without_ext),
            duration_seconds: parse_duration_value(resource.duration.as_ref()).unwrap_or(0),
            recorded_at: resource
                .date_created
                .as_deref()
                .and_then(|raw| DateTime::parse_from_rfc2822(raw).ok())
                .map_or_else(Utc::now, |value| value.with_timezone(&Utc)),
        })
    }
}

#[async_trait]
impl ProviderGateway for TwilioGateway {
    fn backend(&self) -> &'static str {
        "twilio"
    }

    async fn originate_call(&self, request: &OriginateRequest) -> Result<String, ProviderError> {
        let response = self
            .authorized(self.client.post(self.account_url(&["Calls.json"])?))
            .form(&self.originate_form(request))
            .send()
            .await
            .map_err(|error| ProviderError::Transport(error.to_string()))?;
        let call: TwilioCallResource = decode_json(response).await?;
        tracing::info!(call_id = %call.sid, to = %request.to, status = %call.status, "provider call originated");
        Ok(call.sid)
    }

    async fn fetch_call(&self, call_sid: &str) -> Result<ProviderCall, ProviderError> {
        let response = self
            .authorized(
                self.client
                    .get(self.account_url(&["Calls", &format!("{call_sid}.json")])?),
            )
            .send()
            .await
            .map_err(|error| ProviderError::Transport(error.to_string()))?;
        let call: TwilioCallResource = decode_json(response).await?;
        let status = call
            .status
            .parse::<CallStatus>()
            .map_err(|error| ProviderError::InvalidResponse(error.to_string()))?;
        Ok(ProviderCall {
            sid: call.sid,
            status,
            duration_seconds: parse_duration_value(call.duration.as_ref()),
        })
    }

    async fn terminate_call(&self, call_sid: &str) -> Result<(), ProviderError> {
        let response = self
            .authorized(
                self.client
                    .post(self.account_url(&["Calls", &format!("{call_sid}.json")])?),
            )
            .form(&[("Status", "completed")])
            .send()
            .await
            .map_err(|error| ProviderError::Transport(error.to_string()))?;
        let _: Value = decode_json(response).await?;
        Ok(())
    }

    async fn list_recordings(
        &self,
        call_sid: &str,
    ) -> Result<Vec<RecordingDescriptor>, ProviderError> {
        let response = self
            .authorized(
                self.client
                    .get(self.account_url(&["Calls", call_sid, "Recordings.json"])?),
            )
            .send()
            .await
            .map_err(|error| ProviderError::Transport(error.to_string()))?;
        let list: TwilioRecordingList = decode_json(response).await?;
        list.recordings
            .into_iter()
            .filter(|recording| {
                recording
                    .status
                    .as_deref()
                    .is_none_or(|status| status == "completed")
            })
            .map(|recording| self.recording_descriptor(recording))
            .collect()
    }

    async fn fetch_recording_media(&self, url: &str) -> Result<RecordingMedia, ProviderError> {
        let media_url = self.media_url(url).inspect_err(|error| {
            tracing::warn!(url, reason = %error, "refusing recording media fetch");
        })?;
        let response = self
            .authorized(self.client.get(media_url))
            .send()
            .await
            .map_err(|error| ProviderError::Transport(error.to_string()))?;
        let status = response.status();
        if status.as_u16() == 404 {
            return Err(ProviderError::NotFound(url.to_string()));
        }
        if !status.is_success() {
            return Err(ProviderError::Rejected {
                status: status.as_u16(),
                message: format!("recording media request failed for {url}"),
            });
        }
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let content_length = response.content_length();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|error| ProviderError::Transport(error.to_string())))
            .boxed();
        Ok(RecordingMedia {
            content_type,
            content_length,
            body,
        })
    }
}

async fn decode_json<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, ProviderError> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|error| ProviderError::Transport(error.to_string()))?;
    if status.is_success() {
        return serde_json::from_str(&body)
            .map_err(|error| ProviderError::InvalidResponse(error.to_string()));
    }

    let parsed = serde_json::from_str::<Value>(&body).unwrap_or(Value::Null);
    let code = parsed.pointer("/code").and_then(Value::as_i64);
    let message = parsed
        .pointer("/message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| {
            if body.trim().is_empty() {
                format!("http_{}", status.as_u16())
            } else {
                body.clone()
            }
        });
    if status.as_u16() == 404 || code == Some(TWILIO_NOT_FOUND_CODE) {
        return Err(ProviderError::NotFound(message));
    }
    Err(ProviderError::Rejected {
        status: status.as_u16(),
        message,
    })
}

/// Provider durations arrive as strings, numbers or null.
fn parse_duration_value(value: Option<&Value>) -> Option<u64> {
    match value? {
        Value::Number(number) => number.as_u64(),
        Value::String(raw) => raw.trim().parse::<u64>().ok(),
        _ => None,
    }
}

fn greeting_twiml(display_name: &str) -> String {
    let name = escape_xml(display_name.trim());
    let greeting = if name.is_empty() {
        "Hello, this is an automated call.".to_string()
    } else {
        format!("Hello {name}, this is an automated call.")
    };
    format!("<Response><Say>{greeting}</Say><Pause length=\"60\"/></Response>")
}

fn escape_xml(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            other => escaped.push(other),
        }
    }
    escaped
}
