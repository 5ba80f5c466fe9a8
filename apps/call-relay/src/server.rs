use std::sync::Arc;

use axum::{
    Json, Router,
    body::Body,
    extract::{
        Form, Path, State,
        rejection::{FormRejection, JsonRejection},
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tower::ServiceBuilder;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::{
    config::Config,
    engine::{
        CallEngine, CallStatusView, EngineError, PushNotification, RecordingLocation,
        RecordingNotification,
    },
    fanout::{SubscriberHub, Subscription},
    types::{CallEvent, CallStatus},
};

#[derive(Clone)]
pub struct AppState {
    config: Config,
    engine: Arc<CallEngine>,
    fanout: Arc<SubscriberHub>,
    started_at: DateTime<Utc>,
}

impl AppState {
    #[must_use]
    pub fn new(config: Config, engine: Arc<CallEngine>, fanout: Arc<SubscriberHub>) -> Self {
        Self {
            config,
            engine,
            fanout,
            started_at: Utc::now(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    service: String,
    provider_configured: bool,
    active_calls: usize,
    indexed_recordings: usize,
    subscriber_count: usize,
    uptime_seconds: i64,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Default, Deserialize)]
struct MakeCallBody {
    #[serde(default)]
    to: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    record: Option<bool>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MakeCallResponse {
    success: bool,
    call_sid: String,
    status: CallStatus,
    message: String,
}

#[derive(Debug, Default, Deserialize)]
struct HangupBody {
    #[serde(default)]
    sid: Option<String>,
}

#[derive(Debug, Serialize)]
struct HangupResponse {
    success: bool,
    #[serde(flatten)]
    call: CallStatusView,
}

#[derive(Debug, Serialize)]
struct RecordingResponse {
    success: bool,
    #[serde(flatten)]
    recording: RecordingLocation,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CallStatusForm {
    call_sid: Option<String>,
    call_status: Option<String>,
    call_duration: Option<String>,
    recording_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RecordingStatusForm {
    call_sid: Option<String>,
    recording_sid: Option<String>,
    recording_url: Option<String>,
    recording_status: Option<String>,
    recording_duration: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
enum ServerFrame {
    Connected {
        #[serde(rename = "subscriberId")]
        subscriber_id: Uuid,
    },
    Pong,
    CallStatusUpdate(CallEvent),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
enum ClientFrame {
    Ping,
    Subscribe {
        #[serde(default, rename = "callId")]
        call_id: Option<String>,
    },
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/make-call", post(make_call))
        .route("/call-status/:sid", get(call_status))
        .route("/hangup-call", post(hangup_call))
        .route("/recording/:call_sid", get(get_recording))
        .route("/recording-audio/:call_sid", get(get_recording_audio))
        .route("/webhooks/call-status", post(call_status_webhook))
        .route("/webhooks/recording-status", post(recording_status_webhook))
        .route("/ws", get(call_events_ws))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(TraceLayer::new_for_http()),
        )
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let counts = state.engine.counts().await;
    let now = Utc::now();
    Json(HealthResponse {
        status: "ok",
        service: state.config.service_name.clone(),
        provider_configured: state.engine.provider_configured(),
        active_calls: counts.active_calls,
        indexed_recordings: counts.indexed_recordings,
        subscriber_count: state.fanout.len().await,
        uptime_seconds: (now - state.started_at).num_seconds(),
        timestamp: now,
    })
}

async fn make_call(
    State(state): State<AppState>,
    body: Result<Json<MakeCallBody>, JsonRejection>,
) -> Result<Json<MakeCallResponse>, ApiError> {
    let Json(body) = body.map_err(ApiError::from_json_rejection)?;
    let to = body.to.unwrap_or_default();
    let name = body.name.unwrap_or_default();
    let record = state
        .engine
        .originate(&to, &name, body.record)
        .await
        .map_err(ApiError::from_engine)?;
    Ok(Json(MakeCallResponse {
        success: true,
        message: format!("calling {}", record.destination),
        call_sid: record.id,
        status: record.status,
    }))
}

async fn call_status(
    State(state): State<AppState>,
    Path(sid): Path<String>,
) -> Result<Json<CallStatusView>, ApiError> {
    state
        .engine
        .get_status(&sid)
        .await
        .map(Json)
        .map_err(ApiError::from_engine)
}

async fn hangup_call(
    State(state): State<AppState>,
    body: Result<Json<HangupBody>, JsonRejection>,
) -> Result<Json<HangupResponse>, ApiError> {
    let Json(body) = body.map_err(ApiError::from_json_rejection)?;
    let sid = body.sid.unwrap_or_default();
    let call = state
        .engine
        .hangup(&sid)
        .await
        .map_err(ApiError::from_engine)?;
    Ok(Json(HangupResponse {
        success: true,
        call,
    }))
}

async fn get_recording(
    State(state): State<AppState>,
    Path(call_sid): Path<String>,
) -> Result<Json<RecordingResponse>, ApiError> {
    let recording = state
        .engine
        .get_recording(&call_sid)
        .await
        .map_err(ApiError::from_engine)?;
    Ok(Json(RecordingResponse {
        success: true,
        recording,
    }))
}

async fn get_recording_audio(
    State(state): State<AppState>,
    Path(call_sid): Path<String>,
) -> Result<Response, ApiError> {
    let media = state
        .engine
        .recording_media(&call_sid)
        .await
        .map_err(ApiError::from_engine)?;

    let content_type = media
        .content_type
        .as_deref()
        .and_then(|value| HeaderValue::from_str(value).ok())
        .unwrap_or_else(|| HeaderValue::from_static("audio/mpeg"));
    let mut response = Body::from_stream(media.body).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, content_type);
    if let Some(length) = media.content_length {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    }
    Ok(response)
}

async fn call_status_webhook(
    State(state): State<AppState>,
    form: Result<Form<CallStatusForm>, FormRejection>,
) -> StatusCode {
    let form = match form {
        Ok(Form(form)) => form,
        Err(rejection) => {
            tracing::warn!(reason = %rejection, "malformed call-status webhook");
            return StatusCode::OK;
        }
    };
    let (Some(call_id), Some(status)) = (form.call_sid, form.call_status) else {
        tracing::warn!("call-status webhook missing CallSid or CallStatus");
        return StatusCode::OK;
    };

    state
        .engine
        .apply_push(PushNotification {
            call_id,
            status,
            duration_seconds: parse_seconds(form.call_duration.as_deref()),
            recording_url: form.recording_url.filter(|url| !url.trim().is_empty()),
        })
        .await;
    StatusCode::OK
}

async fn recording_status_webhook(
    State(state): State<AppState>,
    form: Result<Form<RecordingStatusForm>, FormRejection>,
) -> StatusCode {
    let form = match form {
        Ok(Form(form)) => form,
        Err(rejection) => {
            tracing::warn!(reason = %rejection, "malformed recording-status webhook");
            return StatusCode::OK;
        }
    };
    let Some(call_id) = form.call_sid else {
        tracing::warn!("recording-status webhook missing CallSid");
        return StatusCode::OK;
    };

    state
        .engine
        .apply_recording(RecordingNotification {
            call_id,
            recording_id: form.recording_sid,
            recording_url: form.recording_url,
            recording_status: form.recording_status.unwrap_or_default(),
            duration_seconds: parse_seconds(form.recording_duration.as_deref()),
        })
        .await;
    StatusCode::OK
}

fn parse_seconds(raw: Option<&str>) -> Option<u64> {
    raw.and_then(|value| value.trim().parse::<u64>().ok())
}

async fn call_events_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let fanout = Arc::clone(&state.fanout);
    ws.on_upgrade(move |socket| call_events_stream(fanout, socket))
}

async fn call_events_stream(fanout: Arc<SubscriberHub>, mut socket: WebSocket) {
    let Subscription { id, mut receiver } = fanout.subscribe().await;
    if send_frame(&mut socket, &ServerFrame::Connected { subscriber_id: id })
        .await
        .is_err()
    {
        fanout.unsubscribe(id).await;
        return;
    }

    loop {
        tokio::select! {
            event = receiver.recv() => {
                // None means the hub dropped this subscriber.
                let Some(event) = event else { break };
                if send_frame(&mut socket, &ServerFrame::CallStatusUpdate(event)).await.is_err() {
                    break;
                }
            }
            next = socket.next() => {
                match next {
                    Some(Ok(Message::Text(text))) => {
                        if handle_client_frame(&fanout, id, &mut socket, &text).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(error)) => {
                        tracing::debug!(subscriber_id = %id, reason = %error, "websocket receive failed");
                        break;
                    }
                }
            }
        }
    }

    fanout.unsubscribe(id).await;
}

async fn handle_client_frame(
    fanout: &SubscriberHub,
    id: Uuid,
    socket: &mut WebSocket,
    text: &str,
) -> Result<(), axum::Error> {
    match serde_json::from_str::<ClientFrame>(text) {
        Ok(ClientFrame::Ping) => send_frame(socket, &ServerFrame::Pong).await,
        Ok(ClientFrame::Subscribe { call_id }) => {
            let call_id = call_id
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty());
            fanout.set_filter(id, call_id).await;
            Ok(())
        }
        Err(error) => {
            tracing::warn!(subscriber_id = %id, reason = %error, "ignoring malformed client frame");
            Ok(())
        }
    }
}

async fn send_frame(socket: &mut WebSocket, frame: &ServerFrame) -> Result<(), axum::Error> {
    let Ok(payload) = serde_json::to_string(frame) else {
        return Ok(());
    };
    socket.send(Message::Text(payload)).await
}

#[derive(Debug)]
enum ApiError {
    InvalidRequest(String),
    NotFound(String),
    ProviderUnavailable,
    Provider { code: &'static str, message: String },
    Internal(String),
}

impl ApiError {
    fn from_engine(error: EngineError) -> Self {
        match error {
            EngineError::Validation(message) => Self::InvalidRequest(message),
            EngineError::NotFound(id) => Self::NotFound(id),
            EngineError::ProviderUnavailable => Self::ProviderUnavailable,
            EngineError::Provider(error) => Self::Provider {
                code: error.code(),
                message: error.to_string(),
            },
            EngineError::Store(error) => Self::Internal(error.to_string()),
        }
    }

    fn from_json_rejection(rejection: JsonRejection) -> Self {
        Self::InvalidRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            Self::InvalidRequest(message) => (StatusCode::BAD_REQUEST, "invalid_request", message),
            Self::NotFound(id) => (StatusCode::NOT_FOUND, "not_found", format!("{id} not found")),
            Self::ProviderUnavailable => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "provider_unavailable",
                "telephony provider is not configured".to_string(),
            ),
            Self::Provider { code, message } => (StatusCode::INTERNAL_SERVER_ERROR, code, message),
            Self::Internal(message) => (StatusCode::INTERNAL_SERVER_ERROR, "internal", message),
        };
        (
            status,
            Json(serde_json::json!({
                "success": false,
                "error": code,
                "message": message,
            })),
        )
            .into_response()
    }
}
