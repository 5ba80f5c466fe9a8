use std::collections::HashMap;

use async_trait::async_trait;
use axum::body::Bytes;
use futures::StreamExt;
use tokio::sync::Mutex;

use crate::provider::{
    OriginateRequest, ProviderCall, ProviderError, ProviderGateway, RecordingMedia,
};
use crate::types::{CallStatus, RecordingDescriptor};

#[derive(Debug, Clone)]
pub enum FakeFailure {
    NotFound,
    Rejected(String),
    Transport,
}

impl FakeFailure {
    fn to_error(&self, subject: &str) -> ProviderError {
        match self {
            Self::NotFound => ProviderError::NotFound(subject.to_string()),
            Self::Rejected(message) => ProviderError::Rejected {
                status: 400,
                message: message.clone(),
            },
            Self::Transport => ProviderError::Transport("connection reset".to_string()),
        }
    }
}

#[derive(Default)]
struct FakeState {
    next_sid: u32,
    calls: HashMap<String, ProviderCall>,
    recordings: HashMap<String, Vec<RecordingDescriptor>>,
    media: HashMap<String, (String, Vec<u8>)>,
    originate_failure: Option<FakeFailure>,
    fetch_failure: Option<FakeFailure>,
    terminate_failure: Option<FakeFailure>,
    fetch_count: usize,
    list_count: usize,
    originated: Vec<OriginateRequest>,
    terminated: Vec<String>,
}

/// In-memory provider used by engine and router tests.
#[derive(Default)]
pub struct FakeProvider {
    state: Mutex<FakeState>,
}

impl FakeProvider {
    pub async fn set_call(&self, sid: &str, status: CallStatus, duration_seconds: Option<u64>) {
        self.state.lock().await.calls.insert(
            sid.to_string(),
            ProviderCall {
                sid: sid.to_string(),
                status,
                duration_seconds,
            },
        );
    }

    pub async fn add_recording(&self, call_sid: &str, descriptor: RecordingDescriptor) {
        self.state
            .lock()
            .await
            .recordings
            .entry(call_sid.to_string())
            .or_default()
            .push(descriptor);
    }

    pub async fn add_media(&self, url: &str, content_type: &str, bytes: &[u8]) {
        self.state
            .lock()
            .await
            .media
            .insert(url.to_string(), (content_type.to_string(), bytes.to_vec()));
    }

    pub async fn fail_originate(&self, failure: FakeFailure) {
        self.state.lock().await.originate_failure = Some(failure);
    }

    pub async fn fail_fetch(&self, failure: Option<FakeFailure>) {
        self.state.lock().await.fetch_failure = failure;
    }

    pub async fn fail_terminate(&self, failure: FakeFailure) {
        self.state.lock().await.terminate_failure = Some(failure);
    }

    pub async fn fetch_count(&self) -> usize {
        self.state.lock().await.fetch_count
    }

    pub async fn list_count(&self) -> usize {
        self.state.lock().await.list_count
    }

    pub async fn originated(&self) -> Vec<OriginateRequest> {
        self.state.lock().await.originated.clone()
    }

    pub async fn terminated(&self) -> Vec<String> {
        self.state.lock().await.terminated.clone()
    }
}

#[async_trait]
impl ProviderGateway for FakeProvider {
    fn backend(&self) -> &'static str {
        "fake"
    }

    async fn originate_call(&self, request: &OriginateRequest) -> Result<String, ProviderError> {
        let mut state = self.state.lock().await;
        if let Some(failure) = state.originate_failure.as_ref() {
            return Err(failure.to_error(&request.to));
        }
        state.next_sid += 1;
        let sid = format!("CA{}", state.next_sid);
        state.calls.insert(
            sid.clone(),
            ProviderCall {
                sid: sid.clone(),
                status: CallStatus::Queued,
                duration_seconds: None,
            },
        );
        state.originated.push(request.clone());
        Ok(sid)
    }

    async fn fetch_call(&self, call_sid: &str) -> Result<ProviderCall, ProviderError> {
        let mut state = self.state.lock().await;
        state.fetch_count += 1;
        if let Some(failure) = state.fetch_failure.as_ref() {
            return Err(failure.to_error(call_sid));
        }
        state
            .calls
            .get(call_sid)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(call_sid.to_string()))
    }

    async fn terminate_call(&self, call_sid: &str) -> Result<(), ProviderError> {
        let mut state = self.state.lock().await;
        state.terminated.push(call_sid.to_string());
        if let Some(failure) = state.terminate_failure.as_ref() {
            return Err(failure.to_error(call_sid));
        }
        match state.calls.get_mut(call_sid) {
            Some(call) => {
                call.status = CallStatus::Completed;
                Ok(())
            }
            None => Err(ProviderError::NotFound(call_sid.to_string())),
        }
    }

    async fn list_recordings(
        &self,
        call_sid: &str,
    ) -> Result<Vec<RecordingDescriptor>, ProviderError> {
        let mut state = self.state.lock().await;
        state.list_count += 1;
        Ok(state.recordings.get(call_sid).cloned().unwrap_or_default())
    }

    async fn fetch_recording_media(&self, url: &str) -> Result<RecordingMedia, ProviderError> {
        let state = self.state.lock().await;
        let (content_type, bytes) = state
            .media
            .get(url)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(url.to_string()))?;
        let content_length = bytes.len() as u64;
        let chunks = bytes
            .chunks(4)
            .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
            .collect::<Vec<_>>();
        Ok(RecordingMedia {
            content_type: Some(content_type),
            content_length: Some(content_length),
            body: futures::stream::iter(chunks).boxed(),
        })
    }
}
