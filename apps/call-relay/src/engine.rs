use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::call_store::{CallRecordStore, StoreError};
use crate::config::Config;
use crate::deferred::{DeferredKind, DeferredTasks};
use crate::fanout::SubscriberHub;
use crate::provider::{OriginateRequest, ProviderError, ProviderGateway, RecordingMedia};
use crate::recording_index::RecordingIndex;
use crate::types::{
    CallEvent, CallRecord, CallStatus, RecordingDescriptor, StatusUpdate, Transition,
    normalize_recording_url,
};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("{0}")]
    Validation(String),
    #[error("telephony provider is not configured")]
    ProviderUnavailable,
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub record_by_default: bool,
    pub record_retention: Duration,
    pub recording_lookup_delay: Duration,
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            record_by_default: config.record_by_default,
            record_retention: Duration::from_secs(config.record_retention_seconds),
            recording_lookup_delay: Duration::from_millis(config.recording_lookup_delay_ms),
        }
    }
}

/// Provider push for one call, already decoded from the webhook form.
#[derive(Debug, Clone, Default)]
pub struct PushNotification {
    pub call_id: String,
    pub status: String,
    pub duration_seconds: Option<u64>,
    pub recording_url: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RecordingNotification {
    pub call_id: String,
    pub recording_id: Option<String>,
    pub recording_url: Option<String>,
    pub recording_status: String,
    pub duration_seconds: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    UnknownStatus,
    UnknownCall,
    Applied(Transition),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallStatusView {
    pub call_id: String,
    pub status: CallStatus,
    pub duration_seconds: u64,
    pub recording_url: Option<String>,
}

impl CallStatusView {
    fn from_record(record: &CallRecord, now: DateTime<Utc>) -> Self {
        Self {
            call_id: record.id.clone(),
            status: record.status,
            duration_seconds: record.current_duration(now),
            recording_url: record.recording_url.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecordingSource {
    Cache,
    ActiveCache,
    Provider,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingLocation {
    pub recording_url: String,
    pub duration_seconds: u64,
    pub source: RecordingSource,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineCounts {
    pub active_calls: usize,
    pub indexed_recordings: usize,
}

/// Merges origination, provider pushes and active polls into one view per call
/// and publishes every accepted change to the subscriber hub.
pub struct CallEngine {
    store: CallRecordStore,
    recordings: RecordingIndex,
    fanout: Arc<SubscriberHub>,
    provider: Option<Arc<dyn ProviderGateway>>,
    deferred: Arc<DeferredTasks>,
    settings: EngineSettings,
    /// Held from a record change through its broadcast, so subscribers see
    /// changes in the order they were applied.
    publish_order: Mutex<()>,
}

impl CallEngine {
    pub fn new(
        fanout: Arc<SubscriberHub>,
        provider: Option<Arc<dyn ProviderGateway>>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            store: CallRecordStore::default(),
            recordings: RecordingIndex::default(),
            fanout,
            provider,
            deferred: DeferredTasks::shared(),
            settings,
            publish_order: Mutex::new(()),
        }
    }

    pub fn provider_configured(&self) -> bool {
        self.provider.is_some()
    }

    pub async fn counts(&self) -> EngineCounts {
        EngineCounts {
            active_calls: self.store.len().await,
            indexed_recordings: self.recordings.len().await,
        }
    }

    pub async fn record(&self, call_id: &str) -> Option<CallRecord> {
        self.store.get(call_id).await
    }

    pub async fn originate(
        &self,
        to: &str,
        display_name: &str,
        record: Option<bool>,
    ) -> Result<CallRecord, EngineError> {
        let to = to.trim();
        if to.is_empty() {
            return Err(EngineError::Validation("to is required".to_string()));
        }
        let provider = self
            .provider
            .as_ref()
            .ok_or(EngineError::ProviderUnavailable)?;

        let request = OriginateRequest {
            to: to.to_string(),
            display_name: display_name.trim().to_string(),
            record: record.unwrap_or(self.settings.record_by_default),
        };
        let call_id = provider.originate_call(&request).await.map_err(|error| {
            tracing::warn!(to, reason = %error, "call origination rejected");
            EngineError::Provider(error)
        })?;

        let record = {
            let _order = self.publish_order.lock().await;
            let now = Utc::now();
            let record = self
                .store
                .create(CallRecord::new(
                    call_id,
                    request.to,
                    request.display_name,
                    now,
                ))
                .await?;
            self.publish(record.event(now)).await;
            record
        };
        tracing::info!(call_id = %record.id, to, record = request.record, "call initiated");
        Ok(record)
    }

    /// Webhook channel: applied unless terminal, always broadcast when accepted.
    pub async fn apply_push(self: &Arc<Self>, push: PushNotification) -> PushOutcome {
        let status = match push.status.parse::<CallStatus>() {
            Ok(status) => status,
            Err(error) => {
                tracing::warn!(call_id = %push.call_id, reason = %error, "ignoring push with unknown status");
                return PushOutcome::UnknownStatus;
            }
        };
        let update = StatusUpdate::status(status)
            .with_duration(reported_duration(status, push.duration_seconds))
            .with_recording_url(push.recording_url);

        let Some((transition, record, _)) = self
            .commit(&push.call_id, &update, Transition::is_applied)
            .await
        else {
            tracing::info!(call_id = %push.call_id, status = %status, "push for untracked call");
            return PushOutcome::UnknownCall;
        };

        tracing::info!(
            call_id = %record.id,
            status = %record.status,
            transition = ?transition,
            "push notification merged"
        );
        if transition.became_terminal() {
            self.on_terminal(&record).await;
        }
        PushOutcome::Applied(transition)
    }

    /// Status query. Live non-terminal calls are re-polled so hangups surface
    /// without waiting for the provider push.
    pub async fn get_status(self: &Arc<Self>, call_id: &str) -> Result<CallStatusView, EngineError> {
        let call_id = valid_call_id(call_id)?;
        let cached = self.store.get(call_id).await;
        match (cached, self.provider.as_ref()) {
            (Some(record), Some(provider)) if !record.status.is_terminal() => {
                Ok(self.poll(provider.as_ref(), record).await)
            }
            (Some(record), _) => Ok(CallStatusView::from_record(&record, Utc::now())),
            (None, Some(provider)) => match provider.fetch_call(call_id).await {
                Ok(call) => Ok(CallStatusView {
                    call_id: call.sid,
                    status: call.status,
                    duration_seconds: call.duration_seconds.unwrap_or(0),
                    recording_url: self
                        .recordings
                        .get(call_id)
                        .await
                        .map(|recording| recording.url),
                }),
                Err(ProviderError::NotFound(_)) => Err(EngineError::NotFound(call_id.to_string())),
                Err(error) => Err(EngineError::Provider(error)),
            },
            (None, None) => Err(EngineError::NotFound(call_id.to_string())),
        }
    }

    async fn poll(self: &Arc<Self>, provider: &dyn ProviderGateway, cached: CallRecord) -> CallStatusView {
        let polled = match provider.fetch_call(&cached.id).await {
            Ok(polled) => polled,
            Err(error) => {
                tracing::warn!(call_id = %cached.id, reason = %error, "status poll failed; serving cached state");
                return CallStatusView::from_record(&cached, Utc::now());
            }
        };

        let update = StatusUpdate::status(polled.status)
            .with_duration(reported_duration(polled.status, polled.duration_seconds));
        let Some((transition, record, now)) = self
            .commit(&cached.id, &update, Transition::became_terminal)
            .await
        else {
            return CallStatusView {
                call_id: polled.sid,
                status: polled.status,
                duration_seconds: polled.duration_seconds.unwrap_or(0),
                recording_url: None,
            };
        };

        if transition.became_terminal() {
            tracing::info!(call_id = %record.id, status = %record.status, "poll caught terminal transition");
            self.on_terminal(&record).await;
        } else if transition.is_applied() {
            tracing::debug!(call_id = %record.id, status = %record.status, "poll refreshed cached state");
        }
        CallStatusView::from_record(&record, now)
    }

    /// Hangs up a call. The local record always ends `completed` and is
    /// broadcast, even when the provider request fails for another reason.
    pub async fn hangup(self: &Arc<Self>, call_id: &str) -> Result<CallStatusView, EngineError> {
        let call_id = valid_call_id(call_id)?;

        let provider_result = match self.provider.as_ref() {
            Some(provider) => match provider.terminate_call(call_id).await {
                Ok(()) => Ok(()),
                Err(error) if error.is_not_found() => {
                    tracing::info!(call_id, "provider reports call already gone");
                    Ok(())
                }
                Err(error) => {
                    tracing::warn!(call_id, reason = %error, "provider hangup failed");
                    Err(error)
                }
            },
            None => Ok(()),
        };

        let update = StatusUpdate::status(CallStatus::Completed);
        let view = match self.commit(call_id, &update, |_| true).await {
            Some((transition, record, now)) => {
                if transition.became_terminal() {
                    self.on_terminal(&record).await;
                }
                CallStatusView::from_record(&record, now)
            }
            None => {
                let view = CallStatusView {
                    call_id: call_id.to_string(),
                    status: CallStatus::Completed,
                    duration_seconds: 0,
                    recording_url: self
                        .recordings
                        .get(call_id)
                        .await
                        .map(|recording| recording.url),
                };
                let _order = self.publish_order.lock().await;
                self.publish(CallEvent {
                    call_id: view.call_id.clone(),
                    status: view.status,
                    duration_seconds: 0,
                    recording_url: view.recording_url.clone(),
                    timestamp: Utc::now(),
                })
                .await;
                view
            }
        };

        provider_result?;
        Ok(view)
    }

    /// Recording webhook channel. Only finalized recordings change state.
    pub async fn apply_recording(&self, notification: RecordingNotification) -> bool {
        if !notification
            .recording_status
            .trim()
            .eq_ignore_ascii_case("completed")
        {
            tracing::debug!(
                call_id = %notification.call_id,
                recording_status = %notification.recording_status,
                "ignoring non-final recording status"
            );
            return false;
        }
        let url = notification
            .recording_url
            .as_deref()
            .map(normalize_recording_url)
            .unwrap_or_default();
        if notification.call_id.trim().is_empty() || url.is_empty() {
            tracing::warn!(call_id = %notification.call_id, "recording webhook missing call or url");
            return false;
        }

        let descriptor = RecordingDescriptor {
            id: notification.recording_id.unwrap_or_default(),
            url,
            duration_seconds: notification.duration_seconds.unwrap_or(0),
            recorded_at: Utc::now(),
        };
        self.deferred
            .cancel(&notification.call_id, DeferredKind::RecordingLookup)
            .await;
        self.index_recording(&notification.call_id, descriptor).await;
        true
    }

    pub async fn get_recording(&self, call_id: &str) -> Result<RecordingLocation, EngineError> {
        let call_id = valid_call_id(call_id)?;
        if let Some(recording) = self.recordings.get(call_id).await {
            return Ok(RecordingLocation {
                recording_url: recording.url,
                duration_seconds: recording.duration_seconds,
                source: RecordingSource::Cache,
            });
        }
        if let Some(record) = self.store.get(call_id).await
            && let Some(url) = record.recording_url.clone()
        {
            return Ok(RecordingLocation {
                recording_url: url,
                duration_seconds: record.current_duration(Utc::now()),
                source: RecordingSource::ActiveCache,
            });
        }

        let Some(provider) = self.provider.as_ref() else {
            return Err(EngineError::NotFound(call_id.to_string()));
        };
        let newest = match provider.list_recordings(call_id).await {
            Ok(recordings) => recordings.into_iter().next(),
            Err(ProviderError::NotFound(_)) => None,
            Err(error) => return Err(EngineError::Provider(error)),
        };
        let Some(recording) = newest else {
            return Err(EngineError::NotFound(call_id.to_string()));
        };
        let location = RecordingLocation {
            recording_url: recording.url.clone(),
            duration_seconds: recording.duration_seconds,
            source: RecordingSource::Provider,
        };
        self.index_recording(call_id, recording).await;
        Ok(location)
    }

    pub async fn recording_media(&self, call_id: &str) -> Result<RecordingMedia, EngineError> {
        let location = self.get_recording(call_id).await?;
        let provider = self
            .provider
            .as_ref()
            .ok_or(EngineError::ProviderUnavailable)?;
        provider
            .fetch_recording_media(&location.recording_url)
            .await
            .map_err(|error| match error {
                ProviderError::NotFound(_) => EngineError::NotFound(call_id.to_string()),
                other => EngineError::Provider(other),
            })
    }

    /// Applies one update and, when `broadcast` accepts the transition,
    /// publishes it before any later change can be applied.
    async fn commit<B>(
        &self,
        call_id: &str,
        update: &StatusUpdate,
        broadcast: B,
    ) -> Option<(Transition, CallRecord, DateTime<Utc>)>
    where
        B: FnOnce(Transition) -> bool,
    {
        let _order = self.publish_order.lock().await;
        let now = Utc::now();
        let (transition, record) = self
            .store
            .mutate(call_id, |record| {
                let transition = record.apply_update(update, now);
                (transition, record.clone())
            })
            .await?;
        if broadcast(transition) {
            self.publish(record.event(now)).await;
        }
        Some((transition, record, now))
    }

    async fn publish(&self, event: CallEvent) {
        let report = self.fanout.broadcast(&event).await;
        tracing::debug!(
            call_id = %event.call_id,
            status = %event.status,
            delivered = report.delivered,
            evicted = report.evicted,
            "call event published"
        );
    }

    async fn index_recording(&self, call_id: &str, descriptor: RecordingDescriptor) {
        self.recordings.put(call_id, descriptor.clone()).await;
        tracing::info!(call_id, recording_id = %descriptor.id, "recording indexed");
        let _order = self.publish_order.lock().await;
        let overlay = self
            .store
            .mutate(call_id, |record| {
                record.attach_recording(&descriptor);
                record.clone()
            })
            .await;
        if let Some(record) = overlay {
            self.publish(record.event(Utc::now())).await;
        }
    }

    async fn on_terminal(self: &Arc<Self>, record: &CallRecord) {
        let call_id = record.id.as_str();
        if record.recording_url.is_none() && !self.recordings.contains(call_id).await {
            let engine = Arc::clone(self);
            let lookup_id = call_id.to_string();
            self.deferred
                .schedule(
                    call_id,
                    DeferredKind::RecordingLookup,
                    self.settings.recording_lookup_delay,
                    async move { engine.lookup_recording(&lookup_id).await },
                )
                .await;
        }

        let engine = Arc::clone(self);
        let evict_id = call_id.to_string();
        self.deferred
            .schedule(
                call_id,
                DeferredKind::Eviction,
                self.settings.record_retention,
                async move { engine.evict(&evict_id).await },
            )
            .await;
    }

    async fn lookup_recording(&self, call_id: &str) {
        if self.recordings.contains(call_id).await {
            return;
        }
        let Some(provider) = self.provider.as_ref() else {
            return;
        };
        match provider.list_recordings(call_id).await {
            Ok(recordings) => match recordings.into_iter().next() {
                Some(recording) => self.index_recording(call_id, recording).await,
                None => tracing::debug!(call_id, "no recording available after call end"),
            },
            Err(error) => {
                tracing::warn!(call_id, reason = %error, "deferred recording lookup failed");
            }
        }
    }

    async fn evict(&self, call_id: &str) {
        self.deferred
            .cancel(call_id, DeferredKind::RecordingLookup)
            .await;
        if self.store.evict(call_id).await.is_some() {
            tracing::info!(call_id, "evicted terminal call record");
        }
    }
}

/// Provider call sids are plain alphanumerics and end up in provider URLs.
fn valid_call_id(call_id: &str) -> Result<&str, EngineError> {
    let call_id = call_id.trim();
    if call_id.is_empty() {
        return Err(EngineError::Validation("sid is required".to_string()));
    }
    if !call_id.bytes().all(|byte| byte.is_ascii_alphanumeric()) {
        return Err(EngineError::Validation(format!("invalid sid: {call_id}")));
    }
    Ok(call_id)
}

/// Provider durations for live calls are zero until the call ends.
fn reported_duration(status: CallStatus, duration_seconds: Option<u64>) -> Option<u64> {
    if status.is_terminal() {
        duration_seconds
    } else {
        duration_seconds.filter(|seconds| *seconds > 0)
    }
}
