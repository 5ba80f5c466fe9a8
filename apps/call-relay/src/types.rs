use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Provider call status vocabulary.
///
/// `Queued` is accepted as an alias that enters before `Initiated`. The five
/// terminal states are mutually exclusive and sticky.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallStatus {
    Queued,
    Initiated,
    Ringing,
    InProgress,
    Completed,
    Busy,
    NoAnswer,
    Canceled,
    Failed,
}

impl CallStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Initiated => "initiated",
            Self::Ringing => "ringing",
            Self::InProgress => "in-progress",
            Self::Completed => "completed",
            Self::Busy => "busy",
            Self::NoAnswer => "no-answer",
            Self::Canceled => "canceled",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Busy | Self::NoAnswer | Self::Canceled | Self::Failed
        )
    }

    pub fn is_connected(self) -> bool {
        self == Self::InProgress
    }

    fn rank(self) -> u8 {
        match self {
            Self::Queued => 0,
            Self::Initiated => 1,
            Self::Ringing => 2,
            Self::InProgress => 3,
            Self::Completed | Self::Busy | Self::NoAnswer | Self::Canceled | Self::Failed => 4,
        }
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown call status: {0}")]
pub struct UnknownCallStatus(pub String);

impl FromStr for CallStatus {
    type Err = UnknownCallStatus;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "queued" => Ok(Self::Queued),
            "initiated" => Ok(Self::Initiated),
            "ringing" => Ok(Self::Ringing),
            // status-callback events report the answer as "answered"
            "in-progress" | "in_progress" | "answered" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "busy" => Ok(Self::Busy),
            "no-answer" | "no_answer" => Ok(Self::NoAnswer),
            "canceled" | "cancelled" => Ok(Self::Canceled),
            "failed" => Ok(Self::Failed),
            _ => Err(UnknownCallStatus(raw.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DurationSource {
    Estimated,
    Provider,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    pub id: String,
    pub destination: String,
    pub display_name: String,
    pub status: CallStatus,
    pub created_at: DateTime<Utc>,
    pub answered_at: Option<DateTime<Utc>>,
    pub duration_seconds: u64,
    pub duration_source: DurationSource,
    pub recording_url: Option<String>,
    pub recording_id: Option<String>,
    pub last_update: DateTime<Utc>,
}

/// One observation of a call's state, from any input channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub status: CallStatus,
    pub duration_seconds: Option<u64>,
    pub recording_url: Option<String>,
}

impl StatusUpdate {
    pub fn status(status: CallStatus) -> Self {
        Self {
            status,
            duration_seconds: None,
            recording_url: None,
        }
    }

    pub fn with_duration(mut self, duration_seconds: Option<u64>) -> Self {
        self.duration_seconds = duration_seconds;
        self
    }

    pub fn with_recording_url(mut self, recording_url: Option<String>) -> Self {
        self.recording_url = recording_url;
        self
    }
}

/// Outcome of running an update through [`CallRecord::apply_update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The record was already terminal; nothing changed.
    IgnoredTerminal,
    /// The update would move the record backwards; nothing changed.
    IgnoredStale,
    /// Same status observed again; duration or recording may have been refreshed.
    Refreshed,
    /// Status moved forward.
    Advanced {
        from: CallStatus,
        to: CallStatus,
    },
}

impl Transition {
    pub fn is_applied(self) -> bool {
        matches!(self, Self::Refreshed | Self::Advanced { .. })
    }

    pub fn became_terminal(self) -> bool {
        matches!(self, Self::Advanced { from, to } if to.is_terminal() && !from.is_terminal())
    }
}

impl CallRecord {
    pub fn new(
        id: impl Into<String>,
        destination: impl Into<String>,
        display_name: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            destination: destination.into(),
            display_name: display_name.into(),
            status: CallStatus::Initiated,
            created_at: now,
            answered_at: None,
            duration_seconds: 0,
            duration_source: DurationSource::Estimated,
            recording_url: None,
            recording_id: None,
            last_update: now,
        }
    }

    /// The single transition function shared by webhooks, polls and local actions.
    pub fn apply_update(&mut self, update: &StatusUpdate, now: DateTime<Utc>) -> Transition {
        if self.status.is_terminal() {
            return Transition::IgnoredTerminal;
        }
        let from = self.status;
        let to = update.status;
        if to.rank() < from.rank() {
            return Transition::IgnoredStale;
        }

        if to.is_connected() && self.answered_at.is_none() {
            self.answered_at = Some(now);
        }
        if let Some(url) = update.recording_url.as_deref() {
            let url = normalize_recording_url(url);
            if !url.is_empty() {
                self.recording_url = Some(url);
            }
        }

        if to.is_terminal() {
            self.duration_seconds = match update.duration_seconds {
                Some(reported) => reported,
                None => self.current_duration(now),
            };
            if update.duration_seconds.is_some() {
                self.duration_source = DurationSource::Provider;
            }
        } else if let Some(reported) = update.duration_seconds {
            let refreshed = reported.max(self.current_duration(now));
            self.duration_seconds = refreshed;
            self.duration_source = DurationSource::Provider;
        } else if to.is_connected() {
            self.duration_seconds = self.current_duration(now);
        }

        self.status = to;
        self.last_update = now;
        if from == to {
            Transition::Refreshed
        } else {
            Transition::Advanced { from, to }
        }
    }

    /// Duration as of `now`: frozen once terminal, provider-reported when known,
    /// otherwise estimated from `answered_at` while connected.
    pub fn current_duration(&self, now: DateTime<Utc>) -> u64 {
        if self.status.is_terminal() || self.duration_source == DurationSource::Provider {
            return self.duration_seconds;
        }
        match self.answered_at {
            Some(answered_at) => {
                let elapsed = (now - answered_at).num_seconds().max(0) as u64;
                elapsed.max(self.duration_seconds)
            }
            None => self.duration_seconds,
        }
    }

    pub fn attach_recording(&mut self, recording: &RecordingDescriptor) {
        self.recording_url = Some(recording.url.clone());
        self.recording_id = Some(recording.id.clone());
    }

    pub fn event(&self, now: DateTime<Utc>) -> CallEvent {
        CallEvent {
            call_id: self.id.clone(),
            status: self.status,
            duration_seconds: self.current_duration(now),
            recording_url: self.recording_url.clone(),
            timestamp: now,
        }
    }
}

/// Finalized recording metadata, keyed by call id in the recording index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingDescriptor {
    pub id: String,
    pub url: String,
    pub duration_seconds: u64,
    pub recorded_at: DateTime<Utc>,
}

/// State-change event pushed to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallEvent {
    pub call_id: String,
    pub status: CallStatus,
    pub duration_seconds: u64,
    pub recording_url: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Provider recording URLs are extensionless; clients fetch the mp3 rendition.
pub fn normalize_recording_url(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.ends_with(".mp3") || trimmed.ends_with(".wav") {
        trimmed.to_string()
    } else {
        format!("{trimmed}.mp3")
    }
}
