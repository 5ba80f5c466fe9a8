use std::{
    env,
    net::{AddrParseError, SocketAddr},
};

use thiserror::Error;

/// Telephony account settings. Present only when every required variable is set.
#[derive(Clone, Debug)]
pub struct ProviderCredentials {
    pub account_sid: String,
    pub auth_token: String,
    pub from_number: String,
    pub api_base_url: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Json => "json",
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub service_name: String,
    pub bind_addr: SocketAddr,
    pub public_base_url: Option<String>,
    pub twiml_url: Option<String>,
    pub provider: Option<ProviderCredentials>,
    pub provider_timeout_ms: u64,
    pub record_by_default: bool,
    pub record_retention_seconds: u64,
    pub recording_lookup_delay_ms: u64,
    pub subscriber_queue_capacity: usize,
    pub log_format: LogFormat,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid CALL_RELAY_BIND_ADDR: {0}")]
    BindAddrParse(#[from] AddrParseError),
    #[error("invalid CALL_RELAY_PROVIDER_TIMEOUT_MS: {0}")]
    InvalidProviderTimeoutMs(String),
    #[error("invalid CALL_RELAY_RECORD_BY_DEFAULT: {0}")]
    InvalidRecordByDefault(String),
    #[error("invalid CALL_RELAY_RECORD_RETENTION_SECONDS: {0}")]
    InvalidRecordRetentionSeconds(String),
    #[error("invalid CALL_RELAY_RECORDING_LOOKUP_DELAY_MS: {0}")]
    InvalidRecordingLookupDelayMs(String),
    #[error("invalid CALL_RELAY_SUBSCRIBER_QUEUE_CAPACITY: {0}")]
    InvalidSubscriberQueueCapacity(String),
    #[error("invalid CALL_RELAY_PUBLIC_BASE_URL: {0}")]
    InvalidPublicBaseUrl(String),
    #[error("invalid CALL_RELAY_LOG_FORMAT: {0}")]
    InvalidLogFormat(String),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let bind_addr = non_empty("CALL_RELAY_BIND_ADDR")
            .unwrap_or_else(|| "127.0.0.1:3000".to_string())
            .parse()?;
        let service_name =
            non_empty("CALL_RELAY_SERVICE_NAME").unwrap_or_else(|| "call-relay".to_string());
        let public_base_url = non_empty("CALL_RELAY_PUBLIC_BASE_URL")
            .map(|value| parse_base_url(&value))
            .transpose()?;
        let twiml_url = non_empty("CALL_RELAY_TWIML_URL");
        let provider_timeout_ms = non_empty("CALL_RELAY_PROVIDER_TIMEOUT_MS")
            .unwrap_or_else(|| "10000".to_string())
            .parse::<u64>()
            .map_err(|error| ConfigError::InvalidProviderTimeoutMs(error.to_string()))?;
        let record_by_default = match non_empty("CALL_RELAY_RECORD_BY_DEFAULT") {
            Some(raw) => parse_bool(&raw).map_err(ConfigError::InvalidRecordByDefault)?,
            None => true,
        };
        let record_retention_seconds = non_empty("CALL_RELAY_RECORD_RETENTION_SECONDS")
            .unwrap_or_else(|| "600".to_string())
            .parse::<u64>()
            .map_err(|error| ConfigError::InvalidRecordRetentionSeconds(error.to_string()))?;
        let recording_lookup_delay_ms = non_empty("CALL_RELAY_RECORDING_LOOKUP_DELAY_MS")
            .unwrap_or_else(|| "3000".to_string())
            .parse::<u64>()
            .map_err(|error| ConfigError::InvalidRecordingLookupDelayMs(error.to_string()))?;
        let subscriber_queue_capacity = non_empty("CALL_RELAY_SUBSCRIBER_QUEUE_CAPACITY")
            .unwrap_or_else(|| "64".to_string())
            .parse::<usize>()
            .map_err(|error| ConfigError::InvalidSubscriberQueueCapacity(error.to_string()))?;
        if subscriber_queue_capacity == 0 {
            return Err(ConfigError::InvalidSubscriberQueueCapacity(
                "must be greater than zero".to_string(),
            ));
        }
        let log_format = match non_empty("CALL_RELAY_LOG_FORMAT")
            .unwrap_or_else(|| "text".to_string())
            .to_ascii_lowercase()
            .as_str()
        {
            "text" => LogFormat::Text,
            "json" => LogFormat::Json,
            other => return Err(ConfigError::InvalidLogFormat(other.to_string())),
        };

        let provider = match (
            non_empty("TWILIO_ACCOUNT_SID"),
            non_empty("TWILIO_AUTH_TOKEN"),
            non_empty("TWILIO_PHONE_NUMBER"),
        ) {
            (Some(account_sid), Some(auth_token), Some(from_number)) => Some(ProviderCredentials {
                account_sid,
                auth_token,
                from_number,
                api_base_url: non_empty("TWILIO_API_BASE_URL")
                    .unwrap_or_else(|| "https://api.twilio.com".to_string()),
            }),
            _ => None,
        };

        Ok(Self {
            service_name,
            bind_addr,
            public_base_url,
            twiml_url,
            provider,
            provider_timeout_ms,
            record_by_default,
            record_retention_seconds,
            recording_lookup_delay_ms,
            subscriber_queue_capacity,
            log_format,
        })
    }

    pub fn provider_configured(&self) -> bool {
        self.provider.is_some()
    }
}

fn parse_bool(raw: &str) -> Result<bool, String> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(format!("expected boolean, got {other}")),
    }
}

fn parse_base_url(raw: &str) -> Result<String, ConfigError> {
    let parsed = reqwest::Url::parse(raw)
        .map_err(|error| ConfigError::InvalidPublicBaseUrl(format!("{raw}: {error}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ConfigError::InvalidPublicBaseUrl(format!(
            "{raw}: scheme must be http or https"
        )));
    }
    Ok(raw.trim_end_matches('/').to_string())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars = pairs
            .iter()
            .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
            .collect::<HashMap<_, _>>();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_without_environment() {
        let config = config_from(&[]).expect("defaults should parse");
        assert_eq!(config.bind_addr.to_string(), "127.0.0.1:3000");
        assert_eq!(config.record_retention_seconds, 600);
        assert_eq!(config.recording_lookup_delay_ms, 3_000);
        assert!(config.record_by_default);
        assert!(!config.provider_configured());
        assert_eq!(config.log_format, LogFormat::Text);
    }

    #[test]
    fn provider_requires_all_three_credentials() {
        let partial = config_from(&[
            ("TWILIO_ACCOUNT_SID", "AC123"),
            ("TWILIO_AUTH_TOKEN", "secret"),
            ("TWILIO_PHONE_NUMBER", "  "),
        ])
        .expect("partial credentials still parse");
        assert!(!partial.provider_configured());

        let full = config_from(&[
            ("TWILIO_ACCOUNT_SID", "AC123"),
            ("TWILIO_AUTH_TOKEN", "secret"),
            ("TWILIO_PHONE_NUMBER", "+15559999"),
        ])
        .expect("full credentials parse");
        let provider = full.provider.expect("provider should be configured");
        assert_eq!(provider.api_base_url, "https://api.twilio.com");
    }

    #[test]
    fn invalid_values_are_reported_by_variable() {
        let err = config_from(&[("CALL_RELAY_RECORD_RETENTION_SECONDS", "ten")])
            .expect_err("non-numeric retention must fail");
        assert!(err.to_string().contains("CALL_RELAY_RECORD_RETENTION_SECONDS"));

        let err = config_from(&[("CALL_RELAY_PUBLIC_BASE_URL", "ftp://relay")])
            .expect_err("non-http base url must fail");
        assert!(matches!(err, ConfigError::InvalidPublicBaseUrl(_)));

        let err = config_from(&[("CALL_RELAY_SUBSCRIBER_QUEUE_CAPACITY", "0")])
            .expect_err("zero capacity must fail");
        assert!(matches!(err, ConfigError::InvalidSubscriberQueueCapacity(_)));
    }

    #[test]
    fn public_base_url_is_normalized() {
        let config = config_from(&[("CALL_RELAY_PUBLIC_BASE_URL", "https://relay.example.com/")])
            .expect("valid base url");
        assert_eq!(
            config.public_base_url.as_deref(),
            Some("https://relay.example.com")
        );
    }
}
