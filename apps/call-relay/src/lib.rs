#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tracing::info;

use crate::{
    config::Config,
    engine::{CallEngine, EngineSettings},
    fanout::SubscriberHub,
    server::{AppState, build_router},
};

pub mod call_store;
pub mod config;
pub mod deferred;
pub mod engine;
pub mod fanout;
pub mod provider;
pub mod recording_index;
pub mod server;
pub mod types;

#[cfg(test)]
pub mod test_support;

pub fn build_state(config: Config) -> AppState {
    let fanout = Arc::new(SubscriberHub::new(config.subscriber_queue_capacity));
    let provider = provider::from_config(&config);
    if let Some(gateway) = provider.as_ref() {
        info!(backend = gateway.backend(), "telephony provider configured");
    }
    let engine = Arc::new(CallEngine::new(
        Arc::clone(&fanout),
        provider,
        EngineSettings::from_config(&config),
    ));
    AppState::new(config, engine, fanout)
}

pub fn build_app(config: Config) -> axum::Router {
    build_router(build_state(config))
}

pub async fn serve(config: Config) -> Result<()> {
    let listener = TcpListener::bind(config.bind_addr).await?;
    info!(
        service = %config.service_name,
        bind_addr = %config.bind_addr,
        provider_configured = config.provider_configured(),
        record_by_default = config.record_by_default,
        log_format = config.log_format.as_str(),
        "call relay listening"
    );
    axum::serve(listener, build_app(config)).await?;
    Ok(())
}
