//! Test utilities: data factories, in-memory stores, and helpers for
//! wiring use cases with test dependencies.

pub mod factories;
pub mod mocks;

use std::sync::Arc;

use axum::http::HeaderValue;
use secrecy::SecretString;

use crate::{
    adapters::http::app_state::AppState,
    application::use_cases::{
        ingest::IngestUseCases, lifecycle::LifecycleUseCases, sweep::SweepUseCases,
    },
    infra::config::AppConfig,
};

use mocks::{InMemoryPersistence, RecordingHookRunner, ScriptedProcessorClient};

pub fn test_config(webhook_secret: &str) -> AppConfig {
    AppConfig {
        database_url: "postgres://localhost/subflow_test".to_string(),
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        webhook_secret: SecretString::from(webhook_secret),
        processor_api_url: "https://api.processor.test".to_string(),
        processor_api_key: SecretString::from("sk_test"),
        notifier_api_url: "https://api.notifier.test".to_string(),
        notifier_api_key: SecretString::from("nk_test"),
        cors_origin: HeaderValue::from_static("http://localhost:3000"),
        trial_days: 14,
        grace_period_days: 7,
        retry_schedule_days: vec![0, 3, 7],
        max_retry_attempts: 3,
        auto_cancel_days: 30,
        reactivation_window_days: 30,
        sweep_interval_secs: 300,
        sweep_scan_timeout_secs: 60,
        idempotency_retention_days: 30,
    }
}

/// AppState backed entirely by in-memory doubles, for route tests.
pub fn test_app_state(persistence: Arc<InMemoryPersistence>, webhook_secret: &str) -> AppState {
    let config = test_config(webhook_secret);
    let processor = Arc::new(ScriptedProcessorClient::ok());
    let lifecycle = LifecycleUseCases::new(
        persistence.clone(),
        persistence.clone(),
        persistence.clone(),
        Arc::new(RecordingHookRunner::new()),
        processor.clone(),
        config.trial_days,
        config.idempotency_retention_days,
        config.reactivation_window_days,
    );
    let ingest = IngestUseCases::new(lifecycle.clone(), SecretString::from(webhook_secret));
    let sweep = SweepUseCases::new(
        persistence.clone(),
        persistence,
        processor,
        lifecycle.clone(),
        config.grace_period_days,
        config.auto_cancel_days,
        config.retry_schedule_days.clone(),
        config.max_retry_attempts,
        config.idempotency_retention_days,
    );
    AppState {
        config: Arc::new(config),
        ingest_use_cases: Arc::new(ingest),
        lifecycle_use_cases: Arc::new(lifecycle),
        sweep_use_cases: Arc::new(sweep),
    }
}
