use std::fs::File;
use std::sync::Arc;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::{
    adapters::{http::app_state::AppState, persistence::PostgresPersistence},
    application::{
        ports::{notifier::Notifier, payment_processor::PaymentProcessorClient},
        use_cases::{
            ingest::IngestUseCases,
            lifecycle::{AuditStore, IdempotencyStore, LifecycleUseCases, SubscriptionStore},
            sweep::SweepUseCases,
        },
    },
    infra::{
        config::AppConfig, db::init_db, hook_executor::HookExecutor, notifier::HttpNotifier,
        processor_client::HttpProcessorClient,
    },
};

pub async fn init_app_state() -> anyhow::Result<AppState> {
    let config = AppConfig::from_env();

    let pool = init_db(&config.database_url).await?;
    let postgres_arc = Arc::new(PostgresPersistence::new(pool));

    let subscription_store = postgres_arc.clone() as Arc<dyn SubscriptionStore>;
    let idempotency_store = postgres_arc.clone() as Arc<dyn IdempotencyStore>;
    let audit_store = postgres_arc.clone() as Arc<dyn AuditStore>;

    let notifier = Arc::new(HttpNotifier::new(
        config.notifier_api_url.clone(),
        config.notifier_api_key.clone(),
    )) as Arc<dyn Notifier>;
    let hooks = Arc::new(HookExecutor::new(notifier, audit_store.clone()));

    let processor = Arc::new(HttpProcessorClient::new(
        config.processor_api_url.clone(),
        config.processor_api_key.clone(),
    )) as Arc<dyn PaymentProcessorClient>;

    let lifecycle_use_cases = LifecycleUseCases::new(
        subscription_store.clone(),
        idempotency_store.clone(),
        audit_store,
        hooks,
        processor.clone(),
        config.trial_days,
        config.idempotency_retention_days,
        config.reactivation_window_days,
    );

    let ingest_use_cases =
        IngestUseCases::new(lifecycle_use_cases.clone(), config.webhook_secret.clone());

    let sweep_use_cases = SweepUseCases::new(
        subscription_store,
        idempotency_store,
        processor,
        lifecycle_use_cases.clone(),
        config.grace_period_days,
        config.auto_cancel_days,
        config.retry_schedule_days.clone(),
        config.max_retry_attempts,
        config.idempotency_retention_days,
    );

    Ok(AppState {
        config: Arc::new(config),
        ingest_use_cases: Arc::new(ingest_use_cases),
        lifecycle_use_cases: Arc::new(lifecycle_use_cases),
        sweep_use_cases: Arc::new(sweep_use_cases),
    })
}

pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "subflow=debug,tower_http=debug".into());

    // Console (pretty logs)
    let console_layer = fmt::layer().with_target(false).with_level(true).pretty();

    // File (structured JSON logs)
    let file = File::create("app.log").expect("cannot create log file");
    let json_layer = fmt::layer()
        .json()
        .with_writer(file)
        .with_current_span(true)
        .with_span_list(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(json_layer)
        .try_init()
        .ok();
}
