use std::sync::Arc;

use crate::{
    application::use_cases::{
        ingest::IngestUseCases, lifecycle::LifecycleUseCases, sweep::SweepUseCases,
    },
    infra::config::AppConfig,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub ingest_use_cases: Arc<IngestUseCases>,
    pub lifecycle_use_cases: Arc<LifecycleUseCases>,
    /// Held here so main can hand it to the background sweep task.
    pub sweep_use_cases: Arc<SweepUseCases>,
}
