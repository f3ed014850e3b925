use std::net::SocketAddr;

use axum::http::HeaderValue;
use env_helpers::{get_env, get_env_default};
use secrecy::SecretString;

pub struct AppConfig {
    pub database_url: String,
    pub bind_addr: SocketAddr,
    /// HMAC secret the payment processor signs webhook deliveries with.
    pub webhook_secret: SecretString,
    pub processor_api_url: String,
    pub processor_api_key: SecretString,
    pub notifier_api_url: String,
    pub notifier_api_key: SecretString,
    pub cors_origin: HeaderValue,
    pub trial_days: i64,
    pub grace_period_days: i64,
    /// Day offsets from the first payment failure, e.g. "0,3,7".
    pub retry_schedule_days: Vec<i64>,
    pub max_retry_attempts: i32,
    /// Unpaid/Suspended rows older than this auto-expire.
    pub auto_cancel_days: i64,
    pub reactivation_window_days: i64,
    pub sweep_interval_secs: u64,
    pub sweep_scan_timeout_secs: u64,
    pub idempotency_retention_days: i64,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let database_url: String = get_env("DATABASE_URL");
        let bind_addr: SocketAddr = get_env_default("BIND_ADDR", "127.0.0.1:3001".parse().unwrap());
        let webhook_secret: SecretString =
            SecretString::new(get_env::<String>("WEBHOOK_SECRET").into());
        let processor_api_url: String =
            get_env_default("PROCESSOR_API_URL", "https://api.processor.test".to_string());
        let processor_api_key: SecretString =
            SecretString::new(get_env::<String>("PROCESSOR_API_KEY").into());
        let notifier_api_url: String =
            get_env_default("NOTIFIER_API_URL", "https://api.notifier.test".to_string());
        let notifier_api_key: SecretString =
            SecretString::new(get_env::<String>("NOTIFIER_API_KEY").into());
        let cors_origin: HeaderValue =
            get_env_default("CORS_ORIGIN", String::from("http://localhost:3000"))
                .parse()
                .expect("CORS_ORIGIN must be a valid header value");

        let trial_days: i64 = get_env_default("TRIAL_DAYS", 14);
        let grace_period_days: i64 = get_env_default("GRACE_PERIOD_DAYS", 7);
        let retry_schedule_days =
            parse_schedule(&get_env_default("RETRY_SCHEDULE_DAYS", "0,3,7".to_string()));
        let max_retry_attempts: i32 = get_env_default("MAX_RETRY_ATTEMPTS", 3);
        let auto_cancel_days: i64 = get_env_default("AUTO_CANCEL_DAYS", 30);
        let reactivation_window_days: i64 = get_env_default("REACTIVATION_WINDOW_DAYS", 30);
        let sweep_interval_secs: u64 = get_env_default("SWEEP_INTERVAL_SECS", 300);
        let sweep_scan_timeout_secs: u64 = get_env_default("SWEEP_SCAN_TIMEOUT_SECS", 60);
        let idempotency_retention_days: i64 = get_env_default("IDEMPOTENCY_RETENTION_DAYS", 30);

        Self {
            database_url,
            bind_addr,
            webhook_secret,
            processor_api_url,
            processor_api_key,
            notifier_api_url,
            notifier_api_key,
            cors_origin,
            trial_days,
            grace_period_days,
            retry_schedule_days,
            max_retry_attempts,
            auto_cancel_days,
            reactivation_window_days,
            sweep_interval_secs,
            sweep_scan_timeout_secs,
            idempotency_retention_days,
        }
    }
}

fn parse_schedule(raw: &str) -> Vec<i64> {
    let mut days: Vec<i64> = raw
        .split(',')
        .filter_map(|part| part.trim().parse::<i64>().ok())
        .collect();
    days.sort_unstable();
    days.dedup();
    if days.is_empty() {
        days = vec![0, 3, 7];
    }
    days
}
