use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::{interval, timeout};
use tracing::{error, info, warn};

use crate::application::use_cases::sweep::{SweepReport, SweepUseCases};

/// Background sweep task. Every tick runs the five scans plus the
/// idempotency purge, each one time-boxed so a stuck scan cannot starve
/// the rest or the next tick.
pub async fn run_sweep_loop(sweep_uc: Arc<SweepUseCases>, interval_secs: u64, scan_timeout_secs: u64) {
    let mut ticker = interval(Duration::from_secs(interval_secs));
    let scan_timeout = Duration::from_secs(scan_timeout_secs);

    info!(
        "Sweep worker started (every {}s, {}s per scan)",
        interval_secs, scan_timeout_secs
    );

    loop {
        ticker.tick().await;
        let report = run_tick(&sweep_uc, scan_timeout).await;
        if report != SweepReport::default() {
            info!(
                trial_notices = report.trial_notices,
                trials_ended = report.trials_ended,
                grace_endings = report.grace_endings,
                cancellations = report.cancellations,
                expirations = report.expirations,
                retry_attempts = report.retry_attempts,
                retries_exhausted = report.retries_exhausted,
                purged = report.purged_idempotency,
                "Sweep tick finished"
            );
        }
    }
}

async fn run_tick(sweep_uc: &SweepUseCases, scan_timeout: Duration) -> SweepReport {
    let now = Utc::now().naive_utc();
    let mut report = SweepReport::default();

    run_scan(
        "trials",
        scan_timeout,
        sweep_uc.scan_trials(now, &mut report),
    )
    .await;
    run_scan(
        "grace",
        scan_timeout,
        sweep_uc.scan_grace_endings(now, &mut report),
    )
    .await;
    run_scan(
        "cancellations",
        scan_timeout,
        sweep_uc.scan_cancellations(now, &mut report),
    )
    .await;
    run_scan(
        "expirations",
        scan_timeout,
        sweep_uc.scan_expirations(now, &mut report),
    )
    .await;
    run_scan(
        "retries",
        scan_timeout,
        sweep_uc.scan_payment_retries(now, &mut report),
    )
    .await;

    match timeout(scan_timeout, sweep_uc.purge_idempotency(now)).await {
        Ok(Ok(purged)) => report.purged_idempotency = purged,
        Ok(Err(e)) => error!(error = %e, "Idempotency purge failed"),
        Err(_) => warn!("Idempotency purge timed out"),
    }

    report
}

async fn run_scan(
    name: &str,
    scan_timeout: Duration,
    scan: impl Future<Output = crate::app_error::AppResult<()>>,
) {
    match timeout(scan_timeout, scan).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(scan = name, error = %e, "Sweep scan failed"),
        Err(_) => warn!(
            scan = name,
            timeout_secs = scan_timeout.as_secs(),
            "Sweep scan timed out"
        ),
    }
}
