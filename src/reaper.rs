use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::observability::{SWEEP_DURATION_SECONDS, SWEEP_FAILURES_TOTAL};

const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub visited: usize,
    pub expired: usize,
    pub promoted: usize,
    pub failed: usize,
}

/// One pass over the tenant: expire lapsed offers and promote into the
/// slots they free. A failing resource is logged and skipped.
pub async fn sweep(engine: &Engine) -> SweepReport {
    let start = Instant::now();
    let mut report = SweepReport::default();

    for resource_id in engine.resources_needing_sweep(engine.now()) {
        report.visited += 1;
        match engine.expire_notifications(resource_id).await {
            Ok(outcome) => {
                report.expired += outcome.expired.len();
                report.promoted += outcome.promoted.len();
            }
            Err(e) if e.is_retryable() => {
                report.failed += 1;
                metrics::counter!(SWEEP_FAILURES_TOTAL, "reason" => "conflict").increment(1);
                debug!("sweep skip {resource_id}: {e}");
            }
            Err(e) => {
                report.failed += 1;
                metrics::counter!(SWEEP_FAILURES_TOTAL, "reason" => "error").increment(1);
                warn!("sweep failed for {resource_id}: {e}");
            }
        }
    }

    metrics::histogram!(SWEEP_DURATION_SECONDS).record(start.elapsed().as_secs_f64());
    if report.expired > 0 || report.promoted > 0 {
        info!(
            "sweep: {} expired, {} promoted across {} resources",
            report.expired, report.promoted, report.visited
        );
    }
    report
}

/// Background promotion scheduler for one tenant.
pub async fn run_reaper(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        sweep(&engine).await;
    }
}

/// Background compactor: rewrites the WAL once enough appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    if threshold == 0 {
        return;
    }
    let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => warn!("WAL compaction failed: {e}"),
        }
    }
}
