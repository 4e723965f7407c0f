//! Stuck-job recovery. A worker that dies mid-job leaves its row in
//! `processing`; the watchdog returns such rows to `pending` so another
//! worker can pick them up. Attempt counters are not touched: the claim
//! already charged the attempt.

use chrono::Duration as ChronoDuration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use prism_storage::JobQueue;

const WATCHDOG_INTERVAL_SECS: u64 = 60;

pub async fn run(jobs: JobQueue, job_timeout_minutes: u64, shutdown: CancellationToken) {
    let stuck_after = ChronoDuration::minutes(job_timeout_minutes as i64);
    let mut interval =
        tokio::time::interval(std::time::Duration::from_secs(WATCHDOG_INTERVAL_SECS));

    info!(timeout_minutes = job_timeout_minutes, "watchdog started");
    loop {
        tokio::select! {
            _ = interval.tick() => {
                match jobs.watchdog_reset(stuck_after).await {
                    Ok(0) => {}
                    Ok(count) => info!(count, "watchdog reset stuck jobs"),
                    Err(e) => error!(error = %e, "watchdog sweep failed"),
                }
            }
            _ = shutdown.cancelled() => {
                info!("watchdog stopped");
                break;
            }
        }
    }
}
