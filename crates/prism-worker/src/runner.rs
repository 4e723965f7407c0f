//! Claim loop: polls the job queue, runs analyses under a concurrency cap
//! and an rpm limiter, and reports outcomes back to the queue.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use prism_core::PrismConfig;
use prism_storage::{AnalysisJob, AnalysisResult, AnalysisStore, JobQueue, RequestStore};

use crate::analyzer::Analyzer;
use crate::error::{Result, WorkerError};
use crate::prompt::{self, TruncationParams};

/// Rows loaded per conversation; each row yields up to two transcript
/// messages.
const TRANSCRIPT_MESSAGE_LIMIT: usize = 50;

pub struct Worker {
    config: PrismConfig,
    jobs: JobQueue,
    store: RequestStore,
    analyses: AnalysisStore,
    analyzer: Analyzer,
    /// Concurrency cap for in-flight jobs.
    slots: Arc<Semaphore>,
    /// Outbound rpm budget, refilled once a minute.
    rpm: Arc<Semaphore>,
}

impl Worker {
    pub fn new(
        config: PrismConfig,
        jobs: JobQueue,
        store: RequestStore,
        analyses: AnalysisStore,
        analyzer: Analyzer,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(config.ai_worker_max_concurrent_jobs));
        let rpm = Arc::new(Semaphore::new(config.ai_worker_rpm as usize));
        Self {
            config,
            jobs,
            store,
            analyses,
            analyzer,
            slots,
            rpm,
        }
    }

    /// Main loop. On shutdown, stops claiming and waits out in-flight jobs
    /// up to the drain deadline; whatever is still running is abandoned to
    /// the watchdog.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let refill = tokio::spawn(refill_rpm(
            self.rpm.clone(),
            self.config.ai_worker_rpm,
            shutdown.clone(),
        ));

        let mut poll =
            tokio::time::interval(Duration::from_millis(self.config.ai_worker_poll_interval_ms));
        info!(
            poll_ms = self.config.ai_worker_poll_interval_ms,
            max_concurrent = self.config.ai_worker_max_concurrent_jobs,
            "analysis worker started"
        );

        loop {
            tokio::select! {
                _ = poll.tick() => {}
                _ = shutdown.cancelled() => break,
            }
            self.clone().claim_available().await;
        }

        info!("shutdown requested; waiting for in-flight jobs");
        let all = self.config.ai_worker_max_concurrent_jobs as u32;
        let drained = tokio::time::timeout(
            Duration::from_secs(prism_core::config::SHUTDOWN_DRAIN_SECS),
            self.slots.acquire_many(all),
        )
        .await;
        match drained {
            Ok(_) => info!("all jobs finished"),
            Err(_) => warn!("drain deadline passed; active jobs left for the watchdog"),
        }
        refill.abort();
    }

    /// Claim jobs while there are free slots and pending work.
    async fn claim_available(self: Arc<Self>) {
        loop {
            let Ok(permit) = self.slots.clone().try_acquire_owned() else {
                return;
            };
            match self.jobs.claim_next().await {
                Ok(Some(job)) => {
                    let worker = self.clone();
                    tokio::spawn(async move {
                        worker.process(job).await;
                        drop(permit);
                    });
                }
                Ok(None) => return,
                Err(e) => {
                    error!(error = %e, "job claim failed");
                    return;
                }
            }
        }
    }

    async fn process(&self, job: AnalysisJob) {
        info!(
            job_id = job.id,
            conversation_id = %job.conversation_id,
            branch_id = %job.branch_id,
            attempt = job.attempts,
            "processing analysis job"
        );

        match self.analyze_conversation(&job).await {
            Ok(()) => {
                if let Err(e) = self.jobs.complete(job.id).await {
                    error!(job_id = job.id, error = %e, "failed to mark job completed");
                }
            }
            Err(e) => {
                warn!(job_id = job.id, error = %e, "analysis attempt failed");
                match self
                    .jobs
                    .release_failed(job.id, &e.to_string(), self.config.ai_worker_max_retries)
                    .await
                {
                    Ok(outcome) => info!(job_id = job.id, ?outcome, "job released"),
                    Err(e) => error!(job_id = job.id, error = %e, "failed to release job"),
                }
            }
        }
    }

    async fn analyze_conversation(&self, job: &AnalysisJob) -> Result<()> {
        let rows = self
            .store
            .conversation_transcript(
                job.conversation_id,
                &job.branch_id,
                TRANSCRIPT_MESSAGE_LIMIT as i64,
            )
            .await?;

        let transcript = prompt::build_transcript(&rows, TRANSCRIPT_MESSAGE_LIMIT);
        if transcript.is_empty() {
            return Err(WorkerError::EmptyConversation);
        }

        let bounded = prompt::truncate(
            transcript,
            TruncationParams {
                head: self.config.ai_head_messages,
                tail: self.config.ai_tail_messages,
                budget_tokens: self.config.analysis_token_budget(),
            },
        );

        // rpm gate: permits are consumed here and restored by the refill task
        let _permit = self
            .rpm
            .acquire()
            .await
            .map_err(|_| WorkerError::Model("rpm limiter closed".into()))?;
        _permit.forget();

        let (output, usage) = self.analyzer.analyze(&bounded).await?;

        self.analyses
            .upsert(&AnalysisResult {
                conversation_id: job.conversation_id,
                branch_id: job.branch_id.clone(),
                content: output.summary.clone(),
                data: serde_json::to_value(&output)
                    .map_err(|e| WorkerError::Schema(e.to_string()))?,
                model: self.config.analysis_model.clone(),
                input_tokens: usage.input_tokens,
                output_tokens: usage.output_tokens,
            })
            .await?;
        Ok(())
    }
}

/// Restore the rpm budget once a minute, up to the configured ceiling.
async fn refill_rpm(rpm: Arc<Semaphore>, per_minute: u32, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    interval.tick().await; // first tick completes immediately
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let deficit = (per_minute as usize).saturating_sub(rpm.available_permits());
                if deficit > 0 {
                    rpm.add_permits(deficit);
                }
            }
            _ = shutdown.cancelled() => break,
        }
    }
}
