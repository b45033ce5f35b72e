//! Batch orchestration: submit everything, then poll until done.
//!
//! The run is strictly sequential. All requests are submitted in table
//! order before the first poll. Each sweep then sleeps for the poll
//! interval and checks every outstanding job once, in submission order.
//! The run ends when nothing is outstanding.
//!
//! Without `max_poll_attempts` a job that never produces an image is
//! polled forever; only interrupting the process ends such a run.

use std::time::Duration;

use avagen_comfyui::transfer::ArtifactFetcher;
use avagen_core::job_table::JobRequest;
use avagen_core::workflow::JobGraphTemplate;

use crate::backend::GenerationBackend;
use crate::poller::{CompletionPoller, PollOutcome};
use crate::submitter::{JobSubmitter, SubmittedJob};

/// Counts reported at the end of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    /// Requests built from the table.
    pub total_requests: usize,
    /// Requests accepted by the server.
    pub queued: usize,
    /// Labels of requests the server did not accept.
    pub failed_to_queue: Vec<String>,
    /// Images collected to local disk.
    pub completed: usize,
    /// Labels of jobs given up after `max_poll_attempts`.
    pub abandoned: Vec<String>,
}

/// Drives submission and polling for one batch.
pub struct Orchestrator<'a, B, F> {
    backend: &'a B,
    fetcher: &'a F,
    template: &'a JobGraphTemplate,
    poll_interval: Duration,
    max_poll_attempts: Option<u32>,
}

impl<'a, B: GenerationBackend, F: ArtifactFetcher> Orchestrator<'a, B, F> {
    pub fn new(backend: &'a B, fetcher: &'a F, template: &'a JobGraphTemplate) -> Self {
        Self {
            backend,
            fetcher,
            template,
            poll_interval: Duration::from_secs(10),
            max_poll_attempts: None,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Give up on a job after `attempts` polls without collecting it.
    pub fn with_max_poll_attempts(mut self, attempts: Option<u32>) -> Self {
        self.max_poll_attempts = attempts;
        self
    }

    /// Submit all `requests`, then poll until every queued job is
    /// collected (or abandoned).
    pub async fn run(&self, requests: &[JobRequest]) -> BatchSummary {
        let mut summary = BatchSummary {
            total_requests: requests.len(),
            ..Default::default()
        };

        let outstanding = self.submit_all(requests, &mut summary).await;
        summary.queued = outstanding.len();

        self.poll_until_empty(outstanding, &mut summary).await;

        tracing::info!(
            completed = summary.completed,
            queued = summary.queued,
            failed_to_queue = summary.failed_to_queue.len(),
            abandoned = summary.abandoned.len(),
            "=== COMPLETE: {}/{} images generated ===",
            summary.completed,
            summary.queued,
        );
        summary
    }

    async fn submit_all(
        &self,
        requests: &[JobRequest],
        summary: &mut BatchSummary,
    ) -> Vec<SubmittedJob> {
        let submitter = JobSubmitter::new(self.backend, self.template);
        let total = requests.len();
        let mut outstanding = Vec::with_capacity(total);

        tracing::info!(total, "=== Submitting {total} image generation jobs ===");

        for (i, request) in requests.iter().enumerate() {
            match submitter.submit_request(request).await {
                Ok(job) => {
                    tracing::info!(
                        job_id = %job.job_id,
                        seed = request.seed,
                        "[{}/{total}] Queued: {}",
                        i + 1,
                        request.human_label,
                    );
                    outstanding.push(job);
                }
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        "[{}/{total}] FAILED to queue: {}",
                        i + 1,
                        request.human_label,
                    );
                    summary.failed_to_queue.push(request.human_label.clone());
                }
            }
        }

        tracing::info!(
            queued = outstanding.len(),
            "=== {} jobs queued. Polling for completion... ===",
            outstanding.len(),
        );
        outstanding
    }

    async fn poll_until_empty(
        &self,
        mut outstanding: Vec<SubmittedJob>,
        summary: &mut BatchSummary,
    ) {
        let poller =
            CompletionPoller::new(self.backend, self.fetcher, self.template.output_stage());
        let queued = outstanding.len();

        while !outstanding.is_empty() {
            tokio::time::sleep(self.poll_interval).await;

            let mut still_waiting = Vec::with_capacity(outstanding.len());
            for mut job in outstanding {
                job.attempts += 1;
                let outcome = poller.poll(&job).await;

                if let PollOutcome::Collected(image) = &outcome {
                    summary.completed += 1;
                    let elapsed = chrono::Utc::now() - job.submitted_at;
                    tracing::info!(
                        job_id = %job.job_id,
                        filename = %image.filename,
                        destination = %job.destination_path.display(),
                        elapsed_secs = elapsed.num_seconds(),
                        "OK [{}/{queued}]: {}",
                        summary.completed,
                        job.human_label,
                    );
                    continue;
                }

                if self.max_poll_attempts.is_some_and(|max| job.attempts >= max) {
                    tracing::warn!(
                        job_id = %job.job_id,
                        attempts = job.attempts,
                        last_outcome = ?outcome,
                        "Giving up on {}",
                        job.human_label,
                    );
                    summary.abandoned.push(job.human_label);
                    continue;
                }

                still_waiting.push(job);
            }
            outstanding = still_waiting;

            if !outstanding.is_empty() {
                tracing::info!(
                    remaining = outstanding.len(),
                    "... {} remaining",
                    outstanding.len()
                );
            }
        }
    }
}
