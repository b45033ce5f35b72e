//! Completion polling and artifact collection.
//!
//! [`CompletionPoller::poll`] checks one job's history and, when the
//! output stage has produced an image, copies it to the job's
//! destination. Every failure along the way is returned as
//! [`PollOutcome::Failed`]; the orchestrator treats it the same as
//! [`PollOutcome::NotReady`] and tries again next sweep.

use avagen_comfyui::api::ComfyUIApiError;
use avagen_comfyui::history::{job_status, HistoryStatus, ImageRef};
use avagen_comfyui::transfer::{ArtifactFetcher, FetchError};

use crate::backend::GenerationBackend;
use crate::submitter::SubmittedJob;

/// Result of checking one submitted job.
#[derive(Debug)]
pub enum PollOutcome {
    /// The job is not in the history yet.
    NotReady,
    /// The image was copied to the job's destination.
    Collected(ImageRef),
    /// The job finished without producing an image.
    ReadyWithNoArtifact { status: Option<String> },
    /// The check or the copy failed.
    Failed(PollError),
}

impl PollOutcome {
    /// True once the artifact is on local disk.
    pub fn is_collected(&self) -> bool {
        matches!(self, PollOutcome::Collected(_))
    }
}

/// Failures while checking or collecting a job.
#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error("history query failed: {0}")]
    History(#[from] ComfyUIApiError),

    #[error("unexpected history format: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("artifact retrieval failed: {0}")]
    Fetch(#[from] FetchError),
}

/// Checks submitted jobs and collects their images.
pub struct CompletionPoller<'a, B, F> {
    backend: &'a B,
    fetcher: &'a F,
    output_stage: &'a str,
}

impl<'a, B: GenerationBackend, F: ArtifactFetcher> CompletionPoller<'a, B, F> {
    /// * `output_stage` - graph stage whose `images` output is collected.
    pub fn new(backend: &'a B, fetcher: &'a F, output_stage: &'a str) -> Self {
        Self {
            backend,
            fetcher,
            output_stage,
        }
    }

    /// Check `job` once, collecting its image if it is ready.
    pub async fn poll(&self, job: &SubmittedJob) -> PollOutcome {
        match self.try_poll(job).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::debug!(
                    job_id = %job.job_id,
                    label = %job.human_label,
                    error = %e,
                    "Poll failed, will retry",
                );
                PollOutcome::Failed(e)
            }
        }
    }

    async fn try_poll(&self, job: &SubmittedJob) -> Result<PollOutcome, PollError> {
        let history = self.backend.get_history(&job.job_id).await?;

        match job_status(&history, &job.job_id, self.output_stage)? {
            HistoryStatus::NotReady => Ok(PollOutcome::NotReady),
            HistoryStatus::ReadyWithNoArtifact { status } => {
                tracing::warn!(
                    job_id = %job.job_id,
                    label = %job.human_label,
                    status = ?status,
                    "Job finished without an image on stage {}",
                    self.output_stage,
                );
                Ok(PollOutcome::ReadyWithNoArtifact { status })
            }
            HistoryStatus::Ready(image) => {
                self.fetcher.fetch(&image, &job.destination_path).await?;
                Ok(PollOutcome::Collected(image))
            }
        }
    }
}
