//! Job submission.
//!
//! [`JobSubmitter`] instantiates the job graph template for one request
//! and queues it with a single call to the backend. There is no retry:
//! a failed submission is returned to the caller, which drops the
//! request.

use std::path::PathBuf;

use avagen_comfyui::api::ComfyUIApiError;
use avagen_core::job_table::JobRequest;
use avagen_core::types::{JobId, Seed, Timestamp};
use avagen_core::workflow::JobGraphTemplate;

use crate::backend::GenerationBackend;

/// A queued unit of remote work awaiting collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedJob {
    pub job_id: JobId,
    pub destination_path: PathBuf,
    pub human_label: String,
    pub submitted_at: Timestamp,
    /// Number of polls made so far.
    pub attempts: u32,
}

/// Why a request could not be queued.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("submission of '{label}' failed: {source}")]
    Rejected {
        label: String,
        #[source]
        source: ComfyUIApiError,
    },
}

/// Binds requests into the template and queues them.
pub struct JobSubmitter<'a, B> {
    backend: &'a B,
    template: &'a JobGraphTemplate,
}

impl<'a, B: GenerationBackend> JobSubmitter<'a, B> {
    pub fn new(backend: &'a B, template: &'a JobGraphTemplate) -> Self {
        Self { backend, template }
    }

    /// Instantiate the template and queue it. Returns the job id.
    pub async fn submit(
        &self,
        prompt_text: &str,
        seed: Seed,
        label_prefix: &str,
    ) -> Result<JobId, ComfyUIApiError> {
        let workflow = self.template.instantiate(prompt_text, seed, label_prefix);
        self.backend.submit_workflow(&workflow).await
    }

    /// Queue `request` and wrap the result as a [`SubmittedJob`].
    pub async fn submit_request(&self, request: &JobRequest) -> Result<SubmittedJob, SubmitError> {
        let job_id = self
            .submit(&request.prompt_text, request.seed, &request.label_prefix)
            .await
            .map_err(|source| SubmitError::Rejected {
                label: request.human_label.clone(),
                source,
            })?;

        Ok(SubmittedJob {
            job_id,
            destination_path: request.destination_path.clone(),
            human_label: request.human_label.clone(),
            submitted_at: chrono::Utc::now(),
            attempts: 0,
        })
    }
}
