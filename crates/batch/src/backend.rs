//! The remote generation service as seen by the batch runner.
//!
//! [`GenerationBackend`] is the seam between job bookkeeping and the
//! network: production code uses [`ComfyUIBackend`], tests substitute
//! in-memory fakes.

use avagen_comfyui::api::{ComfyUIApi, ComfyUIApiError};
use avagen_core::types::JobId;

/// Submission and history lookup against an image-generation server.
pub trait GenerationBackend: Send + Sync {
    /// Queue an instantiated job graph and return its job id.
    fn submit_workflow(
        &self,
        workflow: &serde_json::Value,
    ) -> impl std::future::Future<Output = Result<JobId, ComfyUIApiError>> + Send;

    /// Fetch the raw history document for `job_id`.
    fn get_history(
        &self,
        job_id: &str,
    ) -> impl std::future::Future<Output = Result<serde_json::Value, ComfyUIApiError>> + Send;
}

/// [`GenerationBackend`] over the ComfyUI REST API.
///
/// One client id is generated per backend and sent with every
/// submission, so all jobs of a run are attributed to the same client.
#[derive(Debug, Clone)]
pub struct ComfyUIBackend {
    api: ComfyUIApi,
    client_id: String,
}

impl ComfyUIBackend {
    pub fn new(api: ComfyUIApi) -> Self {
        Self {
            api,
            client_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }
}

impl GenerationBackend for ComfyUIBackend {
    async fn submit_workflow(
        &self,
        workflow: &serde_json::Value,
    ) -> Result<JobId, ComfyUIApiError> {
        let response = self.api.submit_workflow(workflow, &self.client_id).await?;
        tracing::debug!(
            prompt_id = %response.prompt_id,
            queue_position = ?response.number,
            "Workflow accepted by ComfyUI",
        );
        Ok(response.prompt_id)
    }

    async fn get_history(&self, job_id: &str) -> Result<serde_json::Value, ComfyUIApiError> {
        self.api.get_history(job_id).await
    }
}
