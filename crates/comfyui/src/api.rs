//! Thin [`reqwest`] client for the three ComfyUI endpoints the batch
//! runner needs: `/prompt`, `/history/{id}` and `/view`.

use std::time::Duration;

use serde::Deserialize;

use crate::history::ImageRef;

/// Upper bound on a single request, from connect to the last body byte.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Client bound to one ComfyUI base URL.
#[derive(Debug, Clone)]
pub struct ComfyUIApi {
    client: reqwest::Client,
    api_url: String,
}

/// Accepted `/prompt` submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitResponse {
    /// Job id used for later history lookups.
    pub prompt_id: String,
    /// Position in the execution queue, when reported.
    pub number: Option<i64>,
}

/// Raw `/prompt` body. Both fields are optional on the wire so that a
/// body without an identifier surfaces as [`ComfyUIApiError::MissingPromptId`]
/// rather than a decode error.
#[derive(Debug, Deserialize)]
struct RawSubmitResponse {
    #[serde(default)]
    prompt_id: Option<String>,
    #[serde(default)]
    number: Option<i64>,
}

/// Failures talking to ComfyUI.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIApiError {
    /// Transport failure, timeout or undecodable body.
    #[error("request to ComfyUI failed: {0}")]
    Request(#[from] reqwest::Error),

    /// Non-2xx answer.
    #[error("ComfyUI answered {status}: {body}")]
    ApiError {
        status: u16,
        body: String,
    },

    /// `/prompt` answered 2xx but without a usable `prompt_id`.
    #[error("ComfyUI response did not contain a prompt_id")]
    MissingPromptId,
}

impl ComfyUIApi {
    /// Client with a fresh connection pool and [`DEFAULT_REQUEST_TIMEOUT`].
    ///
    /// * `api_url` - Base HTTP URL, e.g. `http://host:8188`. A trailing
    ///   slash is dropped.
    pub fn new(api_url: String) -> Result<Self, ComfyUIApiError> {
        Self::with_timeout(api_url, DEFAULT_REQUEST_TIMEOUT)
    }

    /// Client whose requests fail with [`ComfyUIApiError::Request`] once
    /// `timeout` has elapsed.
    pub fn with_timeout(api_url: String, timeout: Duration) -> Result<Self, ComfyUIApiError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, api_url))
    }

    /// Client sharing an existing [`reqwest::Client`].
    pub fn with_client(client: reqwest::Client, api_url: String) -> Self {
        let api_url = api_url.trim_end_matches('/').to_string();
        Self { client, api_url }
    }

    /// HTTP API base URL.
    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Queue `workflow` with `POST /prompt`, tagged with `client_id`.
    pub async fn submit_workflow(
        &self,
        workflow: &serde_json::Value,
        client_id: &str,
    ) -> Result<SubmitResponse, ComfyUIApiError> {
        let body = serde_json::json!({
            "prompt": workflow,
            "client_id": client_id,
        });

        let response = self
            .client
            .post(format!("{}/prompt", self.api_url))
            .json(&body)
            .send()
            .await?;

        let raw: RawSubmitResponse = Self::parse_response(response).await?;
        raw.try_into()
    }

    /// `GET /history/{prompt_id}`. The document is keyed by prompt id
    /// and stays empty until the prompt has finished.
    pub async fn get_history(&self, prompt_id: &str) -> Result<serde_json::Value, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/history/{}", self.api_url, prompt_id))
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Request an output file via `GET /view`.
    ///
    /// Returns the successful response so the caller can stream the body.
    pub async fn view(&self, image: &ImageRef) -> Result<reqwest::Response, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/view", self.api_url))
            .query(&[
                ("filename", image.filename.as_str()),
                ("subfolder", image.subfolder.as_str()),
                ("type", image.kind.as_str()),
            ])
            .send()
            .await?;

        Self::ensure_success(response).await
    }

    /// Turn a non-2xx response into [`ComfyUIApiError::ApiError`].
    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, ComfyUIApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ComfyUIApiError::ApiError {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// Decode a 2xx JSON body.
    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ComfyUIApiError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }
}

impl TryFrom<RawSubmitResponse> for SubmitResponse {
    type Error = ComfyUIApiError;

    fn try_from(raw: RawSubmitResponse) -> Result<Self, Self::Error> {
        match raw.prompt_id {
            Some(prompt_id) if !prompt_id.is_empty() => Ok(SubmitResponse {
                prompt_id,
                number: raw.number,
            }),
            _ => Err(ComfyUIApiError::MissingPromptId),
        }
    }
}
