//! Typed view of the ComfyUI `/history/{prompt_id}` response.
//!
//! The response is an object keyed by prompt id. A prompt that is still
//! queued or running is simply absent. Once finished, its entry lists
//! per-node `outputs`; image-producing nodes carry an `images` array.

use std::collections::HashMap;

use serde::Deserialize;

/// One file written by an output node.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ImageRef {
    pub filename: String,
    /// Sub-directory below the server's output directory (often empty).
    #[serde(default)]
    pub subfolder: String,
    /// Storage kind: `output`, `temp` or `input`.
    #[serde(default, rename = "type")]
    pub kind: String,
}

/// Outputs of a single node.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeOutput {
    #[serde(default)]
    pub images: Vec<ImageRef>,
}

/// Execution status block of a history entry.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecutionStatus {
    #[serde(default)]
    pub status_str: Option<String>,
}

/// A finished prompt's history entry.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryEntry {
    #[serde(default)]
    pub outputs: HashMap<String, NodeOutput>,
    #[serde(default)]
    pub status: Option<ExecutionStatus>,
}

/// What the history says about one prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryStatus {
    /// The prompt id is not in the history yet.
    NotReady,
    /// The output node produced at least one image; this is the first.
    Ready(ImageRef),
    /// The prompt finished but the output node lists no image.
    ReadyWithNoArtifact {
        /// ComfyUI's `status_str` (e.g. `"error"`), if reported.
        status: Option<String>,
    },
}

/// Interpret a history response for `prompt_id`, collecting from
/// `output_stage`.
///
/// Returns `Err` only when the entry for `prompt_id` exists but does not
/// have the expected shape.
pub fn job_status(
    history: &serde_json::Value,
    prompt_id: &str,
    output_stage: &str,
) -> Result<HistoryStatus, serde_json::Error> {
    let Some(raw_entry) = history.get(prompt_id) else {
        return Ok(HistoryStatus::NotReady);
    };
    let entry = HistoryEntry::deserialize(raw_entry)?;

    let first_image = entry
        .outputs
        .get(output_stage)
        .and_then(|out| out.images.first())
        .cloned();

    Ok(match first_image {
        Some(image) => HistoryStatus::Ready(image),
        None => HistoryStatus::ReadyWithNoArtifact {
            status: entry.status.and_then(|s| s.status_str),
        },
    })
}
