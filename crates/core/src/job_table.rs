//! Avatar prompt table and its expansion into job requests.
//!
//! An [`AvatarTable`] maps each avatar to a seed and a set of prompt
//! variants. [`build_job_requests`] flattens it into one [`JobRequest`]
//! per defined variant, in table order.
//!
//! Every variant of an avatar is rendered with the avatar's seed. Reusing
//! the seed while only the scene part of the prompt changes is what keeps
//! a character recognisable across poses. Nothing here checks that the
//! remote model actually honours this.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::CoreError;
use crate::pose::Variant;
use crate::types::Seed;

/// Default namespace used when building artifact filename prefixes.
pub const DEFAULT_LABEL_NAMESPACE: &str = "regen";

/// Maximum length of an avatar id (it becomes a path segment).
pub const MAX_AVATAR_ID_LENGTH: usize = 128;

/// Extension of every generated image.
const IMAGE_EXTENSION: &str = "png";

// ---------------------------------------------------------------------------
// Table
// ---------------------------------------------------------------------------

/// Static prompt table loaded at startup.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AvatarTable {
    /// Shared scene suffixes keyed by variant (`"base"`, `"home"`, ...).
    ///
    /// Appended to an avatar's `description` for every variant the avatar
    /// does not spell out explicitly.
    #[serde(default)]
    pub scenes: BTreeMap<String, String>,
    /// Avatars in generation order.
    #[serde(default)]
    pub avatars: Vec<AvatarRecord>,
}

/// One avatar and its prompt variants.
#[derive(Debug, Clone, Deserialize)]
pub struct AvatarRecord {
    pub id: String,
    /// Seed shared by every variant of this avatar.
    pub seed: Seed,
    /// Visual description combined with the table's `scenes` suffixes.
    #[serde(default)]
    pub description: Option<String>,
    /// Remaining keys. Recognised variant keys hold explicit prompts; any
    /// other key is ignored.
    #[serde(flatten)]
    pub prompts: BTreeMap<String, serde_json::Value>,
}

impl AvatarRecord {
    /// Resolve the prompt text for `variant`, if this avatar defines it.
    ///
    /// An explicit prompt wins over `description + scenes[variant]`.
    pub fn prompt_for(
        &self,
        variant: Variant,
        scenes: &BTreeMap<String, String>,
    ) -> Option<String> {
        if let Some(text) = self.prompts.get(variant.key()).and_then(|v| v.as_str()) {
            return Some(text.to_string());
        }
        let description = self.description.as_deref()?;
        let suffix = scenes.get(variant.key())?;
        Some(format!("{description}{suffix}"))
    }
}

impl AvatarTable {
    /// Read and validate a table from a JSON file.
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let raw = std::fs::read_to_string(path).map_err(|source| CoreError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&raw, &path.display().to_string())
    }

    /// Parse and validate a table from JSON text.
    ///
    /// `source_name` only appears in error messages.
    pub fn from_json_str(raw: &str, source_name: &str) -> Result<Self, CoreError> {
        let table: AvatarTable = serde_json::from_str(raw).map_err(|e| CoreError::Parse {
            source_name: source_name.to_string(),
            message: e.to_string(),
        })?;
        table.validate()?;
        Ok(table)
    }

    /// Check ids, prompt value types and scene keys.
    pub fn validate(&self) -> Result<(), CoreError> {
        for key in self.scenes.keys() {
            key.parse::<Variant>()
                .map_err(|e| CoreError::Validation(format!("scenes: {e}")))?;
        }

        let mut seen = HashSet::new();
        for avatar in &self.avatars {
            if !is_safe_avatar_id(&avatar.id) {
                return Err(CoreError::Validation(format!(
                    "Invalid avatar id '{}': use letters, digits, '-', '_' or '.'",
                    avatar.id
                )));
            }
            if !seen.insert(avatar.id.as_str()) {
                return Err(CoreError::Validation(format!(
                    "Duplicate avatar id '{}'",
                    avatar.id
                )));
            }
            for variant in Variant::all() {
                if let Some(value) = avatar.prompts.get(variant.key()) {
                    if !value.is_string() {
                        return Err(CoreError::Validation(format!(
                            "Avatar '{}': prompt for '{variant}' must be a string",
                            avatar.id
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Avatar ids become file and directory names, so only a conservative
/// character set is allowed and `.`/`..` are rejected.
pub fn is_safe_avatar_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_AVATAR_ID_LENGTH
        && id != "."
        && id != ".."
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}

// ---------------------------------------------------------------------------
// Job requests
// ---------------------------------------------------------------------------

/// A single image to generate. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    pub prompt_text: String,
    pub seed: Seed,
    /// Tags the filename of the artifact ComfyUI writes.
    pub label_prefix: String,
    /// Local file the artifact is copied to.
    pub destination_path: PathBuf,
    /// Short label for progress output, e.g. `cat/home`.
    pub human_label: String,
}

/// Local path for an avatar variant.
///
/// `{output_dir}/{id}.png` for the base image,
/// `{output_dir}/{id}/{pose}.png` for a pose.
pub fn destination_path(output_dir: &Path, avatar_id: &str, variant: Variant) -> PathBuf {
    match variant {
        Variant::Base => output_dir.join(format!("{avatar_id}.{IMAGE_EXTENSION}")),
        Variant::Pose(pose) => output_dir
            .join(avatar_id)
            .join(format!("{pose}.{IMAGE_EXTENSION}")),
    }
}

fn human_label(avatar_id: &str, variant: Variant) -> String {
    match variant {
        Variant::Base => format!("{avatar_id} (base)"),
        Variant::Pose(pose) => format!("{avatar_id}/{pose}"),
    }
}

/// Expand the table into job requests.
///
/// Avatars are visited in table order; within an avatar the base image
/// comes first, then poses in [`Pose::ALL`](crate::pose::Pose::ALL)
/// order. Variants an avatar does not define are skipped, so an avatar
/// with none contributes nothing.
pub fn build_job_requests(
    table: &AvatarTable,
    output_dir: &Path,
    label_namespace: &str,
) -> Vec<JobRequest> {
    let mut requests = Vec::new();

    for avatar in &table.avatars {
        for variant in Variant::all() {
            let Some(prompt_text) = avatar.prompt_for(variant, &table.scenes) else {
                continue;
            };
            requests.push(JobRequest {
                prompt_text,
                seed: avatar.seed,
                label_prefix: format!("{label_namespace}_{}_{variant}", avatar.id),
                destination_path: destination_path(output_dir, &avatar.id, variant),
                human_label: human_label(&avatar.id, variant),
            });
        }
    }

    requests
}
