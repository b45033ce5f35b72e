/// Noise seed passed to the sampler. ComfyUI accepts the full `u64` range.
pub type Seed = u64;

/// Opaque job identifier assigned by ComfyUI (`prompt_id`).
pub type JobId = String;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
