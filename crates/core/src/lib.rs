//! Domain types for batch avatar generation.
//!
//! Pure data assembly with no network I/O: the avatar prompt table and
//! its expansion into job requests, and the ComfyUI job graph template.

pub mod error;
pub mod job_table;
pub mod pose;
pub mod types;
pub mod workflow;
