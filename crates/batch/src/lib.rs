//! `avagen-batch` library crate.
//!
//! Submits one ComfyUI job per avatar variant, polls until every job's
//! image has been collected, and reports a tally. The binary entrypoint
//! lives in `main.rs`; modules are public for integration testing.

pub mod backend;
pub mod config;
pub mod orchestrator;
pub mod poller;
pub mod submitter;
