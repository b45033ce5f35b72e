//! ComfyUI REST client library.
//!
//! Provides the HTTP API wrapper, typed history parsing and artifact
//! retrieval (remote copy or HTTP download) for collecting images from
//! ComfyUI image-generation servers.

pub mod api;
pub mod history;
pub mod transfer;
