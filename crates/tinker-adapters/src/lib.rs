//! # tinker-adapters
//!
//! Implementations of the boundary contracts `tinker-core` consumes:
//! - [`OpenAiClient`]: an OpenAI-compatible chat completions client with
//!   bounded exponential backoff and optional streaming
//! - [`PipInstaller`]: pip-based dependency installation with an
//!   installed-package cache

mod openai;
mod pip;

pub use openai::OpenAiClient;
pub use pip::PipInstaller;
