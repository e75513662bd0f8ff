//! # tinker-proto
//!
//! Shared contract types for the Tinker task loop:
//! - The closed event vocabulary published by the core ([`Event`])
//! - The in-process event bus connecting the loop to observers ([`EventBus`])
//! - Pipeline payloads that subscribers may rewrite ([`PipelinePayload`])
//!
//! This crate deliberately has no knowledge of LLM backends, sandboxes, or
//! persistence - it is the narrow waist every other crate depends on.

mod bus;
mod event;

pub use bus::{EventBus, PipelinePayload};
pub use event::{Event, TaskId};
