//! The in-process event bus.
//!
//! Two delivery modes:
//!
//! - **broadcast**: an immutable [`Event`] is delivered to every subscriber
//!   in registration order. Return values are discarded and a panicking
//!   subscriber never interrupts delivery to the rest.
//! - **pipeline**: a [`PipelinePayload`] is folded through the registered
//!   stages in registration order; each stage takes the payload by value and
//!   returns it, possibly modified. The final payload is returned to the
//!   publisher.
//!
//! The bus is constructed explicitly and shared by reference (`Arc`); there
//! is no global instance. The subscriber list is shared across all tasks in
//! a process, so handlers must tolerate concurrent delivery when multiple
//! tasks run at once. Registration is additive and happens during setup,
//! before tasks run; registering from inside a handler deadlocks.

use crate::event::{Event, TaskId};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::RwLock;
use tracing::{debug, error};

/// A mutable payload threaded through pipeline subscribers.
///
/// Unlike broadcast events, pipeline payloads exist so that a subscriber can
/// alter loop behavior: rewriting the instruction before the LLM sees it, or
/// approving a dependency install.
#[derive(Debug, Clone)]
pub enum PipelinePayload {
    /// The task instruction, before the first round. Stages may rewrite
    /// `text` (e.g. to expand templates or redact secrets).
    Instruction { task_id: TaskId, text: String },
    /// A request to install missing packages. Stages flip `approved` to
    /// grant it; the publisher reads the final value.
    InstallRequest {
        task_id: TaskId,
        packages: Vec<String>,
        approved: bool,
    },
}

type BroadcastFn = Box<dyn Fn(&Event) + Send + Sync>;
type PipelineFn = Box<dyn Fn(PipelinePayload) -> PipelinePayload + Send + Sync>;

struct Subscriber<F> {
    label: String,
    handler: F,
}

/// In-process publish/subscribe hub connecting the task loop to observers.
#[derive(Default)]
pub struct EventBus {
    broadcast: RwLock<Vec<Subscriber<BroadcastFn>>>,
    pipeline: RwLock<Vec<Subscriber<PipelineFn>>>,
}

impl EventBus {
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a broadcast subscriber.
    ///
    /// The label identifies the subscriber in logs when it misbehaves.
    /// Registration is additive; delivery order is registration order.
    pub fn subscribe<F>(&self, label: impl Into<String>, handler: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let label = label.into();
        debug!(subscriber = %label, "Registered broadcast subscriber");
        self.broadcast
            .write()
            .expect("event bus subscriber list poisoned")
            .push(Subscriber {
                label,
                handler: Box::new(handler),
            });
    }

    /// Registers a pipeline stage.
    pub fn subscribe_pipeline<F>(&self, label: impl Into<String>, handler: F)
    where
        F: Fn(PipelinePayload) -> PipelinePayload + Send + Sync + 'static,
    {
        let label = label.into();
        debug!(subscriber = %label, "Registered pipeline stage");
        self.pipeline
            .write()
            .expect("event bus pipeline list poisoned")
            .push(Subscriber {
                label,
                handler: Box::new(handler),
            });
    }

    /// Delivers an event to every broadcast subscriber.
    ///
    /// A panic inside one subscriber is caught and logged; the remaining
    /// subscribers still receive the event and nothing propagates to the
    /// publisher.
    pub fn publish(&self, event: &Event) {
        let subscribers = self
            .broadcast
            .read()
            .expect("event bus subscriber list poisoned");
        for sub in subscribers.iter() {
            let outcome = catch_unwind(AssertUnwindSafe(|| (sub.handler)(event)));
            if outcome.is_err() {
                error!(
                    subscriber = %sub.label,
                    event = event.name(),
                    "Broadcast subscriber panicked; continuing delivery"
                );
            }
        }
    }

    /// Folds a payload through every pipeline stage and returns the result.
    ///
    /// A panicking stage is skipped: the payload it would have received is
    /// handed to the next stage unchanged. Stages therefore cannot veto by
    /// panicking - they must modify the payload.
    pub fn run_pipeline(&self, payload: PipelinePayload) -> PipelinePayload {
        let stages = self
            .pipeline
            .read()
            .expect("event bus pipeline list poisoned");
        let mut current = payload;
        for stage in stages.iter() {
            let input = current.clone();
            match catch_unwind(AssertUnwindSafe(|| (stage.handler)(input))) {
                Ok(next) => current = next,
                Err(_) => {
                    error!(
                        subscriber = %stage.label,
                        "Pipeline stage panicked; payload passed through unchanged"
                    );
                }
            }
        }
        current
    }

    /// Number of registered broadcast subscribers.
    pub fn broadcast_len(&self) -> usize {
        self.broadcast
            .read()
            .expect("event bus subscriber list poisoned")
            .len()
    }

    /// Number of registered pipeline stages.
    pub fn pipeline_len(&self) -> usize {
        self.pipeline
            .read()
            .expect("event bus pipeline list poisoned")
            .len()
    }
}
