//! Test doubles shared by unit and integration tests.
//!
//! `ScriptedClient` plays back canned LLM replies; `CollectingSubscriber`
//! records every event the bus delivers. Both are exported so downstream
//! crates can drive the loop without a network.

use crate::llm::{ChatMessage, LlmClient, LlmError, LlmReply, Usage};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tinker_proto::{Event, EventBus};

enum Scripted {
    Reply(String),
    Error(LlmError),
}

/// LLM double that returns queued replies in order.
///
/// When the queue runs dry it returns a fatal error, which makes a test
/// that queries one time too many fail loudly instead of hanging.
#[derive(Default)]
pub struct ScriptedClient {
    script: Mutex<VecDeque<Scripted>>,
}

impl ScriptedClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a reply with a small synthetic usage sample.
    pub fn push_reply(&self, text: impl Into<String>) {
        self.script
            .lock()
            .unwrap()
            .push_back(Scripted::Reply(text.into()));
    }

    /// Queues an error to be surfaced instead of a reply.
    pub fn push_error(&self, error: LlmError) {
        self.script.lock().unwrap().push_back(Scripted::Error(error));
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().unwrap().len()
    }
}

#[async_trait]
impl LlmClient for ScriptedClient {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn send(&self, _history: &[ChatMessage]) -> Result<LlmReply, LlmError> {
        match self.script.lock().unwrap().pop_front() {
            Some(Scripted::Reply(text)) => Ok(LlmReply {
                usage: Usage {
                    input_tokens: 10,
                    output_tokens: text.len() as u64 / 4,
                },
                text,
            }),
            Some(Scripted::Error(error)) => Err(error),
            None => Err(LlmError::Fatal("scripted client exhausted".into())),
        }
    }
}

/// Broadcast subscriber that records every delivered event.
#[derive(Clone, Default)]
pub struct CollectingSubscriber {
    events: Arc<Mutex<Vec<Event>>>,
}

impl CollectingSubscriber {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers on the bus under the label `collector`.
    pub fn attach(&self, bus: &EventBus) {
        let events = self.events.clone();
        bus.subscribe("collector", move |event| {
            events.lock().unwrap().push(event.clone());
        });
    }

    /// All recorded events, in delivery order.
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    /// Names of recorded events, in delivery order.
    pub fn names(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().iter().map(Event::name).collect()
    }
}
