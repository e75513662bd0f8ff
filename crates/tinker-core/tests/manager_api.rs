//! Task manager surface: submit/status/result/cancel, queueing, and
//! namespace-seeded resumption.

use async_trait::async_trait;
use std::sync::Arc;
use tempfile::TempDir;
use tinker_core::testing::ScriptedClient;
use tinker_core::{
    ChatMessage, LlmClient, LlmError, LlmReply, TaskManager, TaskRecord, TaskStats, TaskStatus,
    TinkerConfig, Usage,
};
use tinker_proto::{EventBus, TaskId};

fn config(tmp: &TempDir) -> TinkerConfig {
    let mut config = TinkerConfig::default();
    config.store.state_dir = tmp.path().join("state");
    config
}

/// Client that answers "Done." but only after a permit is released.
struct GatedClient {
    gate: tokio::sync::Semaphore,
}

impl GatedClient {
    fn new() -> Self {
        Self {
            gate: tokio::sync::Semaphore::new(0),
        }
    }

    fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }
}

#[async_trait]
impl LlmClient for GatedClient {
    fn name(&self) -> &str {
        "gated"
    }

    async fn send(&self, _history: &[ChatMessage]) -> Result<LlmReply, LlmError> {
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| LlmError::Fatal("gate closed".into()))?;
        permit.forget();
        Ok(LlmReply {
            text: "Done.".into(),
            usage: Usage::default(),
        })
    }
}

#[tokio::test]
async fn submit_wait_and_result() {
    let tmp = TempDir::new().unwrap();
    let bus = Arc::new(EventBus::new());
    let client = Arc::new(ScriptedClient::new());
    client.push_reply("All finished, nothing to run.");

    let manager = TaskManager::new(config(&tmp), bus, client);
    let id = manager.submit("say hi");

    let record = manager.wait(&id).await.unwrap();
    assert_eq!(record.status, TaskStatus::Done);
    assert_eq!(manager.status(&id).unwrap(), TaskStatus::Done);
    assert!(manager.result(&id).unwrap().is_some());

    // The record was persisted and is listable.
    let listed = manager.list_persisted().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, id);
    assert_eq!(listed[0].status, TaskStatus::Done);
}

#[tokio::test]
async fn unknown_task_id_is_an_error() {
    let tmp = TempDir::new().unwrap();
    let bus = Arc::new(EventBus::new());
    let manager = TaskManager::new(config(&tmp), bus, Arc::new(ScriptedClient::new()));

    let ghost = TaskId::from_string("ghost");
    assert!(manager.status(&ghost).is_err());
    assert!(manager.result(&ghost).is_err());
    assert!(manager.cancel(&ghost).is_err());
}

#[tokio::test]
async fn excess_submissions_queue_and_cancel_while_queued() {
    let tmp = TempDir::new().unwrap();
    let bus = Arc::new(EventBus::new());
    let client = Arc::new(GatedClient::new());

    let mut cfg = config(&tmp);
    cfg.round_loop.max_concurrent_tasks = 1;
    let manager = TaskManager::new(cfg, bus, client.clone());

    let first = manager.submit("task one");
    let second = manager.submit("task two");

    // Give the runtime a chance to start the first worker.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(manager.status(&first).unwrap(), TaskStatus::Running);
    assert_eq!(manager.status(&second).unwrap(), TaskStatus::Pending);

    // Cancel the queued task, then let the first finish.
    manager.cancel(&second).unwrap();
    client.release(2);

    let first_record = manager.wait(&first).await.unwrap();
    assert_eq!(first_record.status, TaskStatus::Done);

    let second_record = manager.wait(&second).await.unwrap();
    assert_eq!(second_record.status, TaskStatus::Cancelled);
    assert!(second_record.rounds.is_empty());
}

#[tokio::test]
async fn resumed_task_seeds_namespace_from_store() {
    let tmp = TempDir::new().unwrap();
    let bus = Arc::new(EventBus::new());
    let client = Arc::new(ScriptedClient::new());
    client.push_reply("Continuing from where we left off.");

    let manager = TaskManager::new(config(&tmp), bus, client);

    // Persist a finished task with a namespace snapshot by hand.
    let old_id = TaskId::from_string("previous");
    let old_record = TaskRecord {
        id: old_id.clone(),
        created: chrono::Utc::now(),
        instruction: "load the data".into(),
        status: TaskStatus::Done,
        truncated: false,
        error: None,
        rounds: Vec::new(),
        namespace: serde_json::json!({ "rows": [1, 2, 3] }),
        stats: TaskStats::default(),
    };
    manager.store().save(&old_record).unwrap();

    let id = manager.submit_resumed("keep going", &old_id).unwrap();
    let record = manager.wait(&id).await.unwrap();

    assert_eq!(record.status, TaskStatus::Done);
    // The seed survived to the final snapshot even though no code ran.
    assert_eq!(record.namespace["rows"], serde_json::json!([1, 2, 3]));
}

#[tokio::test]
async fn resume_from_unknown_task_fails() {
    let tmp = TempDir::new().unwrap();
    let bus = Arc::new(EventBus::new());
    let manager = TaskManager::new(config(&tmp), bus, Arc::new(ScriptedClient::new()));
    assert!(
        manager
            .submit_resumed("keep going", &TaskId::from_string("never-existed"))
            .is_err()
    );
}
