//! Task manager: creates task controllers, tracks the active ones, and
//! exposes the submit/status/result/cancel surface.
//!
//! Submissions are non-blocking: each task runs on the tokio runtime,
//! gated by a semaphore sized to the configured concurrency limit, so
//! excess submissions queue in FIFO order. Cancellation is cooperative -
//! the flag is observed at the task's next round boundary.

use crate::config::TinkerConfig;
use crate::install::{DependencyInstaller, NoInstaller};
use crate::llm::LlmClient;
use crate::sandbox::{Namespace, Sandbox};
use crate::store::{StoreError, TaskStore, TaskSummary};
use crate::task::{CancelFlag, TaskController, TaskRecord, TaskStatus};
use crate::tools::{NoExternalTools, ToolInvoker};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tinker_proto::{Event, EventBus, PipelinePayload, TaskId};
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("unknown task id `{0}`")]
    UnknownTask(String),
    #[error("task `{0}` worker panicked")]
    Worker(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

struct TaskSlot {
    status: TaskStatus,
    record: Option<TaskRecord>,
}

struct TaskEntry {
    cancel: CancelFlag,
    slot: Mutex<TaskSlot>,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// Owns the event bus and the running tasks of one process.
pub struct TaskManager {
    config: TinkerConfig,
    bus: Arc<EventBus>,
    client: Arc<dyn LlmClient>,
    invoker: Arc<dyn ToolInvoker>,
    installer: Arc<dyn DependencyInstaller>,
    store: TaskStore,
    semaphore: Arc<tokio::sync::Semaphore>,
    tasks: Mutex<HashMap<TaskId, Arc<TaskEntry>>>,
}

impl TaskManager {
    pub fn new(config: TinkerConfig, bus: Arc<EventBus>, client: Arc<dyn LlmClient>) -> Self {
        let store = TaskStore::new(&config.store.state_dir);
        let semaphore = Arc::new(tokio::sync::Semaphore::new(
            config.round_loop.max_concurrent_tasks.max(1),
        ));

        if config.sandbox.auto_approve_installs {
            bus.subscribe_pipeline("auto-approve-installs", |payload| match payload {
                PipelinePayload::InstallRequest {
                    task_id, packages, ..
                } => PipelinePayload::InstallRequest {
                    task_id,
                    packages,
                    approved: true,
                },
                other => other,
            });
        }

        Self {
            config,
            bus,
            client,
            invoker: Arc::new(NoExternalTools),
            installer: Arc::new(NoInstaller),
            store,
            semaphore,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_invoker(mut self, invoker: Arc<dyn ToolInvoker>) -> Self {
        self.invoker = invoker;
        self
    }

    pub fn with_installer(mut self, installer: Arc<dyn DependencyInstaller>) -> Self {
        self.installer = installer;
        self
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    /// Submits a new task. Returns immediately with the task id; the task
    /// starts as soon as a worker slot is free.
    pub fn submit(&self, instruction: impl Into<String>) -> TaskId {
        self.spawn_task(instruction.into(), Namespace::new())
    }

    /// Submits a new task whose namespace is seeded from a stored task's
    /// snapshot. This is the explicit resumption path; the source task
    /// itself stays finished.
    pub fn submit_resumed(
        &self,
        instruction: impl Into<String>,
        source: &TaskId,
    ) -> Result<TaskId, ManagerError> {
        let record = self.store.load(source)?;
        let seed = Namespace::from_snapshot(record.namespace);
        debug!(source = %source, bindings = seed.len(), "Seeding task from stored namespace");
        Ok(self.spawn_task(instruction.into(), seed))
    }

    fn spawn_task(&self, instruction: String, seed: Namespace) -> TaskId {
        let id = TaskId::generate();
        let entry = Arc::new(TaskEntry {
            cancel: CancelFlag::new(),
            slot: Mutex::new(TaskSlot {
                status: TaskStatus::Pending,
                record: None,
            }),
            handle: Mutex::new(None),
        });
        self.tasks
            .lock()
            .expect("task registry poisoned")
            .insert(id.clone(), entry.clone());

        let workdir = self
            .config
            .sandbox
            .workdir
            .clone()
            .unwrap_or_else(|| self.config.store.state_dir.join("work"))
            .join(id.as_str());
        let sandbox = Sandbox::with_default_runtimes(workdir, &self.config.sandbox);

        let bus = self.bus.clone();
        let client = self.client.clone();
        let invoker = self.invoker.clone();
        let installer = self.installer.clone();
        let store = self.store.clone();
        let semaphore = self.semaphore.clone();
        let loop_config = self.config.round_loop.clone();
        let stream = self.config.llm.stream;
        let task_id = id.clone();
        let task_entry = entry.clone();

        let handle = tokio::spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                task_entry.slot.lock().expect("task slot poisoned").status = TaskStatus::Error;
                return;
            };

            // A task cancelled while queued still runs the controller: the
            // flag is observed before round 1, so the record comes back
            // Cancelled with an empty round history.
            task_entry.slot.lock().expect("task slot poisoned").status = TaskStatus::Running;

            let controller = TaskController::new(task_id, instruction, bus.clone(), client, sandbox)
                .with_invoker(invoker)
                .with_installer(installer)
                .with_limits(loop_config.max_rounds, loop_config.max_round_retries)
                .with_streaming(stream)
                .with_seed_namespace(seed)
                .with_cancel_flag(task_entry.cancel.clone());

            let record = controller.run().await;
            finish(&task_entry, &store, &bus, record);
        });
        *entry.handle.lock().expect("task handle poisoned") = Some(handle);

        id
    }

    fn entry(&self, id: &TaskId) -> Result<Arc<TaskEntry>, ManagerError> {
        self.tasks
            .lock()
            .expect("task registry poisoned")
            .get(id)
            .cloned()
            .ok_or_else(|| ManagerError::UnknownTask(id.to_string()))
    }

    /// Current status of a task.
    pub fn status(&self, id: &TaskId) -> Result<TaskStatus, ManagerError> {
        let entry = self.entry(id)?;
        let slot = entry.slot.lock().expect("task slot poisoned");
        Ok(slot.status)
    }

    /// Full structured result once the task is terminal; `None` while it
    /// is still pending or running.
    pub fn result(&self, id: &TaskId) -> Result<Option<TaskRecord>, ManagerError> {
        let entry = self.entry(id)?;
        let slot = entry.slot.lock().expect("task slot poisoned");
        Ok(slot.record.clone())
    }

    /// Requests cooperative cancellation. The task observes the flag at
    /// its next round boundary; an in-flight execution runs to completion.
    pub fn cancel(&self, id: &TaskId) -> Result<(), ManagerError> {
        let entry = self.entry(id)?;
        entry.cancel.request();
        debug!(task = %id, "Cancellation requested");
        Ok(())
    }

    /// Blocks until the task is terminal and returns its record.
    pub async fn wait(&self, id: &TaskId) -> Result<TaskRecord, ManagerError> {
        let entry = self.entry(id)?;
        let handle = entry.handle.lock().expect("task handle poisoned").take();
        if let Some(handle) = handle {
            if handle.await.is_err() {
                return Err(ManagerError::Worker(id.to_string()));
            }
        }
        let slot = entry.slot.lock().expect("task slot poisoned");
        slot.record
            .clone()
            .ok_or_else(|| ManagerError::Worker(id.to_string()))
    }

    /// Lists persisted tasks from the store.
    pub fn list_persisted(&self) -> Result<Vec<TaskSummary>, ManagerError> {
        Ok(self.store.list()?)
    }
}

fn finish(entry: &TaskEntry, store: &TaskStore, bus: &EventBus, record: TaskRecord) {
    {
        let mut slot = entry.slot.lock().expect("task slot poisoned");
        slot.status = record.status;
        slot.record = Some(record.clone());
    }
    if let Err(e) = store.save(&record) {
        warn!(task = %record.id, error = %e, "Failed to persist task record");
        bus.publish(&Event::Exception {
            task_id: record.id.clone(),
            context: "store".to_string(),
            message: e.to_string(),
        });
    }
}
