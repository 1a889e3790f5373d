//! In-process store, used by tests and embedders without a database.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::context::{AgentContext, ContextResolver};
use crate::error::StoreError;
use crate::message::Message;
use crate::store::traits::{NewTask, TaskPage, TaskRecord, TaskStore, TaskSummary, normalize_page};

#[derive(Default)]
struct Inner {
    tasks: HashMap<i64, TaskRecord>,
    save_counts: HashMap<i64, usize>,
    contexts: HashMap<(i64, i64), AgentContext>,
}

/// Task store and context resolver backed by in-memory maps.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_task(&self, record: TaskRecord) {
        self.lock().tasks.insert(record.id, record);
    }

    /// Register the context returned for `(workspace_id, agent_id)`.
    pub fn insert_context(&self, workspace_id: i64, agent_id: i64, context: AgentContext) {
        self.lock().contexts.insert((workspace_id, agent_id), context);
    }

    /// Currently stored conversation of a task.
    pub fn messages(&self, id: i64) -> Option<Vec<Message>> {
        self.lock().tasks.get(&id).map(|t| t.messages.clone())
    }

    /// How many times `save_task` succeeded for a task.
    pub fn save_count(&self, id: i64) -> usize {
        self.lock().save_counts.get(&id).copied().unwrap_or(0)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn create_task(&self, task: &NewTask) -> Result<TaskRecord, StoreError> {
        let mut inner = self.lock();
        let id = inner.tasks.keys().max().copied().unwrap_or(0) + 1;
        let record = TaskRecord {
            id,
            title: task.title.clone(),
            workspace_id: task.workspace_id,
            agent_id: Some(task.agent_id),
            messages: task.messages.clone(),
        };
        inner.tasks.insert(id, record.clone());
        Ok(record)
    }

    async fn fetch_task(&self, id: i64) -> Result<TaskRecord, StoreError> {
        self.lock()
            .tasks
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("task", id))
    }

    async fn save_task(&self, id: i64, messages: &[Message]) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let task = inner
            .tasks
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("task", id))?;
        task.messages = messages.to_vec();
        *inner.save_counts.entry(id).or_default() += 1;
        Ok(())
    }

    async fn list_tasks(
        &self,
        workspace_id: i64,
        page: u32,
        per_page: u32,
    ) -> Result<TaskPage, StoreError> {
        let (page, per_page) = normalize_page(page, per_page);
        let inner = self.lock();
        let mut items: Vec<TaskSummary> = inner
            .tasks
            .values()
            .filter(|t| t.workspace_id == workspace_id)
            .map(|t| TaskSummary {
                id: t.id,
                title: t.title.clone(),
                workspace_id: t.workspace_id,
                agent_id: t.agent_id,
            })
            .collect();
        items.sort_by(|a, b| b.id.cmp(&a.id));

        let total = items.len() as u64;
        let offset = (page as usize - 1).saturating_mul(per_page as usize);
        let items = items.into_iter().skip(offset).take(per_page as usize).collect();
        Ok(TaskPage::new(items, total, page, per_page))
    }

    async fn delete_task(&self, id: i64) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner
            .tasks
            .remove(&id)
            .ok_or_else(|| StoreError::not_found("task", id))?;
        inner.save_counts.remove(&id);
        Ok(())
    }
}

#[async_trait]
impl ContextResolver for MemoryStore {
    async fn resolve(&self, workspace_id: i64, agent_id: i64) -> Result<AgentContext, StoreError> {
        self.lock()
            .contexts
            .get(&(workspace_id, agent_id))
            .cloned()
            .ok_or_else(|| StoreError::not_found("agent", agent_id))
    }
}
