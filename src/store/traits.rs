//! Storage boundary for task conversations.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::message::Message;

/// Page size used when a caller asks for one outside the accepted range.
pub const DEFAULT_PER_PAGE: u32 = 10;
const PER_PAGE_RANGE: std::ops::RangeInclusive<u32> = 5..=100;

/// A persisted task and its conversation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskRecord {
    pub id: i64,
    pub title: String,
    pub workspace_id: i64,
    /// Unset when the task's agent was deleted.
    pub agent_id: Option<i64>,
    pub messages: Vec<Message>,
}

/// Fields of a task to create.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NewTask {
    pub title: String,
    pub workspace_id: i64,
    pub agent_id: i64,
    #[serde(default)]
    pub messages: Vec<Message>,
}

/// A task as listed, without its conversation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskSummary {
    pub id: i64,
    pub title: String,
    pub workspace_id: i64,
    pub agent_id: Option<i64>,
}

/// One page of a workspace's tasks, newest first.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskPage {
    pub items: Vec<TaskSummary>,
    pub total: u64,
    pub page: u32,
    pub per_page: u32,
    pub total_pages: u64,
}

impl TaskPage {
    pub fn new(items: Vec<TaskSummary>, total: u64, page: u32, per_page: u32) -> Self {
        Self {
            items,
            total,
            page,
            per_page,
            total_pages: total.div_ceil(u64::from(per_page.max(1))),
        }
    }
}

/// Clamp a requested page to 1 or more and a page size to 5..=100,
/// falling back to [`DEFAULT_PER_PAGE`].
pub fn normalize_page(page: u32, per_page: u32) -> (u32, u32) {
    let per_page = if PER_PAGE_RANGE.contains(&per_page) {
        per_page
    } else {
        DEFAULT_PER_PAGE
    };
    (page.max(1), per_page)
}

/// Backend-agnostic task persistence.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a task and return it with its assigned id.
    async fn create_task(&self, task: &NewTask) -> Result<TaskRecord, StoreError>;

    /// Load a task. Fails with `StoreError::NotFound` for an unknown id.
    async fn fetch_task(&self, id: i64) -> Result<TaskRecord, StoreError>;

    /// Replace a task's conversation. Fails with `StoreError::NotFound` for an unknown id.
    async fn save_task(&self, id: i64, messages: &[Message]) -> Result<(), StoreError>;

    /// List a workspace's tasks by descending id. Arguments go through [`normalize_page`].
    async fn list_tasks(
        &self,
        workspace_id: i64,
        page: u32,
        per_page: u32,
    ) -> Result<TaskPage, StoreError>;

    /// Delete a task. Fails with `StoreError::NotFound` for an unknown id.
    async fn delete_task(&self, id: i64) -> Result<(), StoreError>;
}
