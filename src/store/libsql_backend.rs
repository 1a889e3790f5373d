//! libSQL backend: `TaskStore` and `ContextResolver` over a local database.
//!
//! Supports local file and in-memory databases. Conversations are stored as a
//! JSON column on the `tasks` table.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use libsql::{Connection, Database as LibSqlDatabase, params};
use secrecy::SecretString;
use tracing::{debug, info};

use crate::context::{AgentContext, ContextResolver, base_instruction, os_platform};
use crate::error::StoreError;
use crate::llm::{ProviderConfig, ProviderKind};
use crate::message::Message;
use crate::store::migrations;
use crate::store::traits::{NewTask, TaskPage, TaskRecord, TaskStore, TaskSummary, normalize_page};
use crate::tools::ToolCatalog;
use crate::tools::builtin::file::expand_home;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    user_language: String,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db).await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| StoreError::Pool(format!("Failed to create in-memory database: {e}")))?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, StoreError> {
        let conn = db
            .connect()
            .map_err(|e| StoreError::Pool(format!("Failed to create connection: {e}")))?;
        conn.execute("PRAGMA foreign_keys = ON", ())
            .await
            .map_err(|e| StoreError::Pool(format!("Failed to enable foreign keys: {e}")))?;
        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            user_language: "English".to_string(),
        })
    }

    /// Language the rendered system instruction asks the agent to answer in.
    pub fn with_user_language(mut self, language: impl Into<String>) -> Self {
        self.user_language = language.into();
        self
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Run an `INSERT ... RETURNING id` and return the new id.
    async fn insert_returning_id(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<i64, StoreError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| StoreError::Query(format!("{op}: {e}")))?;
        let row = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("{op}: {e}")))?
            .ok_or_else(|| StoreError::Query(format!("{op}: no id returned")))?;
        row.get::<i64>(0)
            .map_err(|e| StoreError::Query(format!("{op} row parse: {e}")))
    }

    // ── Seeding ─────────────────────────────────────────────────────

    pub async fn insert_provider(
        &self,
        name: &str,
        kind: ProviderKind,
        base_url: Option<&str>,
        api_key: &str,
    ) -> Result<i64, StoreError> {
        self.insert_returning_id(
            "insert_provider",
            "INSERT INTO providers (name, type, base_url, api_key) VALUES (?1, ?2, ?3, ?4) RETURNING id",
            params![name, kind.to_string(), base_url.unwrap_or(""), api_key],
        )
        .await
    }

    pub async fn insert_model(
        &self,
        provider_id: i64,
        name: &str,
        context_size: i64,
    ) -> Result<i64, StoreError> {
        self.insert_returning_id(
            "insert_model",
            "INSERT INTO llm_models (name, context_size, provider_id) VALUES (?1, ?2, ?3) RETURNING id",
            params![name, context_size, provider_id],
        )
        .await
    }

    pub async fn insert_agent(
        &self,
        name: &str,
        system_prompt: &str,
        model_id: Option<i64>,
    ) -> Result<i64, StoreError> {
        self.insert_returning_id(
            "insert_agent",
            "INSERT INTO agents (name, system_prompt, model_id) VALUES (?1, ?2, ?3) RETURNING id",
            params![name, system_prompt, opt_int(model_id)],
        )
        .await
    }

    pub async fn insert_workspace(&self, name: &str, directory: &str) -> Result<i64, StoreError> {
        self.insert_returning_id(
            "insert_workspace",
            "INSERT INTO workspaces (name, directory) VALUES (?1, ?2) RETURNING id",
            params![name, directory],
        )
        .await
    }
}

fn opt_int(v: Option<i64>) -> libsql::Value {
    match v {
        Some(n) => libsql::Value::Integer(n),
        None => libsql::Value::Null,
    }
}

fn parse_messages(raw: &str) -> Result<Vec<Message>, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::Serialization(e.to_string()))
}

#[async_trait]
impl TaskStore for LibSqlBackend {
    async fn create_task(&self, task: &NewTask) -> Result<TaskRecord, StoreError> {
        let json = serde_json::to_string(&task.messages)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let id = self
            .insert_returning_id(
                "create_task",
                "INSERT INTO tasks (title, workspace_id, agent_id, messages) VALUES (?1, ?2, ?3, ?4) RETURNING id",
                params![task.title.as_str(), task.workspace_id, task.agent_id, json],
            )
            .await?;
        debug!(task_id = id, workspace_id = task.workspace_id, agent_id = task.agent_id, "Task created");
        Ok(TaskRecord {
            id,
            title: task.title.clone(),
            workspace_id: task.workspace_id,
            agent_id: Some(task.agent_id),
            messages: task.messages.clone(),
        })
    }

    async fn fetch_task(&self, id: i64) -> Result<TaskRecord, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, title, workspace_id, agent_id, messages FROM tasks WHERE id = ?1",
                params![id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("fetch_task: {e}")))?;

        let row = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("fetch_task: {e}")))?
            .ok_or_else(|| StoreError::not_found("task", id))?;

        let parse = |e: libsql::Error| StoreError::Query(format!("fetch_task row parse: {e}"));
        let raw_messages: String = row.get(4).map_err(parse)?;
        Ok(TaskRecord {
            id: row.get(0).map_err(parse)?,
            title: row.get(1).map_err(parse)?,
            workspace_id: row.get(2).map_err(parse)?,
            agent_id: row.get::<i64>(3).ok(),
            messages: parse_messages(&raw_messages)?,
        })
    }

    async fn save_task(&self, id: i64, messages: &[Message]) -> Result<(), StoreError> {
        let json = serde_json::to_string(messages)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let now = Utc::now().to_rfc3339();

        let affected = self
            .conn()
            .execute(
                "UPDATE tasks SET messages = ?1, updated_at = ?2 WHERE id = ?3",
                params![json, now, id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("save_task: {e}")))?;

        if affected == 0 {
            return Err(StoreError::not_found("task", id));
        }
        debug!(task_id = id, messages = messages.len(), "Task saved");
        Ok(())
    }

    async fn list_tasks(
        &self,
        workspace_id: i64,
        page: u32,
        per_page: u32,
    ) -> Result<TaskPage, StoreError> {
        let (page, per_page) = normalize_page(page, per_page);
        let query_err = |e: libsql::Error| StoreError::Query(format!("list_tasks: {e}"));

        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM tasks WHERE workspace_id = ?1",
                params![workspace_id],
            )
            .await
            .map_err(query_err)?;
        let total: i64 = match rows.next().await.map_err(query_err)? {
            Some(row) => row.get(0).map_err(query_err)?,
            None => 0,
        };

        let offset = i64::from(page - 1) * i64::from(per_page);
        let mut rows = self
            .conn()
            .query(
                "SELECT id, title, workspace_id, agent_id FROM tasks
                 WHERE workspace_id = ?1 ORDER BY id DESC LIMIT ?2 OFFSET ?3",
                params![workspace_id, i64::from(per_page), offset],
            )
            .await
            .map_err(query_err)?;

        let mut items = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            items.push(TaskSummary {
                id: row.get(0).map_err(query_err)?,
                title: row.get(1).map_err(query_err)?,
                workspace_id: row.get(2).map_err(query_err)?,
                agent_id: row.get::<i64>(3).ok(),
            });
        }
        Ok(TaskPage::new(items, total.max(0) as u64, page, per_page))
    }

    async fn delete_task(&self, id: i64) -> Result<(), StoreError> {
        let affected = self
            .conn()
            .execute("DELETE FROM tasks WHERE id = ?1", params![id])
            .await
            .map_err(|e| StoreError::Query(format!("delete_task: {e}")))?;
        if affected == 0 {
            return Err(StoreError::not_found("task", id));
        }
        debug!(task_id = id, "Task deleted");
        Ok(())
    }
}

#[async_trait]
impl ContextResolver for LibSqlBackend {
    async fn resolve(&self, workspace_id: i64, agent_id: i64) -> Result<AgentContext, StoreError> {
        let conn = self.conn();
        let query_err = |e: libsql::Error| StoreError::Query(format!("resolve_context: {e}"));

        let mut rows = conn
            .query(
                "SELECT directory FROM workspaces WHERE id = ?1",
                params![workspace_id],
            )
            .await
            .map_err(query_err)?;
        let directory: String = rows
            .next()
            .await
            .map_err(query_err)?
            .ok_or_else(|| StoreError::not_found("workspace", workspace_id))?
            .get(0)
            .map_err(query_err)?;

        let mut rows = conn
            .query(
                "SELECT system_prompt, model_id FROM agents WHERE id = ?1",
                params![agent_id],
            )
            .await
            .map_err(query_err)?;
        let row = rows
            .next()
            .await
            .map_err(query_err)?
            .ok_or_else(|| StoreError::not_found("agent", agent_id))?;
        let system_prompt: String = row.get(0).map_err(query_err)?;
        let model_id = row
            .get::<i64>(1)
            .map_err(|_| StoreError::not_found("model for agent", agent_id))?;

        let mut rows = conn
            .query(
                "SELECT m.name, p.type, p.base_url, p.api_key
                 FROM llm_models m JOIN providers p ON p.id = m.provider_id
                 WHERE m.id = ?1",
                params![model_id],
            )
            .await
            .map_err(query_err)?;
        let row = rows
            .next()
            .await
            .map_err(query_err)?
            .ok_or_else(|| StoreError::not_found("model", model_id))?;
        let model: String = row.get(0).map_err(query_err)?;
        let kind: String = row.get(1).map_err(query_err)?;
        let base_url: String = row.get(2).map_err(query_err)?;
        let api_key: String = row.get(3).map_err(query_err)?;

        let kind = kind
            .parse::<ProviderKind>()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        debug!(workspace_id, agent_id, model = %model, "Agent context resolved");

        Ok(AgentContext {
            provider: ProviderConfig {
                kind,
                base_url: (!base_url.is_empty()).then_some(base_url),
                api_key: SecretString::from(api_key),
            },
            model,
            system_instruction: base_instruction(
                os_platform(),
                &self.user_language,
                &system_prompt,
            ),
            tools: Arc::new(ToolCatalog::for_workspace(expand_home(&directory))),
        })
    }
}
