//! Task registry: at most one live runtime per task id.
//!
//! Runtimes are hydrated lazily from the store on first access. Each id has
//! its own slot lock so concurrent `add` calls for one id share a single
//! hydration while unrelated ids hydrate in parallel. The map lock is always
//! taken before a slot lock and is never held while a conversation is locked.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

use crate::config::RuntimeConfig;
use crate::context::ContextResolver;
use crate::error::{StoreError, TaskError};
use crate::llm::LlmClientFactory;
use crate::runtime::{AgentTaskRuntime, RuntimeDeps};
use crate::scheduler::Scheduler;
use crate::store::TaskStore;

type Slot = Arc<Mutex<Option<Arc<AgentTaskRuntime>>>>;

/// Services the registry hydrates runtimes with.
#[derive(Clone)]
pub struct RegistryDeps {
    pub scheduler: Arc<Scheduler>,
    pub store: Arc<dyn TaskStore>,
    pub resolver: Arc<dyn ContextResolver>,
    pub llm_factory: Arc<dyn LlmClientFactory>,
    pub config: RuntimeConfig,
}

pub struct TaskRegistry {
    deps: RegistryDeps,
    slots: Mutex<HashMap<i64, Slot>>,
}

impl TaskRegistry {
    pub fn new(deps: RegistryDeps) -> Self {
        Self {
            deps,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Return the live runtime for `id`, hydrating it from the store if needed.
    ///
    /// Blocks on store I/O; call from a thread outside any async runtime.
    pub fn add(&self, id: i64) -> Result<Arc<AgentTaskRuntime>, TaskError> {
        let slot = Arc::clone(self.map().entry(id).or_default());
        let mut entry = lock(&slot);
        if let Some(runtime) = entry.as_ref() {
            return Ok(Arc::clone(runtime));
        }

        match self.hydrate(id) {
            Ok(runtime) => {
                *entry = Some(Arc::clone(&runtime));
                info!(task_id = id, "Task runtime hydrated");
                Ok(runtime)
            }
            Err(e) => {
                drop(entry);
                self.discard_if_empty(id, &slot);
                debug!(task_id = id, error = %e, "Task hydration failed");
                Err(e)
            }
        }
    }

    pub fn get(&self, id: i64) -> Option<Arc<AgentTaskRuntime>> {
        let slot = self.map().get(&id).cloned()?;
        lock(&slot).clone()
    }

    pub fn has(&self, id: i64) -> bool {
        self.get(id).is_some()
    }

    /// Number of live runtimes. Slots still hydrating are not counted.
    pub fn len(&self) -> usize {
        self.map()
            .values()
            .filter(|slot| slot.try_lock().is_ok_and(|entry| entry.is_some()))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evict the runtime, stop it, and persist its final conversation.
    ///
    /// Returns whether a runtime was registered.
    pub fn remove(&self, id: i64) -> bool {
        let Some(slot) = self.map().remove(&id) else {
            return false;
        };
        let Some(runtime) = lock(&slot).take() else {
            return false;
        };

        runtime.stop_and_wait();
        if let Err(e) = runtime.persist() {
            warn!(task_id = id, error = %e, "Failed to persist removed task");
        }
        info!(task_id = id, "Task runtime removed");
        true
    }

    /// Halt the runtime, wait for its drive loop to exit, and persist it.
    /// It stays registered and can be run again right away.
    ///
    /// Returns `Ok(false)` when no runtime is registered for `id`.
    pub fn stop(&self, id: i64) -> Result<bool, TaskError> {
        let Some(runtime) = self.get(id) else {
            return Ok(false);
        };
        runtime.stop_and_wait();
        runtime.persist()?;
        Ok(true)
    }

    /// Stop and persist every live runtime.
    pub fn shutdown(&self) {
        let slots: Vec<(i64, Slot)> = self.map().drain().collect();
        let runtimes: Vec<Arc<AgentTaskRuntime>> =
            slots.iter().filter_map(|(_, slot)| lock(slot).take()).collect();
        for runtime in &runtimes {
            runtime.stop();
        }
        let mut stopped = 0usize;
        for runtime in runtimes {
            let id = runtime.id();
            runtime.stop_and_wait();
            if let Err(e) = runtime.persist() {
                warn!(task_id = id, error = %e, "Failed to persist task on shutdown");
            }
            stopped += 1;
        }
        info!(stopped, "Task registry shut down");
    }

    fn hydrate(&self, id: i64) -> Result<Arc<AgentTaskRuntime>, TaskError> {
        let scheduler = &self.deps.scheduler;

        let store = Arc::clone(&self.deps.store);
        let record = scheduler
            .block_on(async move { store.fetch_task(id).await })?
            .map_err(|e| {
                if e.is_not_found() {
                    TaskError::NotFound { id }
                } else {
                    TaskError::Store(e)
                }
            })?;

        let agent_id = record.agent_id.ok_or_else(|| TaskError::Context {
            id,
            source: StoreError::not_found("agent for task", id),
        })?;
        let resolver = Arc::clone(&self.deps.resolver);
        let workspace_id = record.workspace_id;
        let context = scheduler
            .block_on(async move { resolver.resolve(workspace_id, agent_id).await })?
            .map_err(|source| TaskError::Context { id, source })?;

        let client = self
            .deps
            .llm_factory
            .create(&context.provider)
            .map_err(|e| TaskError::Client {
                id,
                reason: e.to_string(),
            })?;

        Ok(AgentTaskRuntime::new(
            id,
            record.messages,
            context,
            client,
            RuntimeDeps {
                scheduler: Arc::clone(&self.deps.scheduler),
                store: Arc::clone(&self.deps.store),
                config: self.deps.config.clone(),
            },
        ))
    }

    /// Drop a slot left empty by a failed hydration, unless another caller is using it.
    fn discard_if_empty(&self, id: i64, slot: &Slot) {
        let mut map = self.map();
        let unused = map.get(&id).is_some_and(|current| {
            Arc::ptr_eq(current, slot) && slot.try_lock().is_ok_and(|entry| entry.is_none())
        });
        if unused {
            map.remove(&id);
        }
    }

    fn map(&self) -> MutexGuard<'_, HashMap<i64, Slot>> {
        lock(&self.slots)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::AgentContext;
    use crate::error::LlmError;
    use crate::llm::{LlmClient, ModelStream, ProviderConfig, ProviderKind, StreamRequest};
    use crate::message::Message;
    use crate::store::{MemoryStore, TaskRecord};
    use crate::tools::ToolCatalog;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct OfflineClient;

    #[async_trait]
    impl LlmClient for OfflineClient {
        fn provider_name(&self) -> &str {
            "offline"
        }

        async fn open_stream(&self, _request: StreamRequest) -> Result<ModelStream, LlmError> {
            Err(LlmError::RequestFailed {
                provider: "offline".into(),
                reason: "no network in tests".into(),
            })
        }
    }

    #[derive(Default)]
    struct CountingFactory {
        created: AtomicUsize,
    }

    impl LlmClientFactory for CountingFactory {
        fn create(&self, _provider: &ProviderConfig) -> Result<Arc<dyn LlmClient>, LlmError> {
            self.created.fetch_add(1, Ordering::SeqCst);
            // Widen the hydration window so concurrent callers overlap.
            std::thread::sleep(std::time::Duration::from_millis(20));
            Ok(Arc::new(OfflineClient))
        }
    }

    fn context() -> AgentContext {
        AgentContext {
            provider: ProviderConfig {
                kind: ProviderKind::OpenAi,
                base_url: None,
                api_key: secrecy::SecretString::from("sk-test"),
            },
            model: "test-model".into(),
            system_instruction: "be helpful".into(),
            tools: Arc::new(ToolCatalog::new()),
        }
    }

    fn registry() -> (TaskRegistry, Arc<MemoryStore>, Arc<CountingFactory>) {
        let store = Arc::new(MemoryStore::new());
        store.insert_context(1, 1, context());
        for id in [1, 2] {
            store.insert_task(TaskRecord {
                id,
                title: format!("task {id}"),
                workspace_id: 1,
                agent_id: Some(1),
                messages: vec![Message::user("hi")],
            });
        }
        let factory = Arc::new(CountingFactory::default());
        let registry = TaskRegistry::new(RegistryDeps {
            scheduler: Arc::new(Scheduler::start("registry-test").unwrap()),
            store: store.clone(),
            resolver: store.clone(),
            llm_factory: factory.clone(),
            config: RuntimeConfig::default(),
        });
        (registry, store, factory)
    }

    #[test]
    fn concurrent_add_returns_same_instance() {
        let (registry, _store, factory) = registry();
        let registry = Arc::new(registry);

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || registry.add(1).unwrap())
            })
            .collect();
        let runtimes: Vec<_> = threads.into_iter().map(|t| t.join().unwrap()).collect();

        for rt in &runtimes[1..] {
            assert!(Arc::ptr_eq(&runtimes[0], rt));
        }
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn missing_task_leaves_no_entry() {
        let (registry, _store, _factory) = registry();

        let err = registry.add(404).unwrap_err();
        assert!(matches!(err, TaskError::NotFound { id: 404 }));
        assert!(!registry.has(404));
        assert!(registry.is_empty());
    }

    #[test]
    fn unresolvable_context_is_reported() {
        let (registry, store, _factory) = registry();
        store.insert_task(TaskRecord {
            id: 3,
            title: "orphan".into(),
            workspace_id: 9,
            agent_id: Some(9),
            messages: vec![],
        });

        let err = registry.add(3).unwrap_err();
        assert!(matches!(err, TaskError::Context { id: 3, .. }));
        assert!(err.is_not_found());
        assert!(!registry.has(3));
    }

    #[test]
    fn stop_on_idle_runtime_persists_and_keeps_it() {
        let (registry, store, _factory) = registry();
        assert!(!registry.stop(1).unwrap());

        let rt = registry.add(1).unwrap();
        rt.append_message(Message::user("second"));
        assert!(registry.stop(1).unwrap());

        assert!(registry.has(1));
        assert_eq!(store.save_count(1), 1);
        assert_eq!(store.messages(1).unwrap().len(), 2);
    }

    #[test]
    fn remove_evicts_and_persists() {
        let (registry, store, _factory) = registry();
        let rt = registry.add(2).unwrap();
        rt.append_message(Message::user("bye"));

        assert!(registry.remove(2));
        assert!(!registry.has(2));
        assert!(!registry.remove(2));
        assert_eq!(store.messages(2).unwrap().len(), 2);

        // Re-adding hydrates a fresh instance from the persisted state.
        let again = registry.add(2).unwrap();
        assert!(!Arc::ptr_eq(&rt, &again));
        assert_eq!(again.messages().len(), 2);
    }

    #[test]
    fn shutdown_persists_everything() {
        let (registry, store, _factory) = registry();
        registry.add(1).unwrap();
        registry.add(2).unwrap();

        registry.shutdown();
        assert!(registry.is_empty());
        assert_eq!(store.save_count(1), 1);
        assert_eq!(store.save_count(2), 1);
    }
}
