//! Background scheduler — one dedicated loop thread for asynchronous work.
//!
//! The scheduler owns a current-thread tokio runtime running on its own OS
//! thread. Foreign threads hand it futures (streaming model calls, store I/O)
//! with [`Scheduler::submit`], then either block for the output with
//! [`Scheduler::await_result`] or abort the unit with [`Scheduler::cancel`].
//!
//! `await_result` parks the *calling* thread; it must never be called from
//! inside an async context (including the scheduler's own loop).

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::SchedulerError;

/// Correlation token for one scheduled unit of work.
///
/// The scheduler owns the unit; the handle only names it.
pub struct TaskHandle<T> {
    id: Uuid,
    _output: PhantomData<fn() -> T>,
}

impl<T> TaskHandle<T> {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl<T> Clone for TaskHandle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for TaskHandle<T> {}

impl<T> std::fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("TaskHandle").field(&self.id).finish()
    }
}

/// Tracked unit.
struct ScheduledUnit {
    abort: AbortHandle,
    /// `oneshot::Receiver<T>`; taken by the first `await_result`.
    output: Option<Box<dyn Any + Send>>,
}

/// Runs asynchronous units on a single background loop thread.
pub struct Scheduler {
    name: String,
    handle: Handle,
    units: Mutex<HashMap<Uuid, ScheduledUnit>>,
    shut_down: AtomicBool,
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Spawn the loop thread and wait until its runtime is ready.
    pub fn start(name: impl Into<String>) -> Result<Self, SchedulerError> {
        let name = name.into();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<Handle, String>>();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let thread = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.to_string()));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(runtime.handle().clone()));
                runtime.block_on(async {
                    let _ = stop_rx.await;
                });
                // Dropping the runtime cancels everything still spawned on it.
            })
            .map_err(|e| SchedulerError::Startup(e.to_string()))?;

        let handle = ready_rx
            .recv()
            .map_err(|_| SchedulerError::Startup("loop thread exited during startup".to_string()))?
            .map_err(SchedulerError::Startup)?;

        info!(scheduler = %name, "Scheduler started");

        Ok(Self {
            name,
            handle,
            units: Mutex::new(HashMap::new()),
            shut_down: AtomicBool::new(false),
            stop_tx: Mutex::new(Some(stop_tx)),
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Schedule a unit on the loop thread. Returns immediately.
    pub fn submit<F, T>(&self, unit: F) -> Result<TaskHandle<T>, SchedulerError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let mut units = self.units();
        if self.is_shut_down() {
            return Err(SchedulerError::ShutDown);
        }

        let id = Uuid::new_v4();
        let (output_tx, output_rx) = oneshot::channel::<T>();
        let join = self.handle.spawn(async move {
            let _ = output_tx.send(unit.await);
        });

        units.insert(
            id,
            ScheduledUnit {
                abort: join.abort_handle(),
                output: Some(Box::new(output_rx)),
            },
        );
        debug!(scheduler = %self.name, unit = %id, "Unit submitted");

        Ok(TaskHandle {
            id,
            _output: PhantomData,
        })
    }

    /// Block the calling thread until the unit finishes, consuming the handle.
    ///
    /// Fails with `NotFound` if the handle is unknown, cancelled, or already
    /// consumed, and with `Cancelled` if the unit is aborted while waiting.
    pub fn await_result<T>(&self, handle: TaskHandle<T>) -> Result<T, SchedulerError>
    where
        T: Send + 'static,
    {
        let not_found = SchedulerError::NotFound { id: handle.id };
        let output = self
            .units()
            .get_mut(&handle.id)
            .and_then(|unit| unit.output.take())
            .ok_or_else(|| not_found.clone())?;
        let output_rx = *output
            .downcast::<oneshot::Receiver<T>>()
            .map_err(|_| not_found)?;

        let result = output_rx
            .blocking_recv()
            .map_err(|_| SchedulerError::Cancelled { id: handle.id });
        self.units().remove(&handle.id);
        result
    }

    /// Submit a unit and block for its output.
    pub fn block_on<F, T>(&self, unit: F) -> Result<T, SchedulerError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let handle = self.submit(unit)?;
        self.await_result(handle)
    }

    /// Abort a unit at its next suspension point.
    ///
    /// Returns `true` if the cancellation pre-empted natural completion;
    /// `false` if the unit had already finished or the handle is gone.
    pub fn cancel<T>(&self, handle: &TaskHandle<T>) -> bool {
        let Some(unit) = self.units().remove(&handle.id) else {
            return false;
        };
        if unit.abort.is_finished() {
            debug!(scheduler = %self.name, unit = %handle.id, "Cancel arrived too late");
            return false;
        }
        unit.abort.abort();
        debug!(scheduler = %self.name, unit = %handle.id, "Unit cancelled");
        true
    }

    /// Number of units that have not been consumed or cancelled.
    pub fn outstanding(&self) -> usize {
        self.units().len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Stop the loop, abort every outstanding unit, and join the loop thread.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let outstanding: Vec<ScheduledUnit> = self.units().drain().map(|(_, u)| u).collect();
        let aborted = outstanding.len();
        for unit in outstanding {
            unit.abort.abort();
        }

        if let Some(stop_tx) = lock(&self.stop_tx).take() {
            let _ = stop_tx.send(());
        }
        if let Some(thread) = lock(&self.thread).take()
            && thread.thread().id() != std::thread::current().id()
        {
            let _ = thread.join();
        }

        info!(scheduler = %self.name, aborted, "Scheduler shut down");
    }

    fn units(&self) -> MutexGuard<'_, HashMap<Uuid, ScheduledUnit>> {
        lock(&self.units)
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
