//! Admission control for concurrent downloads.
//!
//! The coordinator owns three disjoint collections:
//!
//! ```text
//!              ┌──────────────────────────┐
//!   add() ───► │ waiting queue (FIFO)     │ ◄── pause / stop / error / completed
//!              └────────────┬─────────────┘
//!                           │ download(), slot free
//!                           ▼
//!              ┌──────────────────────────┐
//!              │ active set (≤ max_active)│ ──► one run thread per task
//!              └────────────┬─────────────┘
//!                           │ remove()
//!                           ▼
//!              ┌──────────────────────────┐
//!              │ removed (terminal)       │
//!              └──────────────────────────┘
//! ```
//!
//! Every transition goes through [`DownloadCoordinator`] under a single
//! registry lock: the transition table is consulted, the target's capacity is
//! checked, the task is moved between collections and the new status is
//! installed. Events and run threads produced by a transition are released
//! only after the lock is dropped, so listeners may call back into the
//! coordinator.
//!
//! When a task leaves the active set, the earliest outstanding activation
//! requests are admitted immediately until the active set is full again.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use super::connection::ConnectionSource;
use super::error::{CoordinatorError, CoordinatorResult};
use super::events::{DownloadEvent, DownloadObserver};
use super::http::HttpSource;
use super::queue::WaitingQueue;
use super::status::{transition, Status};
use super::task::{DownloadId, DownloadSnapshot, DownloadTask, TaskSettings};
use crate::config::CoordinatorConfig;

/// Side effect of a transition, released after the registry lock.
enum Effect {
    Changed(Arc<DownloadTask>, Status),
    Start(Arc<DownloadTask>, u64),
}

/// Lock-protected membership state.
struct Registry {
    tasks: BTreeMap<DownloadId, Arc<DownloadTask>>,
    active: Vec<DownloadId>,
    waiting: WaitingQueue,
    removed: Vec<DownloadId>,
    max_active: usize,
}

impl Registry {
    /// Undo the bookkeeping of the status being left.
    fn leave(&mut self, id: DownloadId, current: &Status) {
        match current {
            Status::Active => self.active.retain(|a| *a != id),
            Status::Removed => {}
            _ => {
                self.waiting.dequeue(id);
            }
        }
    }

    /// Perform the bookkeeping of the status being entered.
    fn enter(&mut self, id: DownloadId, target: &Status) {
        match target {
            Status::Active => self.active.push(id),
            Status::Removed => self.removed.push(id),
            _ => {
                self.waiting.enqueue(id);
            }
        }
    }

    fn has_free_slot(&self) -> bool {
        self.active.len() < self.max_active
    }

    fn destination_in_use(&self, destination: &Path) -> bool {
        self.tasks
            .values()
            .any(|task| !task.status().is_terminal() && task.destination() == destination)
    }
}

pub(crate) struct Shared {
    config: CoordinatorConfig,
    registry: Mutex<Registry>,
    observers: RwLock<Vec<Arc<dyn DownloadObserver>>>,
    next_id: AtomicU64,
}

/// Owner of every download; enforces the concurrency limit.
///
/// Cloning is cheap and yields a handle to the same coordinator.
#[derive(Clone)]
pub struct DownloadCoordinator {
    inner: Arc<Shared>,
}

impl DownloadCoordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        let max_active = config.max_active.max(1);
        Self {
            inner: Arc::new(Shared {
                config,
                registry: Mutex::new(Registry {
                    tasks: BTreeMap::new(),
                    active: Vec::new(),
                    waiting: WaitingQueue::new(),
                    removed: Vec::new(),
                    max_active,
                }),
                observers: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub(crate) fn from_shared(inner: Arc<Shared>) -> Self {
        Self { inner }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    // ------------------------------------------------------------------
    // Enrollment
    // ------------------------------------------------------------------

    /// Enrolls a download into the configured download directory, named
    /// after the source's suggested file name.
    pub fn add<S>(&self, source: S) -> CoordinatorResult<Arc<DownloadTask>>
    where
        S: ConnectionSource + 'static,
    {
        let destination = self
            .inner
            .config
            .download_dir
            .join(source.suggested_file_name());
        self.enroll(Arc::new(source), destination)
    }

    /// Enrolls a download writing to an explicit path.
    pub fn add_to<S>(
        &self,
        source: S,
        destination: impl Into<PathBuf>,
    ) -> CoordinatorResult<Arc<DownloadTask>>
    where
        S: ConnectionSource + 'static,
    {
        self.enroll(Arc::new(source), destination.into())
    }

    /// Enrolls an HTTP download using the configured timeout.
    pub fn add_url(&self, url: &str) -> CoordinatorResult<Arc<DownloadTask>> {
        let source = HttpSource::with_timeout(url, self.inner.config.timeout)?;
        self.add(source)
    }

    fn enroll(
        &self,
        source: Arc<dyn ConnectionSource>,
        destination: PathBuf,
    ) -> CoordinatorResult<Arc<DownloadTask>> {
        let mut registry = self.inner.registry.lock();
        if registry.destination_in_use(&destination) {
            return Err(CoordinatorError::DuplicateDestination(destination));
        }

        let id = DownloadId::new(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        let settings = TaskSettings {
            chunk_size: self.inner.config.chunk_size.max(1),
            exists_policy: self.inner.config.exists_policy,
        };
        let task = Arc::new(DownloadTask::new(
            id,
            source,
            destination,
            settings,
            Arc::downgrade(&self.inner),
        ));
        for observer in self.inner.observers.read().iter() {
            task.add_listener(Arc::clone(observer));
        }

        registry.tasks.insert(id, Arc::clone(&task));
        registry.waiting.enqueue(id);

        tracing::debug!(
            task = id.get(),
            source = %task.source().describe(),
            destination = %task.destination().display(),
            resume_from = task.downloaded(),
            "Download enrolled"
        );
        Ok(task)
    }

    /// Attaches `observer` to every download enrolled from now on.
    pub fn add_observer(&self, observer: Arc<dyn DownloadObserver>) {
        self.inner.observers.write().push(observer);
    }

    // ------------------------------------------------------------------
    // Verbs
    // ------------------------------------------------------------------

    /// Requests activation of `id`.
    ///
    /// Returns `true` if the download became active. Without a free slot the
    /// request is queued and the download is admitted, in request order, as
    /// soon as a slot frees.
    pub fn download(&self, id: DownloadId) -> bool {
        self.apply(id, |this, registry, task, effects| {
            match task.status().download_target() {
                Some(target) => this.transition(registry, task, target, effects),
                None => false,
            }
        })
    }

    /// Pauses an active download.
    ///
    /// On a download still waiting for a slot this withdraws the pending
    /// request instead; no status change is made.
    pub fn pause(&self, id: DownloadId) -> bool {
        self.apply(id, |this, registry, task, effects| {
            match task.status().pause_target() {
                Some(target) => this.transition(registry, task, target, effects),
                None => {
                    registry.waiting.cancel_request(task.id());
                    false
                }
            }
        })
    }

    /// Stops an active download.
    ///
    /// Like [`pause`](Self::pause), withdraws a pending request otherwise.
    pub fn stop(&self, id: DownloadId) -> bool {
        self.apply(id, |this, registry, task, effects| {
            match task.status().stop_target() {
                Some(target) => this.transition(registry, task, target, effects),
                None => {
                    registry.waiting.cancel_request(task.id());
                    false
                }
            }
        })
    }

    /// Removes a download permanently, stopping it first if active.
    pub fn remove(&self, id: DownloadId) -> bool {
        self.apply(id, |this, registry, task, effects| {
            let mut changed = false;
            for step in task.status().removal_path() {
                if !this.transition(registry, task, step, effects) {
                    break;
                }
                changed = true;
            }
            changed
        })
    }

    /// Changes the active-set capacity.
    ///
    /// Raising it admits waiting requesters at once; lowering it never
    /// interrupts running downloads, the set just drains below the new limit.
    pub fn set_max_active(&self, max_active: usize) {
        let mut effects = Vec::new();
        {
            let mut registry = self.inner.registry.lock();
            registry.max_active = max_active.max(1);
            self.promote(&mut registry, &mut effects);
        }
        self.release(effects);
    }

    /// Stops every active download and withdraws pending requests, then
    /// waits up to `timeout` for all run threads to exit.
    ///
    /// Returns `false` if some run was still in flight at the deadline.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut effects = Vec::new();
        let tasks: Vec<_> = {
            let mut registry = self.inner.registry.lock();
            for id in registry.waiting.requesters() {
                registry.waiting.cancel_request(id);
            }
            let active: Vec<_> = registry
                .active
                .iter()
                .filter_map(|id| registry.tasks.get(id).cloned())
                .collect();
            for task in &active {
                self.transition(&mut registry, task, Status::Inactive, &mut effects);
            }
            registry.tasks.values().cloned().collect()
        };
        self.release(effects);

        tracing::info!(tasks = tasks.len(), "Waiting for downloads to stop");
        tasks.iter().all(|task| {
            task.wait_idle(deadline.saturating_duration_since(Instant::now()))
        })
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn get(&self, id: DownloadId) -> Option<Arc<DownloadTask>> {
        self.inner.registry.lock().tasks.get(&id).cloned()
    }

    /// Every download that has not been removed, in enrollment order.
    pub fn tasks(&self) -> Vec<Arc<DownloadTask>> {
        self.inner
            .registry
            .lock()
            .tasks
            .values()
            .filter(|task| !task.status().is_terminal())
            .cloned()
            .collect()
    }

    pub fn snapshots(&self) -> Vec<DownloadSnapshot> {
        self.tasks().iter().map(|task| task.snapshot()).collect()
    }

    pub fn active_ids(&self) -> Vec<DownloadId> {
        self.inner.registry.lock().active.clone()
    }

    pub fn waiting_ids(&self) -> Vec<DownloadId> {
        self.inner.registry.lock().waiting.ids()
    }

    pub fn removed_ids(&self) -> Vec<DownloadId> {
        self.inner.registry.lock().removed.clone()
    }

    pub fn max_active(&self) -> usize {
        self.inner.registry.lock().max_active
    }

    /// Rank of `id` among downloads waiting for a slot.
    ///
    /// `None` for active, completed and removed downloads, and for waiting
    /// ones that have not asked to be activated.
    pub fn queue_position(&self, id: DownloadId) -> Option<usize> {
        let registry = self.inner.registry.lock();
        let task = registry.tasks.get(&id)?;
        if task.status().is_queueable() {
            registry.waiting.position(id)
        } else {
            None
        }
    }

    /// True when no download is active or waiting for a slot.
    pub fn is_idle(&self) -> bool {
        let registry = self.inner.registry.lock();
        registry.active.is_empty() && registry.waiting.front().is_none()
    }

    // ------------------------------------------------------------------
    // Run reports
    // ------------------------------------------------------------------

    /// Applies the terminal status reported by the run of `epoch`.
    ///
    /// Ignored if the run has been superseded: the task was paused, stopped
    /// or removed, or a newer run was admitted.
    pub(crate) fn finish_run(&self, id: DownloadId, epoch: u64, status: Status) -> bool {
        self.apply(id, |this, registry, task, effects| {
            if task.epoch() != epoch || task.status() != Status::Active {
                tracing::debug!(
                    task = id.get(),
                    epoch,
                    reported = %status,
                    "Ignoring report from superseded run"
                );
                return false;
            }
            this.transition(registry, task, status, effects)
        })
    }

    // ------------------------------------------------------------------
    // Transition engine
    // ------------------------------------------------------------------

    fn apply<F>(&self, id: DownloadId, op: F) -> bool
    where
        F: FnOnce(&Self, &mut Registry, &Arc<DownloadTask>, &mut Vec<Effect>) -> bool,
    {
        let mut effects = Vec::new();
        let changed = {
            let mut registry = self.inner.registry.lock();
            let Some(task) = registry.tasks.get(&id).cloned() else {
                return false;
            };
            op(self, &mut registry, &task, &mut effects)
        };
        self.release(effects);
        changed
    }

    /// Moves `task` to `target` if the table allows it and there is room.
    fn transition(
        &self,
        registry: &mut Registry,
        task: &Arc<DownloadTask>,
        target: Status,
        effects: &mut Vec<Effect>,
    ) -> bool {
        let current = task.status();
        if !transition::is_allowed(current.kind(), target.kind()) {
            return false;
        }

        let id = task.id();
        if target == Status::Active && !registry.has_free_slot() {
            registry.waiting.request(id);
            tracing::debug!(
                task = id.get(),
                position = ?registry.waiting.position(id),
                "No free slot, download queued"
            );
            return false;
        }

        registry.leave(id, &current);
        registry.enter(id, &target);
        task.set_status(target.clone());

        effects.push(Effect::Changed(Arc::clone(task), target.clone()));
        if target == Status::Active {
            effects.push(Effect::Start(Arc::clone(task), task.next_epoch()));
        }

        if current == Status::Active {
            self.promote(registry, effects);
        }
        true
    }

    /// Admits the earliest requesters until the active set is full.
    fn promote(&self, registry: &mut Registry, effects: &mut Vec<Effect>) {
        while registry.has_free_slot() {
            let Some(id) = registry.waiting.front() else {
                break;
            };
            let admitted = match registry.tasks.get(&id).cloned() {
                Some(task) => self.transition(registry, &task, Status::Active, effects),
                None => false,
            };
            if !admitted {
                registry.waiting.cancel_request(id);
            }
        }
    }

    /// Delivers events and starts run threads, in the order they were produced.
    fn release(&self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Changed(task, status) => {
                    task.notify(&DownloadEvent::StatusChanged {
                        task: &task,
                        status: &status,
                    });
                }
                Effect::Start(task, epoch) => {
                    if let Err(e) = task.start(epoch) {
                        tracing::error!(task = task.id().get(), error = %e, "Failed to spawn download thread");
                        self.finish_run(
                            task.id(),
                            epoch,
                            Status::Error(format!("failed to start download thread: {}", e)),
                        );
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for DownloadCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.inner.registry.lock();
        f.debug_struct("DownloadCoordinator")
            .field("max_active", &registry.max_active)
            .field("active", &registry.active)
            .field("waiting", &registry.waiting.len())
            .field("removed", &registry.removed.len())
            .finish()
    }
}
