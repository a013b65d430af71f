//! Priority-scheduled worker pool with throttling, back-off and
//! pause/resume.
//!
//! The pool drives all long-running engine work. Scheduling is strict by
//! priority and FIFO within a priority; the number of concurrently
//! executing tasks never exceeds the thread cap, which may be changed at
//! runtime and takes effect within one scheduling quantum (100 ms).

mod monitor;

pub use monitor::{InteractionMonitor, ThrottleController};

use std::collections::{HashSet, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::config::Settings;
use crate::error::{Error, Result};

/// Scheduling quantum: how often idle workers re-check state, queue
/// contents and the thread cap.
const QUANTUM: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TaskPriority {
    Critical = 0,
    High = 1,
    Normal = 2,
    Low = 3,
}

impl TaskPriority {
    fn index(self) -> usize {
        self as usize
    }

    /// Back-off only delays background work; user-facing priorities are
    /// exempt.
    fn subject_to_back_off(self) -> bool {
        matches!(self, TaskPriority::Normal | TaskPriority::Low)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Stopped,
    Running,
    Paused,
    Stopping,
}

/// Snapshot returned by `WorkerPool::stats`.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub active_workers: usize,
    pub queued_by_priority: [usize; 4],
    pub throttle_deferrals: u64,
    pub back_off_deferrals: u64,
    pub state_changes: u64,
}

impl PoolStats {
    pub fn queued_total(&self) -> usize {
        self.queued_by_priority.iter().sum()
    }
}

type TaskFn = Box<dyn FnOnce() -> Result<()> + Send + 'static>;
type StateCallback = Box<dyn Fn(PoolState) + Send + Sync + 'static>;

struct QueuedTask {
    id: String,
    priority: TaskPriority,
    category: String,
    work: TaskFn,
}

/// Handle returned by `submit`; currently just names the task.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    pub id: String,
}

#[derive(Default)]
struct PoolInner {
    state_tag: u8, // PoolState, kept as u8 so Default works
    queues: [VecDeque<QueuedTask>; 4],
    pending_ids: HashSet<String>,
    active: usize,
}

impl PoolInner {
    fn state(&self) -> PoolState {
        match self.state_tag {
            1 => PoolState::Running,
            2 => PoolState::Paused,
            3 => PoolState::Stopping,
            _ => PoolState::Stopped,
        }
    }

    fn set_state(&mut self, state: PoolState) {
        self.state_tag = match state {
            PoolState::Stopped => 0,
            PoolState::Running => 1,
            PoolState::Paused => 2,
            PoolState::Stopping => 3,
        };
    }

    fn pop_next(&mut self) -> Option<QueuedTask> {
        self.queues.iter_mut().find_map(VecDeque::pop_front)
    }

    fn queued_by_priority(&self) -> [usize; 4] {
        [
            self.queues[0].len(),
            self.queues[1].len(),
            self.queues[2].len(),
            self.queues[3].len(),
        ]
    }
}

#[derive(Default)]
struct StatsInner {
    submitted: u64,
    completed: u64,
    failed: u64,
    throttle_deferrals: u64,
    back_off_deferrals: u64,
    state_changes: u64,
}

struct Shared {
    inner: Mutex<PoolInner>,
    cv: Condvar,
    stats: Mutex<StatsInner>,
    thread_cap: AtomicUsize,
    back_off_enabled: bool,
    monitor: InteractionMonitor,
    throttle: ThrottleController,
    on_state_change: Mutex<Option<StateCallback>>,
}

impl Shared {
    fn transition(&self, inner: &mut PoolInner, next: PoolState) {
        let previous = inner.state();
        if previous == next {
            return;
        }
        inner.set_state(next);
        self.stats.lock().unwrap().state_changes += 1;
        if let Some(callback) = self.on_state_change.lock().unwrap().as_ref() {
            callback(next);
        }
    }
}

pub struct WorkerPool {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(settings: &Settings) -> Self {
        let shared = Arc::new(Shared {
            inner: Mutex::new(PoolInner::default()),
            cv: Condvar::new(),
            stats: Mutex::new(StatsInner::default()),
            thread_cap: AtomicUsize::new(settings.thread_cap.max(1)),
            back_off_enabled: settings.back_off_enabled,
            monitor: InteractionMonitor::new(
                settings.interaction_threshold,
                settings.interaction_window_seconds,
                settings.back_off_duration_seconds,
            ),
            throttle: ThrottleController::new(settings.io_throttle_ops_per_sec),
            on_state_change: Mutex::new(None),
        });
        Self {
            shared,
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Spawn worker threads and transition Stopped → Running. No-op from
    /// any other state.
    pub fn start(&self) {
        let mut inner = self.shared.inner.lock().unwrap();
        if inner.state() != PoolState::Stopped {
            return;
        }
        self.shared.transition(&mut inner, PoolState::Running);
        drop(inner);

        let cap = self.shared.thread_cap.load(Ordering::SeqCst);
        let mut workers = self.workers.lock().unwrap();
        for _ in 0..cap {
            workers.push(self.spawn_worker());
        }
    }

    fn spawn_worker(&self) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        std::thread::Builder::new()
            .name("photodup-worker".to_string())
            .spawn(move || worker_loop(shared))
            .expect("failed to spawn worker thread")
    }

    /// Enqueue a task. Succeeds in Running and Paused states; while paused
    /// the task waits for `resume`. Ids of queued or running tasks must be
    /// unique.
    pub fn submit(
        &self,
        task_id: impl Into<String>,
        priority: TaskPriority,
        category: impl Into<String>,
        work: TaskFn,
    ) -> Result<TaskHandle> {
        let task_id = task_id.into();
        let mut inner = self.shared.inner.lock().unwrap();
        match inner.state() {
            PoolState::Stopping | PoolState::Stopped => {
                return Err(Error::Pool(format!(
                    "pool is not accepting tasks (submitting {task_id:?})"
                )));
            }
            PoolState::Running | PoolState::Paused => {}
        }
        if !inner.pending_ids.insert(task_id.clone()) {
            return Err(Error::Pool(format!("duplicate task id {task_id:?}")));
        }
        inner.queues[priority.index()].push_back(QueuedTask {
            id: task_id.clone(),
            priority,
            category: category.into(),
            work,
        });
        drop(inner);

        self.shared.stats.lock().unwrap().submitted += 1;
        self.shared.cv.notify_all();
        Ok(TaskHandle { id: task_id })
    }

    /// Running → Paused: executing tasks finish, queued tasks hold.
    pub fn pause(&self) {
        let mut inner = self.shared.inner.lock().unwrap();
        if inner.state() == PoolState::Running {
            self.shared.transition(&mut inner, PoolState::Paused);
            drop(inner);
            self.shared.cv.notify_all();
        }
    }

    /// Paused → Running: queued tasks become eligible again.
    pub fn resume(&self) {
        let mut inner = self.shared.inner.lock().unwrap();
        if inner.state() == PoolState::Paused {
            self.shared.transition(&mut inner, PoolState::Running);
            drop(inner);
            self.shared.cv.notify_all();
        }
    }

    /// Refuse new submissions, drop queued tasks, wait up to `timeout` for
    /// in-flight tasks, then abandon any still running. Returns true when
    /// everything drained within the timeout.
    pub fn stop(&self, timeout: Duration) -> bool {
        let mut inner = self.shared.inner.lock().unwrap();
        if inner.state() == PoolState::Stopped {
            return true;
        }
        self.shared.transition(&mut inner, PoolState::Stopping);
        let mut dropped_ids = Vec::new();
        for queue in inner.queues.iter_mut() {
            dropped_ids.extend(queue.drain(..).map(|task| task.id));
        }
        for id in dropped_ids {
            inner.pending_ids.remove(&id);
        }
        self.shared.cv.notify_all();

        let deadline = Instant::now() + timeout;
        while inner.active > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let (guard, _) = self.shared.cv.wait_timeout(inner, remaining).unwrap();
            inner = guard;
        }
        let drained = inner.active == 0;
        self.shared.transition(&mut inner, PoolState::Stopped);
        drop(inner);

        // Workers observe Stopped/Stopping and exit; join the ones that
        // already finished so thread resources are reclaimed.
        self.shared.cv.notify_all();
        let mut workers = self.workers.lock().unwrap();
        if drained {
            for handle in workers.drain(..) {
                let _ = handle.join();
            }
        } else {
            workers.clear();
        }
        drained
    }

    pub fn state(&self) -> PoolState {
        self.shared.inner.lock().unwrap().state()
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.shared.inner.lock().unwrap();
        let stats = self.shared.stats.lock().unwrap();
        PoolStats {
            submitted: stats.submitted,
            completed: stats.completed,
            failed: stats.failed,
            active_workers: inner.active,
            queued_by_priority: inner.queued_by_priority(),
            throttle_deferrals: stats.throttle_deferrals,
            back_off_deferrals: stats.back_off_deferrals,
            state_changes: stats.state_changes,
        }
    }

    /// Feed one external interaction event into the back-off monitor.
    pub fn record_interaction(&self) {
        self.shared.monitor.record_interaction();
    }

    /// Change the concurrency cap. Takes effect within one scheduling
    /// quantum; extra workers are spawned if the cap grew past the current
    /// thread count while running.
    pub fn set_thread_cap(&self, cap: usize) {
        let cap = cap.max(1);
        self.shared.thread_cap.store(cap, Ordering::SeqCst);
        let running = self.state() == PoolState::Running;
        if running {
            let mut workers = self.workers.lock().unwrap();
            while workers.len() < cap {
                workers.push(self.spawn_worker());
            }
        }
        self.shared.cv.notify_all();
    }

    pub fn set_state_callback(&self, callback: StateCallback) {
        *self.shared.on_state_change.lock().unwrap() = Some(callback);
    }

    /// Block until no tasks are queued or executing. The rescan coordinator
    /// uses this as its phase barrier: grouping must not start before every
    /// feature task has committed.
    pub fn wait_idle(&self) {
        let mut inner = self.shared.inner.lock().unwrap();
        loop {
            let queue_empty = inner.queues.iter().all(VecDeque::is_empty);
            let idle = queue_empty && inner.active == 0;
            let paused_or_dead = matches!(inner.state(), PoolState::Stopped);
            if idle || paused_or_dead {
                return;
            }
            let (guard, _) = self.shared.cv.wait_timeout(inner, QUANTUM).unwrap();
            inner = guard;
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop(Duration::from_secs(5));
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let task = {
            let mut inner = shared.inner.lock().unwrap();
            loop {
                match inner.state() {
                    PoolState::Stopping | PoolState::Stopped => return,
                    PoolState::Paused => {
                        let (guard, _) = shared.cv.wait_timeout(inner, QUANTUM).unwrap();
                        inner = guard;
                        continue;
                    }
                    PoolState::Running => {}
                }
                let cap = shared.thread_cap.load(Ordering::SeqCst);
                if inner.active < cap {
                    if let Some(task) = inner.pop_next() {
                        inner.active += 1;
                        break task;
                    }
                }
                let (guard, _) = shared.cv.wait_timeout(inner, QUANTUM).unwrap();
                inner = guard;
            }
        };

        if shared.back_off_enabled
            && task.priority.subject_to_back_off()
            && shared.monitor.should_back_off()
        {
            shared.stats.lock().unwrap().back_off_deferrals += 1;
            std::thread::sleep(shared.monitor.back_off_sleep());
        }

        if let Some(delay) = shared.throttle.required_delay(&task.category) {
            shared.stats.lock().unwrap().throttle_deferrals += 1;
            std::thread::sleep(delay);
        }
        shared.throttle.record_start(&task.category);

        let task_id = task.id;
        let outcome = catch_unwind(AssertUnwindSafe(task.work));

        {
            let mut stats = shared.stats.lock().unwrap();
            match &outcome {
                Ok(Ok(())) => stats.completed += 1,
                Ok(Err(error)) => {
                    stats.failed += 1;
                    tracing::warn!(task = %task_id, %error, "task failed");
                }
                Err(_) => {
                    stats.failed += 1;
                    tracing::error!(task = %task_id, "task panicked");
                }
            }
        }

        let mut inner = shared.inner.lock().unwrap();
        inner.active -= 1;
        inner.pending_ids.remove(&task_id);
        drop(inner);
        shared.cv.notify_all();
    }
}
