use crate::config::PoolConfig;
use crate::error::{ServerError, ServerResult};
use futures::channel::oneshot;
use log::{debug, error, warn};
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A unit of work with its scheduling priority. Higher priorities run
/// first; equal priorities run in no particular order.
struct Task {
    priority: u32,
    job: Job,
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority
    }
}

impl Eq for Task {}

impl PartialOrd for Task {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Task {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority.cmp(&other.priority)
    }
}

/// Everything guarded by the pool lock.
struct State {
    queue: BinaryHeap<Task>,
    shutdown: bool,
    /// Live worker threads.
    threads: usize,
    /// Workers currently running a task.
    busy: usize,
    /// Idle workers asked to exit on their next empty-queue wakeup.
    retire: usize,
    workers: HashMap<ThreadId, JoinHandle<()>>,
    /// Handles of workers that already left the roster, joined at shutdown.
    retired: Vec<JoinHandle<()>>,
    next_worker_id: usize,
}

struct Shared {
    state: Mutex<State>,
    work_ready: Condvar,
    space_ready: Condvar,
    sampler_wake: Condvar,
    config: PoolConfig,
}

/// Result of a submitted task. Await it, block on it with `wait`, or drop it.
pub struct TaskHandle<T> {
    rx: oneshot::Receiver<Result<T, String>>,
}

impl<T> TaskHandle<T> {
    /// Block the calling thread until the task has run.
    pub fn wait(self) -> ServerResult<T> {
        futures::executor::block_on(self)
    }

    /// The result, if the task already finished.
    pub fn try_result(&mut self) -> Option<ServerResult<T>> {
        match self.rx.try_recv() {
            Ok(Some(outcome)) => Some(outcome.map_err(ServerError::TaskPanicked)),
            Ok(None) => None,
            Err(oneshot::Canceled) => Some(Err(ServerError::PoolShutdown)),
        }
    }
}

impl<T> Future for TaskHandle<T> {
    type Output = ServerResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.get_mut().rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome.map_err(ServerError::TaskPanicked)),
            Poll::Ready(Err(oneshot::Canceled)) => Poll::Ready(Err(ServerError::PoolShutdown)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Why `try_submit` refused a task. The task is handed back either way.
pub enum TrySubmitError<F> {
    /// The queue is at capacity.
    Full(F),
    Shutdown(F),
}

impl<F> TrySubmitError<F> {
    pub fn is_full(&self) -> bool {
        matches!(self, TrySubmitError::Full(_))
    }

    pub fn into_inner(self) -> F {
        match self {
            TrySubmitError::Full(work) | TrySubmitError::Shutdown(work) => work,
        }
    }
}

impl<F> fmt::Debug for TrySubmitError<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrySubmitError::Full(_) => f.write_str("Full(..)"),
            TrySubmitError::Shutdown(_) => f.write_str("Shutdown(..)"),
        }
    }
}

impl<F> fmt::Display for TrySubmitError<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrySubmitError::Full(_) => f.write_str("worker queue is full"),
            TrySubmitError::Shutdown(_) => f.write_str("worker pool is shut down"),
        }
    }
}

impl<F> From<TrySubmitError<F>> for ServerError {
    fn from(err: TrySubmitError<F>) -> Self {
        match err {
            TrySubmitError::Full(_) => ServerError::PoolSaturated,
            TrySubmitError::Shutdown(_) => ServerError::PoolShutdown,
        }
    }
}

/// An elastic pool of worker threads fed from a priority queue.
///
/// A sampler thread wakes every `resize_interval` and grows the pool when
/// the backlog outpaces busy workers, or asks idle workers to exit when they
/// clearly outnumber busy ones. Workers are never cancelled from outside:
/// a retiring worker leaves on its own once it finds the queue empty.
pub struct WorkerPool {
    shared: Arc<Shared>,
    sampler: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Start the pool with `config.initial` workers and its resize sampler.
    pub fn new(config: PoolConfig) -> ServerResult<Self> {
        config.validate()?;

        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                queue: BinaryHeap::new(),
                shutdown: false,
                threads: 0,
                busy: 0,
                retire: 0,
                workers: HashMap::new(),
                retired: Vec::new(),
                next_worker_id: 0,
            }),
            work_ready: Condvar::new(),
            space_ready: Condvar::new(),
            sampler_wake: Condvar::new(),
            config,
        });

        {
            let mut state = shared.state.lock();
            for _ in 0..shared.config.initial {
                spawn_worker(&shared, &mut state)?;
            }
        }

        let sampler_shared = Arc::clone(&shared);
        let sampler = thread::Builder::new()
            .name("pool-sampler".to_string())
            .spawn(move || run_sampler(sampler_shared))?;

        Ok(Self {
            shared,
            sampler: Mutex::new(Some(sampler)),
        })
    }

    /// Queue `work` at `priority`. Blocks while the queue is at capacity;
    /// fails only once the pool has been shut down.
    pub fn submit<F, T>(&self, priority: u32, work: F) -> ServerResult<TaskHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.enqueue(priority, work, None)
    }

    /// Like `submit`, but gives up with `PoolSaturated` once `timeout` has
    /// passed without the queue making room.
    pub fn submit_timeout<F, T>(
        &self,
        priority: u32,
        timeout: Duration,
        work: F,
    ) -> ServerResult<TaskHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.enqueue(priority, work, Some(Instant::now() + timeout))
    }

    /// Queue `work` only if there is room right now. On failure the work
    /// comes back untouched inside the error.
    pub fn try_submit<F, T>(&self, priority: u32, work: F) -> Result<TaskHandle<T>, TrySubmitError<F>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            return Err(TrySubmitError::Shutdown(work));
        }
        if state.queue.len() >= self.shared.config.queue_capacity {
            return Err(TrySubmitError::Full(work));
        }

        let (job, handle) = package(work);
        state.queue.push(Task { priority, job });
        drop(state);
        self.shared.work_ready.notify_one();
        Ok(handle)
    }

    fn enqueue<F, T>(&self, priority: u32, work: F, deadline: Option<Instant>) -> ServerResult<TaskHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let mut state = self.shared.state.lock();
        while state.queue.len() >= self.shared.config.queue_capacity && !state.shutdown {
            match deadline {
                Some(deadline) => {
                    if self.shared.space_ready.wait_until(&mut state, deadline).timed_out()
                        && state.queue.len() >= self.shared.config.queue_capacity
                        && !state.shutdown
                    {
                        return Err(ServerError::PoolSaturated);
                    }
                }
                None => self.shared.space_ready.wait(&mut state),
            }
        }
        if state.shutdown {
            return Err(ServerError::PoolShutdown);
        }

        let (job, handle) = package(work);
        state.queue.push(Task { priority, job });
        drop(state);
        self.shared.work_ready.notify_one();
        Ok(handle)
    }

    /// Run one resize evaluation now instead of waiting for the sampler.
    pub fn rebalance(&self) {
        let mut state = self.shared.state.lock();
        rebalance(&self.shared, &mut state);
    }

    pub fn threads(&self) -> usize {
        self.shared.state.lock().threads
    }

    pub fn busy(&self) -> usize {
        self.shared.state.lock().busy
    }

    pub fn pending(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.state.lock().shutdown
    }

    /// Stop accepting work, let workers drain the queue, and join every
    /// worker and the sampler. Safe to call more than once.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
        }
        self.shared.work_ready.notify_all();
        self.shared.space_ready.notify_all();
        self.shared.sampler_wake.notify_all();

        if let Some(sampler) = self.sampler.lock().take() {
            if sampler.join().is_err() {
                warn!("Pool sampler thread panicked");
            }
        }

        let handles: Vec<JoinHandle<()>> = {
            let mut state = self.shared.state.lock();
            let mut handles: Vec<_> = state.workers.drain().map(|(_, h)| h).collect();
            handles.append(&mut state.retired);
            handles
        };

        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                warn!("Worker thread panicked during shutdown");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Wrap `work` so a panic is caught and the outcome reaches its handle.
fn package<F, T>(work: F) -> (Job, TaskHandle<T>)
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    let job: Job = Box::new(move || {
        let outcome = panic::catch_unwind(AssertUnwindSafe(work)).map_err(panic_message);
        if let Err(message) = &outcome {
            error!("Worker task panicked: {}", message);
        }
        let _ = tx.send(outcome);
    });
    (job, TaskHandle { rx })
}

fn spawn_worker(shared: &Arc<Shared>, state: &mut State) -> ServerResult<()> {
    let id = state.next_worker_id;
    state.next_worker_id += 1;

    let worker_shared = Arc::clone(shared);
    let handle = thread::Builder::new()
        .name(format!("worker-{}", id))
        .spawn(move || run_worker(worker_shared))?;

    state.workers.insert(handle.thread().id(), handle);
    state.threads += 1;
    Ok(())
}

fn run_worker(shared: Arc<Shared>) {
    loop {
        let task = {
            let mut state = shared.state.lock();
            loop {
                if let Some(task) = state.queue.pop() {
                    state.busy += 1;
                    shared.space_ready.notify_one();
                    break task;
                }
                if state.shutdown || state.retire > 0 {
                    if !state.shutdown {
                        state.retire -= 1;
                    }
                    leave_roster(&mut state);
                    return;
                }
                shared.work_ready.wait(&mut state);
            }
        };

        (task.job)();

        shared.state.lock().busy -= 1;
    }
}

/// Called by an exiting worker with the lock held.
fn leave_roster(state: &mut State) {
    state.threads -= 1;
    let id = thread::current().id();
    if let Some(handle) = state.workers.remove(&id) {
        state.retired.push(handle);
    }
    debug!("Worker {:?} exiting, {} threads left", id, state.threads);
}

fn run_sampler(shared: Arc<Shared>) {
    let interval = shared.config.resize_interval;
    let mut state = shared.state.lock();
    // shutdown may have been flagged before this thread first took the lock
    while !state.shutdown {
        shared.sampler_wake.wait_for(&mut state, interval);
        if state.shutdown {
            break;
        }
        rebalance(&shared, &mut state);
    }
}

fn rebalance(shared: &Arc<Shared>, state: &mut State) {
    if state.shutdown {
        return;
    }
    let config = &shared.config;
    let pending = state.queue.len();
    let busy = state.busy;
    let threads = state.threads;
    let idle = threads.saturating_sub(busy);

    if pending > busy && threads < config.max {
        let add = (config.max - threads).min(pending - busy);
        for _ in 0..add {
            if let Err(e) = spawn_worker(shared, state) {
                error!("Failed to grow worker pool: {}", e);
                break;
            }
        }
        debug!("Worker pool grew by {} to {} threads", add, state.threads);
        return;
    }

    if busy < idle && threads > config.min {
        let keep = (2 * pending).max(config.min);
        let remove = threads
            .saturating_sub(keep)
            .min(idle)
            .min(threads - config.min)
            .saturating_sub(state.retire);
        if remove == 0 {
            return;
        }
        state.retire += remove;
        for _ in 0..remove {
            shared.work_ready.notify_one();
        }
        debug!("Worker pool asked {} idle threads to exit", remove);
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
