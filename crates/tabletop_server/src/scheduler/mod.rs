//! Scheduler threads.
//!
//! A [`Scheduler`] is a dedicated OS thread running a current-thread tokio
//! runtime inside a `LocalSet`. It owns one rule engine subprocess and hosts a
//! bounded number of rooms. Other threads drive it through
//! [`Scheduler::emit_signal`], which queues a closure onto the scheduler's
//! loop (or runs it inline when already on that thread).
//!
//! Lifecycle:
//!
//! * **Active** while its fingerprint matches the server's and it has spare
//!   capacity.
//! * **Draining** once the fingerprint is stale (or the engine died): it takes
//!   no new rooms and existing rooms are woken so they can wind down.
//! * **Retired** when draining with no rooms left: the loop quits, the engine
//!   is shut down and the thread is joined.

mod context;
pub mod pool;

pub use context::LoopContext;
pub use pool::SchedulerPool;

use bytes::Bytes;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::thread::ThreadId;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::engine::{methods, EngineBridge, HandlerTable};
use crate::error::{BridgeError, SchedulerError};
use crate::player::PlayerState;
use crate::protocol::rpc::RpcValue;

type Job = Box<dyn FnOnce(&Rc<LoopContext>) + Send>;

/// Called with the scheduler id when a running engine exits on its own.
pub type EngineLost = Arc<dyn Fn(i32) + Send + Sync>;

/// Engine status as seen from outside the scheduler thread.
#[derive(Default)]
struct EngineStatus {
    alive: OnceLock<Arc<AtomicBool>>,
    failed: AtomicBool,
    pid: OnceLock<u32>,
}

impl EngineStatus {
    fn is_alive(&self) -> bool {
        if self.failed.load(Ordering::Acquire) {
            return false;
        }
        // Still starting: queued jobs run once the engine is up.
        self.alive
            .get()
            .map_or(true, |alive| alive.load(Ordering::Acquire))
    }
}

/// Parameters for a new scheduler thread.
#[derive(Clone)]
pub struct SchedulerSpec {
    pub id: i32,
    pub capacity: usize,
    pub fingerprint: String,
    pub engine: EngineConfig,
    pub directory: PathBuf,
    pub handlers: HandlerTable,
    pub on_engine_lost: Option<EngineLost>,
}

/// Handle to a scheduler thread. Shared as `Arc<Scheduler>`.
pub struct Scheduler {
    id: i32,
    capacity: usize,
    fingerprint: Mutex<String>,
    ref_count: Mutex<usize>,
    jobs: mpsc::UnboundedSender<Job>,
    quit: Arc<Notify>,
    engine: Arc<EngineStatus>,
    thread_id: ThreadId,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
    started: Mutex<Option<oneshot::Receiver<Result<(), BridgeError>>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Scheduler {
    /// Starts the scheduler thread. The engine is launched on that thread;
    /// use [`Scheduler::wait_started`] to learn whether it came up.
    pub fn spawn(spec: SchedulerSpec) -> Result<Arc<Self>, SchedulerError> {
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let (started_tx, started_rx) = oneshot::channel();
        let quit = Arc::new(Notify::new());
        let engine = Arc::new(EngineStatus::default());

        let id = spec.id;
        let thread = {
            let quit = quit.clone();
            let engine = engine.clone();
            let spec = spec.clone();
            std::thread::Builder::new()
                .name(format!("scheduler-{id}"))
                .spawn(move || run_thread(spec, jobs_rx, quit, engine, started_tx))
                .map_err(|e| SchedulerError::ThreadSpawn(e.to_string()))?
        };

        info!(
            "🧵 Scheduler {} started (capacity {} rooms)",
            id, spec.capacity
        );

        Ok(Arc::new(Self {
            id,
            capacity: spec.capacity,
            fingerprint: Mutex::new(spec.fingerprint),
            ref_count: Mutex::new(0),
            jobs: jobs_tx,
            quit,
            engine,
            thread_id: thread.thread().id(),
            thread: Mutex::new(Some(thread)),
            started: Mutex::new(Some(started_rx)),
        }))
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Waits until the engine has completed its handshake.
    pub async fn wait_started(&self, limit: Duration) -> Result<(), SchedulerError> {
        let receiver = lock(&self.started).take();
        let Some(receiver) = receiver else {
            return if self.engine.failed.load(Ordering::Acquire) {
                Err(SchedulerError::LoopGone(self.id))
            } else {
                Ok(())
            };
        };

        match tokio::time::timeout(limit, receiver).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(SchedulerError::Bridge(e)),
            Ok(Err(_)) => Err(SchedulerError::LoopGone(self.id)),
            Err(_) => {
                self.engine.failed.store(true, Ordering::Release);
                self.mark_outdated();
                Err(SchedulerError::StartupTimeout(self.id))
            }
        }
    }

    /// Whether the engine is up (or still starting).
    pub fn is_alive(&self) -> bool {
        self.engine.is_alive()
    }

    pub fn engine_pid(&self) -> Option<u32> {
        self.engine.pid.get().copied()
    }

    /// Runs `job` on the scheduler loop.
    ///
    /// On the scheduler's own thread the job runs immediately; elsewhere it is
    /// queued and runs in FIFO order relative to other jobs from the same
    /// sender. When the engine is gone the job is dropped and the scheduler
    /// is marked outdated.
    pub fn emit_signal<F>(&self, job: F)
    where
        F: FnOnce(&Rc<LoopContext>) + Send + 'static,
    {
        if !self.is_alive() {
            warn!("Scheduler {} engine is down, marking outdated", self.id);
            self.mark_outdated();
            return;
        }

        if std::thread::current().id() == self.thread_id {
            if let Some(ctx) = LoopContext::current() {
                job(&ctx);
                return;
            }
        }

        if self.jobs.send(Box::new(job)).is_err() {
            warn!("Scheduler {} loop is gone, job dropped", self.id);
        }
    }

    /// Forwards a client message to the room's game logic. `connection` is
    /// `-1` for room-level requests.
    pub fn push_request(&self, room_id: i32, connection: i32, command: Bytes, payload: Bytes) {
        self.emit_signal(move |ctx| {
            ctx.call(
                methods::HANDLE_REQUEST,
                vec![
                    RpcValue::from(room_id),
                    RpcValue::from(connection),
                    RpcValue::Bytes(command),
                    RpcValue::Bytes(payload),
                ],
            )
        });
    }

    pub fn delay(&self, room_id: i32, ms: u64) {
        self.emit_signal(move |ctx| ctx.delay(room_id, ms));
    }

    pub fn cancel_delay(&self, room_id: i32) {
        self.emit_signal(move |ctx| {
            ctx.cancel_delay(room_id);
        });
    }

    /// Wakes the room with reason `request_timer` after `ms` milliseconds.
    pub fn set_request_timer(&self, room_id: i32, ms: u64) {
        self.emit_signal(move |ctx| ctx.set_request_timer(room_id, ms));
    }

    pub fn destroy_request_timer(&self, room_id: i32) {
        self.emit_signal(move |ctx| {
            ctx.destroy_request_timer(room_id);
        });
    }

    pub fn wake_up(&self, room_id: i32, reason: &str) {
        let reason = reason.to_string();
        self.emit_signal(move |ctx| {
            ctx.call(
                methods::RESUME_ROOM,
                vec![RpcValue::from(room_id), RpcValue::Text(reason)],
            )
        });
    }

    pub fn set_player_state(&self, room_id: i32, player: i32, state: PlayerState) {
        self.emit_signal(move |ctx| {
            ctx.call(
                methods::SET_PLAYER_STATE,
                vec![
                    RpcValue::from(room_id),
                    RpcValue::from(player),
                    RpcValue::from(state.as_str()),
                ],
            )
        });
    }

    /// `player` is the observer's JSON description.
    pub fn add_observer(&self, room_id: i32, player: String) {
        self.emit_signal(move |ctx| {
            ctx.call(
                methods::ADD_OBSERVER,
                vec![RpcValue::from(room_id), RpcValue::Text(player)],
            )
        });
    }

    pub fn remove_observer(&self, room_id: i32, player: i32) {
        self.emit_signal(move |ctx| {
            ctx.call(
                methods::REMOVE_OBSERVER,
                vec![RpcValue::from(room_id), RpcValue::from(player)],
            )
        });
    }

    pub fn increase_ref_count(&self) -> usize {
        let mut count = lock(&self.ref_count);
        *count += 1;
        *count
    }

    /// Never goes below zero. Returns the new count; the caller decides
    /// whether a zero count means retirement.
    pub fn decrease_ref_count(&self) -> usize {
        let mut count = lock(&self.ref_count);
        *count = count.saturating_sub(1);
        *count
    }

    pub fn ref_count(&self) -> usize {
        *lock(&self.ref_count)
    }

    pub fn is_full(&self) -> bool {
        self.ref_count() >= self.capacity
    }

    /// Compares against the server's current fingerprint. A stale scheduler
    /// forgets its fingerprint, so it stays outdated from then on.
    pub fn is_outdated(&self, current: &str) -> bool {
        let mut fingerprint = lock(&self.fingerprint);
        if fingerprint.is_empty() {
            return true;
        }
        if *fingerprint != current {
            fingerprint.clear();
            return true;
        }
        false
    }

    pub fn mark_outdated(&self) {
        lock(&self.fingerprint).clear();
    }

    pub fn fingerprint(&self) -> String {
        lock(&self.fingerprint).clone()
    }

    /// Whether new rooms may be placed here.
    pub fn accepts_rooms(&self, current: &str) -> bool {
        self.is_alive() && !self.is_full() && !self.is_outdated(current)
    }

    /// Asks the loop to stop. Callable from any thread.
    pub fn quit(&self) {
        self.quit.notify_one();
    }

    /// Blocks until the thread has exited. Must not be called on the
    /// scheduler's own thread.
    pub fn join(&self) {
        let handle = lock(&self.thread).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("💥 Scheduler {} thread panicked", self.id);
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.quit.notify_one();
    }
}

fn run_thread(
    spec: SchedulerSpec,
    jobs: mpsc::UnboundedReceiver<Job>,
    quit: Arc<Notify>,
    engine: Arc<EngineStatus>,
    started: oneshot::Sender<Result<(), BridgeError>>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("❌ Scheduler {} could not build its runtime: {}", spec.id, e);
            engine.failed.store(true, Ordering::Release);
            let _ = started.send(Err(BridgeError::Io(e)));
            return;
        }
    };

    let local = tokio::task::LocalSet::new();
    local.block_on(&runtime, run_loop(spec, jobs, quit, engine, started));
}

async fn run_loop(
    spec: SchedulerSpec,
    mut jobs: mpsc::UnboundedReceiver<Job>,
    quit: Arc<Notify>,
    engine: Arc<EngineStatus>,
    started: oneshot::Sender<Result<(), BridgeError>>,
) {
    let id = spec.id;
    let on_engine_lost = spec.on_engine_lost;
    let bridge = match EngineBridge::spawn(&spec.engine, &spec.directory, spec.handlers).await {
        Ok(bridge) => bridge,
        Err(e) => {
            error!("❌ Scheduler {} engine failed to start: {}", id, e);
            engine.failed.store(true, Ordering::Release);
            let _ = started.send(Err(e));
            return;
        }
    };

    let _ = engine.alive.set(bridge.alive_flag());
    if let Some(pid) = bridge.pid() {
        let _ = engine.pid.set(pid);
    }
    info!("⚙️ Scheduler {} engine up (pid {:?})", id, bridge.pid());

    let engine_lost = bridge.lost();
    let ctx = LoopContext::new(id, bridge);
    ctx.install();
    let _ = started.send(Ok(()));

    let mut reported = false;
    loop {
        tokio::select! {
            biased;
            _ = quit.notified() => break,
            _ = engine_lost.cancelled(), if !reported => {
                reported = true;
                error!("💥 Scheduler {} engine exited while hosting rooms", id);
                engine.failed.store(true, Ordering::Release);
                if let Some(on_engine_lost) = &on_engine_lost {
                    on_engine_lost(id);
                }
            }
            job = jobs.recv() => match job {
                Some(job) => job(&ctx),
                None => break,
            },
        }
    }

    // Jobs queued before quit still run.
    while let Ok(job) = jobs.try_recv() {
        job(&ctx);
    }

    debug!("Scheduler {} loop stopping", id);
    ctx.shutdown().await;
    LoopContext::uninstall();
    info!("🛑 Scheduler {} retired", id);
}
