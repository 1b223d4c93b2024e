//! Per-thread state of a running scheduler loop.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::engine::{methods, EngineBridge};
use crate::protocol::rpc::RpcValue;

thread_local! {
    static CURRENT: RefCell<Option<Rc<LoopContext>>> = const { RefCell::new(None) };
}

/// Everything a scheduler thread owns: its engine bridge and its room timers
/// (one delay and one request deadline per room).
///
/// Lives only on the scheduler thread. Code running there (queued jobs, RPC
/// handlers) reaches it through [`LoopContext::current`].
pub struct LoopContext {
    scheduler_id: i32,
    bridge: RefCell<Option<EngineBridge>>,
    delays: RefCell<HashMap<i32, JoinHandle<()>>>,
    request_timers: RefCell<HashMap<i32, JoinHandle<()>>>,
}

#[derive(Debug, Clone, Copy)]
enum TimerKind {
    Delay,
    Request,
}

impl TimerKind {
    fn reason(self) -> &'static str {
        match self {
            TimerKind::Delay => "delay_done",
            TimerKind::Request => "request_timer",
        }
    }
}

impl LoopContext {
    pub(crate) fn new(scheduler_id: i32, bridge: EngineBridge) -> Rc<Self> {
        Rc::new(Self {
            scheduler_id,
            bridge: RefCell::new(Some(bridge)),
            delays: RefCell::new(HashMap::new()),
            request_timers: RefCell::new(HashMap::new()),
        })
    }

    /// The context of the scheduler running on this thread, if any.
    pub fn current() -> Option<Rc<LoopContext>> {
        CURRENT.with(|current| current.borrow().clone())
    }

    pub(crate) fn install(self: &Rc<Self>) {
        CURRENT.with(|current| *current.borrow_mut() = Some(self.clone()));
    }

    pub(crate) fn uninstall() {
        CURRENT.with(|current| current.borrow_mut().take());
    }

    pub fn scheduler_id(&self) -> i32 {
        self.scheduler_id
    }

    /// One-way call into this thread's engine.
    pub fn call(&self, method: &str, params: Vec<RpcValue>) {
        match self.bridge.borrow().as_ref() {
            Some(bridge) => bridge.call(method, params),
            None => debug!(
                "Scheduler {} dropped '{}' after shutdown",
                self.scheduler_id, method
            ),
        }
    }

    /// Arms a one-shot timer that resumes `room_id` after `ms` milliseconds.
    /// Re-arming replaces the room's previous timer.
    pub fn delay(self: &Rc<Self>, room_id: i32, ms: u64) {
        self.arm(TimerKind::Delay, room_id, ms);
    }

    /// Cancels the room's pending timer. Returns whether one was armed.
    pub fn cancel_delay(&self, room_id: i32) -> bool {
        self.disarm(TimerKind::Delay, room_id)
    }

    /// Deadline for the player request the room is waiting on. Fires
    /// `ResumeRoom(room, "request_timer")`; independent of [`Self::delay`].
    pub fn set_request_timer(self: &Rc<Self>, room_id: i32, ms: u64) {
        self.arm(TimerKind::Request, room_id, ms);
    }

    pub fn destroy_request_timer(&self, room_id: i32) -> bool {
        self.disarm(TimerKind::Request, room_id)
    }

    pub fn pending_delays(&self) -> usize {
        self.delays.borrow().len()
    }

    pub fn pending_request_timers(&self) -> usize {
        self.request_timers.borrow().len()
    }

    fn timers(&self, kind: TimerKind) -> &RefCell<HashMap<i32, JoinHandle<()>>> {
        match kind {
            TimerKind::Delay => &self.delays,
            TimerKind::Request => &self.request_timers,
        }
    }

    fn arm(self: &Rc<Self>, kind: TimerKind, room_id: i32, ms: u64) {
        let weak: Weak<LoopContext> = Rc::downgrade(self);
        let timer = tokio::task::spawn_local(async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            if let Some(ctx) = weak.upgrade() {
                ctx.timers(kind).borrow_mut().remove(&room_id);
                trace!("Room {} {} after {}ms", room_id, kind.reason(), ms);
                ctx.call(
                    methods::RESUME_ROOM,
                    vec![RpcValue::from(room_id), RpcValue::from(kind.reason())],
                );
            }
        });

        if let Some(previous) = self.timers(kind).borrow_mut().insert(room_id, timer) {
            previous.abort();
        }
    }

    fn disarm(&self, kind: TimerKind, room_id: i32) -> bool {
        match self.timers(kind).borrow_mut().remove(&room_id) {
            Some(timer) => {
                timer.abort();
                true
            }
            None => false,
        }
    }

    pub fn engine_alive(&self) -> bool {
        self.bridge
            .borrow()
            .as_ref()
            .is_some_and(EngineBridge::is_alive)
    }

    /// Cancels every timer and stops the engine.
    pub(crate) async fn shutdown(&self) {
        for timers in [&self.delays, &self.request_timers] {
            for (_, timer) in timers.borrow_mut().drain() {
                timer.abort();
            }
        }
        let bridge = self.bridge.borrow_mut().take();
        if let Some(bridge) = bridge {
            bridge.shutdown().await;
        }
    }
}
