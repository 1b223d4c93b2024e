//! The set of live schedulers. Owned by the main loop.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::engine::HandlerTable;
use crate::error::SchedulerError;
use crate::scheduler::{EngineLost, Scheduler, SchedulerSpec};

/// Scheduler ids start here.
pub const FIRST_SCHEDULER_ID: i32 = 1000;

pub struct SchedulerPool {
    schedulers: BTreeMap<i32, Arc<Scheduler>>,
    next_id: i32,
    engine: EngineConfig,
    handlers: HandlerTable,
    engine_lost: Option<EngineLost>,
    retiring: Vec<JoinHandle<()>>,
}

impl SchedulerPool {
    pub fn new(engine: EngineConfig, handlers: HandlerTable) -> Self {
        Self {
            schedulers: BTreeMap::new(),
            next_id: FIRST_SCHEDULER_ID,
            engine,
            handlers,
            engine_lost: None,
            retiring: Vec::new(),
        }
    }

    /// Every scheduler spawned from now on reports a dead engine to
    /// `callback`.
    pub fn with_engine_lost(mut self, callback: EngineLost) -> Self {
        self.engine_lost = Some(callback);
        self
    }

    pub fn engine_config(&self) -> &EngineConfig {
        &self.engine
    }

    /// Returns a scheduler with room to spare for the current bundle,
    /// spawning a new one when none qualifies. The flag tells whether the
    /// scheduler was freshly spawned.
    pub fn acquire(
        &mut self,
        fingerprint: &str,
        directory: &Path,
        capacity: usize,
    ) -> Result<(Arc<Scheduler>, bool), SchedulerError> {
        if let Some(scheduler) = self
            .schedulers
            .values()
            .find(|scheduler| scheduler.accepts_rooms(fingerprint))
        {
            return Ok((scheduler.clone(), false));
        }

        let id = self.next_id;
        self.next_id += 1;
        let scheduler = Scheduler::spawn(SchedulerSpec {
            id,
            capacity,
            fingerprint: fingerprint.to_string(),
            engine: self.engine.clone(),
            directory: directory.to_path_buf(),
            handlers: self.handlers.clone(),
            on_engine_lost: self.engine_lost.clone(),
        })?;
        self.schedulers.insert(id, scheduler.clone());
        Ok((scheduler, true))
    }

    pub fn get(&self, id: i32) -> Option<Arc<Scheduler>> {
        self.schedulers.get(&id).cloned()
    }

    pub fn contains(&self, id: i32) -> bool {
        self.schedulers.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.schedulers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schedulers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Scheduler>> {
        self.schedulers.values()
    }

    /// Removes a scheduler and stops its thread in the background.
    pub fn retire(&mut self, id: i32) {
        let Some(scheduler) = self.schedulers.remove(&id) else {
            return;
        };
        info!(
            "♻️ Retiring scheduler {} ({} rooms left)",
            id,
            scheduler.ref_count()
        );
        scheduler.quit();
        self.forget_joined();
        self.retiring
            .push(tokio::task::spawn_blocking(move || scheduler.join()));
    }

    fn forget_joined(&mut self) {
        self.retiring.retain(|handle| !handle.is_finished());
    }

    /// Retires every outdated scheduler without rooms and returns the
    /// outdated ones that still host rooms.
    pub fn sweep(&mut self, fingerprint: &str) -> Vec<Arc<Scheduler>> {
        self.forget_joined();
        let mut idle = Vec::new();
        let mut draining = Vec::new();
        for (id, scheduler) in &self.schedulers {
            if scheduler.is_outdated(fingerprint) {
                if scheduler.ref_count() == 0 {
                    idle.push(*id);
                } else {
                    draining.push(scheduler.clone());
                }
            }
        }
        for id in idle {
            self.retire(id);
        }
        draining
    }

    /// Waits for every retired thread to be joined.
    pub async fn wait_retired(&mut self) {
        for handle in self.retiring.drain(..) {
            if let Err(e) = handle.await {
                warn!("Scheduler join task failed: {}", e);
            }
        }
    }

    /// Retires everything and waits for the threads.
    pub async fn shutdown(&mut self) {
        let ids: Vec<i32> = self.schedulers.keys().copied().collect();
        for id in ids {
            self.retire(id);
        }
        self.wait_retired().await;
    }
}
