//! In-memory set of live jobs. Every entry is driven by its own tokio task
//! that sleeps until the trigger's next fire time and then hands the task to
//! the [`Executor`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use foadmin_core::config::{OverlapPolicy, PastDuePolicy};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, SchedulerError};
use crate::executor::{ExecutionOutcome, Executor};
use crate::resolver::{TaskArgs, TaskRef};
use crate::trigger::{ArmedTrigger, Trigger};

const EVENT_CAPACITY: usize = 256;

/// Emitted once per fire, after the execution has been recorded (or failed
/// to be).
#[derive(Debug, Clone)]
pub enum FireEvent {
    Executed {
        job_id: String,
        scheduled_for: DateTime<Utc>,
        outcome: ExecutionOutcome,
    },
    PersistenceFailed {
        job_id: String,
        scheduled_for: DateTime<Utc>,
        error: String,
    },
}

#[derive(Debug, Default, Clone, Copy)]
struct Times {
    next: Option<DateTime<Utc>>,
    last_fired: Option<DateTime<Utc>>,
}

/// Everything a driver needs, shared with the table so queries see live
/// state.
struct Live {
    job_id: String,
    name: String,
    task: TaskRef,
    args: TaskArgs,
    trigger: ArmedTrigger,
    paused: watch::Sender<bool>,
    times: Mutex<Times>,
}

impl Live {
    fn times(&self) -> Times {
        *self.times.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_next(&self, next: Option<DateTime<Utc>>) {
        self.times.lock().unwrap_or_else(|p| p.into_inner()).next = next;
    }

    fn mark_fired(&self, at: DateTime<Utc>) {
        let mut times = self.times.lock().unwrap_or_else(|p| p.into_inner());
        times.last_fired = Some(at);
        times.next = None;
    }

    fn compute_next(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.trigger.next_fire_time(self.times().last_fired, now)
    }
}

struct Entry {
    live: Arc<Live>,
    /// `None` while the registry is stopped.
    driver: Option<CancellationToken>,
}

impl Entry {
    fn cancel(&self) {
        if let Some(token) = &self.driver {
            token.cancel();
        }
    }
}

/// The live schedule. Construct one per process and share it behind `Arc`.
pub struct JobRegistry {
    tz: Tz,
    past_due: PastDuePolicy,
    executor: Executor,
    entries: Arc<DashMap<String, Entry>>,
    root: Mutex<CancellationToken>,
    running: AtomicBool,
    events: broadcast::Sender<FireEvent>,
}

impl JobRegistry {
    pub fn new(tz: Tz, past_due: PastDuePolicy, executor: Executor) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            tz,
            past_due,
            executor,
            entries: Arc::new(DashMap::new()),
            root: Mutex::new(CancellationToken::new()),
            running: AtomicBool::new(false),
            events,
        }
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start drivers for every stored entry. Returns `false` if already
    /// running.
    pub fn start(&self) -> bool {
        {
            let mut root = self.root.lock().unwrap_or_else(|p| p.into_inner());
            if self.running.load(Ordering::SeqCst) {
                return false;
            }
            *root = CancellationToken::new();
            self.running.store(true, Ordering::SeqCst);
        }

        let mut spawned = 0usize;
        for mut entry in self.entries.iter_mut() {
            if entry.driver.is_none() {
                let token = self.spawn_driver(Arc::clone(&entry.live));
                entry.driver = Some(token);
                spawned += 1;
            }
        }
        info!(jobs = spawned, "job registry started");
        true
    }

    /// Cancel every driver and drop all entries. Executions already in
    /// progress run to completion on their own. Returns `false` if not running.
    pub fn shutdown(&self) -> bool {
        {
            let root = self.root.lock().unwrap_or_else(|p| p.into_inner());
            if !self.running.swap(false, Ordering::SeqCst) {
                return false;
            }
            root.cancel();
        }
        let dropped = self.entries.len();
        self.entries.clear();
        info!(jobs = dropped, "job registry shut down");
        true
    }

    /// Register `task` under `job_id`, replacing any existing entry.
    ///
    /// The old driver is cancelled and the new one installed while the
    /// table's entry lock is held. Returns the first fire time; `None`
    /// means the trigger will never fire and nothing was registered.
    pub fn add_or_replace(
        &self,
        job_id: &str,
        name: &str,
        task: TaskRef,
        trigger: Trigger,
        args: TaskArgs,
    ) -> Option<DateTime<Utc>> {
        let now = Utc::now();
        let description = trigger.to_string();
        let armed = ArmedTrigger::new(trigger, now, self.tz, self.past_due);
        let Some(next) = armed.next_fire_time(None, now) else {
            if let Some((_, old)) = self.entries.remove(job_id) {
                old.cancel();
            }
            warn!(%job_id, trigger = %description, "trigger has no future fire time, not registered");
            return None;
        };

        let (paused, _) = watch::channel(false);
        let live = Arc::new(Live {
            job_id: job_id.to_string(),
            name: name.to_string(),
            task,
            args,
            trigger: armed,
            paused,
            times: Mutex::new(Times {
                next: Some(next),
                last_fired: None,
            }),
        });

        match self.entries.entry(job_id.to_string()) {
            MapEntry::Occupied(mut slot) => {
                slot.get().cancel();
                let driver = self.driver_if_running(&live);
                slot.insert(Entry { live, driver });
                info!(%job_id, trigger = %description, next_run = %next, "job replaced");
            }
            MapEntry::Vacant(slot) => {
                let driver = self.driver_if_running(&live);
                slot.insert(Entry { live, driver });
                info!(%job_id, trigger = %description, next_run = %next, "job added");
            }
        }
        Some(next)
    }

    /// Remove `job_id`. Returns whether it was live.
    pub fn remove(&self, job_id: &str) -> bool {
        match self.entries.remove(job_id) {
            Some((_, entry)) => {
                entry.cancel();
                info!(%job_id, "job removed from registry");
                true
            }
            None => false,
        }
    }

    /// Stop firing `job_id` until resumed.
    pub fn pause(&self, job_id: &str) -> Result<()> {
        let entry = self
            .entries
            .get(job_id)
            .ok_or_else(|| SchedulerError::not_found(job_id))?;
        entry.live.paused.send_replace(true);
        entry.live.set_next(None);
        info!(%job_id, "job paused");
        Ok(())
    }

    /// Reinstate firing. The next fire time is computed from now.
    pub fn resume(&self, job_id: &str) -> Result<Option<DateTime<Utc>>> {
        let entry = self
            .entries
            .get(job_id)
            .ok_or_else(|| SchedulerError::not_found(job_id))?;
        let next = entry.live.compute_next(Utc::now());
        entry.live.set_next(next);
        entry.live.paused.send_replace(false);
        info!(%job_id, next_run = ?next, "job resumed");
        Ok(next)
    }

    pub fn next_run_time(&self, job_id: &str) -> Option<DateTime<Utc>> {
        self.entries.get(job_id).and_then(|e| e.live.times().next)
    }

    pub fn is_paused(&self, job_id: &str) -> Option<bool> {
        self.entries.get(job_id).map(|e| *e.live.paused.borrow())
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.entries.contains_key(job_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Live job ids, sorted.
    pub fn job_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FireEvent> {
        self.events.subscribe()
    }

    fn driver_if_running(&self, live: &Arc<Live>) -> Option<CancellationToken> {
        self.is_running()
            .then(|| self.spawn_driver(Arc::clone(live)))
    }

    fn spawn_driver(&self, live: Arc<Live>) -> CancellationToken {
        let token = self
            .root
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .child_token();
        tokio::spawn(drive(
            live,
            self.executor.clone(),
            self.events.clone(),
            Arc::clone(&self.entries),
            token.clone(),
        ));
        token
    }
}

/// Driver loop for one entry.
async fn drive(
    live: Arc<Live>,
    executor: Executor,
    events: broadcast::Sender<FireEvent>,
    entries: Arc<DashMap<String, Entry>>,
    cancel: CancellationToken,
) {
    let job_id = live.job_id.clone();
    let mut paused = live.paused.subscribe();
    debug!(%job_id, "driver started");

    loop {
        if cancel.is_cancelled() {
            break;
        }

        if *paused.borrow_and_update() {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = paused.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            }
        }

        let now = Utc::now();
        let Some(next) = live.compute_next(now) else {
            live.set_next(None);
            // Only drop the entry if it has not been replaced meanwhile.
            entries.remove_if(&job_id, |_, e| Arc::ptr_eq(&e.live, &live));
            info!(%job_id, "trigger exhausted, job retired from registry");
            break;
        };
        live.set_next(Some(next));

        let wait = (next - now).to_std().unwrap_or_default();
        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = paused.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            _ = tokio::time::sleep(wait) => {}
        }

        live.mark_fired(next);
        match executor.overlap() {
            // Fires that fall due meanwhile are coalesced into the next
            // computation, which starts from the current time.
            OverlapPolicy::Serialize => fire(&live, &executor, &events, next).await,
            OverlapPolicy::Allow => {
                let (live, executor, events) = (Arc::clone(&live), executor.clone(), events.clone());
                tokio::spawn(async move { fire(&live, &executor, &events, next).await });
            }
        }
    }
    debug!(%job_id, "driver stopped");
}

async fn fire(
    live: &Live,
    executor: &Executor,
    events: &broadcast::Sender<FireEvent>,
    scheduled_for: DateTime<Utc>,
) {
    let result = executor
        .execute(
            &live.job_id,
            &live.name,
            Arc::clone(&live.task),
            live.args.clone(),
        )
        .await;
    let event = match result {
        Ok(outcome) => FireEvent::Executed {
            job_id: live.job_id.clone(),
            scheduled_for,
            outcome,
        },
        Err(e) => FireEvent::PersistenceFailed {
            job_id: live.job_id.clone(),
            scheduled_for,
            error: e.to_string(),
        },
    };
    // No subscribers is fine.
    let _ = events.send(event);
}
