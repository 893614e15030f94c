// ---------------------------------------------------------------------------
// Coalescing per-key save queue
// ---------------------------------------------------------------------------
//
//   request_save(k) ─┐
//   request_save(k) ─┼─► one debounce timer per key ─► one flush thread per key
//   request_save(k) ─┘          (timer thread)             (save_fn(k))
//
// Per key the queue runs a small state machine:
//
//   Idle ──request──► Debouncing ──timer──► Saving ──done──► Idle (resolve waiters)
//                                             │ ▲
//                                      request│ │timer
//                                             ▼ │
//                               SavingDirty ──done──► CoolingDown
//
// Requests never restart an armed timer, so the worst-case latency is one
// delay interval. A request that lands while a write is in flight cannot be
// folded into that write, so it earns exactly one follow-up flush, started a
// cooldown after the current one finishes. Different keys share nothing but
// the state map; their flushes run on separate threads and overlap freely.
//
// All transitions happen under one mutex that is never held across the save
// function, so a flush is only started by the timer thread after it observed
// `Debouncing`/`CoolingDown` and switched the key to `Saving`.

use std::any::Any;
use std::cmp::Ordering as CmpOrdering;
use std::collections::hash_map::Entry;
use std::collections::{BinaryHeap, HashMap};
use std::fmt::Debug;
use std::hash::Hash;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender, TryRecvError, sync_channel};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::Serialize;
use worldsave_core::{Counter, LockLevel, OrderedMutex, global_metrics};

use crate::{Result, StorageError};

/// Per-key save function supplied by the owner of the in-memory state.
///
/// It must read the *current* state for the key when called; the queue may
/// call it long after the request that scheduled it.
pub type SaveFn<K> = dyn Fn(&K) -> Result<()> + Send + Sync;

/// Receives every failed flush. The default logs a warning.
pub type ErrorSink<K> = dyn Fn(&K, &StorageError) + Send + Sync;

/// Scheduling phase of one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
    /// No timer armed, no write in flight.
    Idle,
    /// Debounce timer armed.
    Debouncing,
    /// Write in flight, nothing requested since it started.
    Saving,
    /// Write in flight and at least one request arrived after it started.
    SavingDirty,
    /// Waiting out the cooldown before the follow-up flush.
    CoolingDown,
}

// ---------------------------------------------------------------------------
// Completion handles
// ---------------------------------------------------------------------------

/// Completion handle returned by [`SaveQueue::request_save`].
///
/// Resolves when a flush that started after the request has finished, whether
/// the save succeeded or its failure was handed to the error sink. It also
/// resolves if the queue shuts down before flushing the key.
#[derive(Debug)]
pub struct SaveTicket {
    rx: Receiver<()>,
}

impl SaveTicket {
    fn pair() -> (SyncSender<()>, Self) {
        let (tx, rx) = sync_channel(1);
        (tx, Self { rx })
    }

    /// Block until the ticket resolves.
    pub fn wait(self) {
        // Disconnected means the waiter was released without a signal.
        let _ = self.rx.recv();
    }

    /// Block for at most `timeout`. Returns `true` once resolved.
    #[must_use]
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        !matches!(self.rx.recv_timeout(timeout), Err(RecvTimeoutError::Timeout))
    }

    /// Non-blocking check.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        !matches!(self.rx.try_recv(), Err(TryRecvError::Empty))
    }
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct QueueCounters {
    requests: Counter,
    coalesced: Counter,
    flushes: Counter,
    followup_flushes: Counter,
    errors: Counter,
}

/// Snapshot of one queue's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SaveQueueStats {
    pub requests: u64,
    /// Requests absorbed by an armed timer or an in-flight write.
    pub coalesced: u64,
    pub flushes: u64,
    /// Flushes owed to requests that arrived mid-write.
    pub followup_flushes: u64,
    pub errors: u64,
    /// Keys currently not idle.
    pub active_keys: usize,
}

// ---------------------------------------------------------------------------
// Scheduler state
// ---------------------------------------------------------------------------

struct KeyState {
    phase: Phase,
    waiters: Vec<SyncSender<()>>,
}

struct TimerEntry<K> {
    deadline: Instant,
    seq: u64,
    key: K,
}

impl<K> PartialEq for TimerEntry<K> {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl<K> Eq for TimerEntry<K> {}

impl<K> PartialOrd for TimerEntry<K> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl<K> Ord for TimerEntry<K> {
    // Reversed so the max-heap pops the earliest deadline first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Sched<K> {
    keys: HashMap<K, KeyState>,
    timers: BinaryHeap<TimerEntry<K>>,
    next_seq: u64,
    shutdown: bool,
}

impl<K> Sched<K> {
    fn arm(&mut self, key: K, deadline: Instant) {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        self.timers.push(TimerEntry { deadline, seq, key });
    }
}

struct Inner<K> {
    name: String,
    delay: Duration,
    cooldown: Duration,
    save_fn: Box<SaveFn<K>>,
    on_error: Box<ErrorSink<K>>,
    sched: Mutex<Sched<K>>,
    /// Wakes the timer thread when a timer is armed or the queue shuts down.
    timer_cv: Condvar,
    /// Notified whenever a key returns to idle.
    idle_cv: Condvar,
    counters: QueueCounters,
}

impl<K> Inner<K>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    fn lock(&self) -> MutexGuard<'_, Sched<K>> {
        self.sched.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolve (or release) every waiter of `key` and forget its state.
    fn finish_cycle(&self, sched: &mut Sched<K>, key: &K) {
        if let Some(state) = sched.keys.remove(key) {
            for waiter in state.waiters {
                let _ = waiter.try_send(());
            }
            global_metrics().storage.active_keys.sub(1);
            self.idle_cv.notify_all();
        }
    }
}

// ---------------------------------------------------------------------------
// SaveQueue
// ---------------------------------------------------------------------------

/// Debounced, coalescing, per-key single-flight save scheduler.
pub struct SaveQueue<K>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    inner: Arc<Inner<K>>,
    timer_handle: OrderedMutex<Option<JoinHandle<()>>>,
}

/// Builder for [`SaveQueue`].
pub struct SaveQueueBuilder<K> {
    name: String,
    delay: Duration,
    cooldown: Option<Duration>,
    save_fn: Box<SaveFn<K>>,
    on_error: Option<Box<ErrorSink<K>>>,
}

impl<K> SaveQueueBuilder<K>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    /// Label used in thread names and log lines.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Pause between consecutive flushes of one key. Defaults to the delay.
    #[must_use]
    pub const fn cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = Some(cooldown);
        self
    }

    #[must_use]
    pub fn on_error<F>(mut self, on_error: F) -> Self
    where
        F: Fn(&K, &StorageError) + Send + Sync + 'static,
    {
        self.on_error = Some(Box::new(on_error));
        self
    }

    /// Spawn the timer thread and return the queue.
    pub fn build(self) -> Result<SaveQueue<K>> {
        let name = self.name;
        let on_error = self.on_error.unwrap_or_else(|| {
            let queue = name.clone();
            let sink: Box<ErrorSink<K>> = Box::new(move |key: &K, err: &StorageError| {
                tracing::warn!(queue = %queue, key = ?key, "[save-queue] save failed: {err}");
            });
            sink
        });

        let inner = Arc::new(Inner {
            name: name.clone(),
            delay: self.delay,
            cooldown: self.cooldown.unwrap_or(self.delay),
            save_fn: self.save_fn,
            on_error,
            sched: Mutex::new(Sched {
                keys: HashMap::new(),
                timers: BinaryHeap::new(),
                next_seq: 0,
                shutdown: false,
            }),
            timer_cv: Condvar::new(),
            idle_cv: Condvar::new(),
            counters: QueueCounters::default(),
        });

        let worker = Arc::clone(&inner);
        let handle = std::thread::Builder::new()
            .name(format!("save-queue-{name}"))
            .spawn(move || timer_loop(&worker))?;

        Ok(SaveQueue {
            inner,
            timer_handle: OrderedMutex::new(LockLevel::StorageSaveQueueTimerHandle, Some(handle)),
        })
    }
}

impl<K> SaveQueue<K>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    pub fn builder<F>(delay: Duration, save_fn: F) -> SaveQueueBuilder<K>
    where
        F: Fn(&K) -> Result<()> + Send + Sync + 'static,
    {
        SaveQueueBuilder {
            name: "default".to_string(),
            delay,
            cooldown: None,
            save_fn: Box::new(save_fn),
            on_error: None,
        }
    }

    /// Queue with the default cooldown (= `delay`) and logging error sink.
    pub fn new<F>(delay: Duration, save_fn: F) -> Result<Self>
    where
        F: Fn(&K) -> Result<()> + Send + Sync + 'static,
    {
        Self::builder(delay, save_fn).build()
    }

    /// Ask for `key` to be persisted.
    ///
    /// Never fails: save errors reach the error sink, not the caller.
    pub fn request_save(&self, key: K) -> SaveTicket {
        let (tx, ticket) = SaveTicket::pair();
        let inner = &self.inner;
        let metrics = &global_metrics().storage;
        inner.counters.requests.inc();
        metrics.save_requests_total.inc();

        let mut sched = inner.lock();
        if sched.shutdown {
            tracing::debug!(queue = %inner.name, key = ?key, "save requested after shutdown");
            // Dropping `tx` resolves the ticket immediately.
            return ticket;
        }

        let mut armed = false;
        match sched.keys.entry(key.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(KeyState {
                    phase: Phase::Debouncing,
                    waiters: vec![tx],
                });
                armed = true;
            }
            Entry::Occupied(mut slot) => {
                let state = slot.get_mut();
                if state.phase == Phase::Saving {
                    state.phase = Phase::SavingDirty;
                }
                state.waiters.push(tx);
                inner.counters.coalesced.inc();
                metrics.save_requests_coalesced_total.inc();
            }
        }

        if armed {
            sched.arm(key, Instant::now() + inner.delay);
            metrics.active_keys.add(1);
            metrics.peak_active_keys.fetch_max(metrics.active_keys.load());
            drop(sched);
            inner.timer_cv.notify_one();
        }
        ticket
    }

    /// Current phase of `key` (`Idle` when the queue holds no state for it).
    #[must_use]
    pub fn phase(&self, key: &K) -> Phase {
        self.inner
            .lock()
            .keys
            .get(key)
            .map_or(Phase::Idle, |s| s.phase)
    }

    /// Number of keys with an armed timer or a write in flight.
    #[must_use]
    pub fn active_keys(&self) -> usize {
        self.inner.lock().keys.len()
    }

    #[must_use]
    pub fn stats(&self) -> SaveQueueStats {
        let c = &self.inner.counters;
        SaveQueueStats {
            requests: c.requests.load(),
            coalesced: c.coalesced.load(),
            flushes: c.flushes.load(),
            followup_flushes: c.followup_flushes.load(),
            errors: c.errors.load(),
            active_keys: self.active_keys(),
        }
    }

    /// Fire every debounce timer now and wait until all keys are idle.
    ///
    /// Cooldown timers are never shortened: consecutive writes of one key stay
    /// at least a cooldown apart. Returns `false` if `timeout` elapsed first.
    pub fn flush_pending(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let inner = &self.inner;
        let mut sched = inner.lock();

        let now = Instant::now();
        let armed: Vec<_> = sched.timers.drain().collect();
        for mut entry in armed {
            let debouncing = sched
                .keys
                .get(&entry.key)
                .is_some_and(|s| s.phase == Phase::Debouncing);
            if debouncing {
                entry.deadline = entry.deadline.min(now);
            }
            sched.timers.push(entry);
        }
        inner.timer_cv.notify_one();

        while !sched.keys.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            sched = inner
                .idle_cv
                .wait_timeout(sched, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    /// Stop the timer thread.
    ///
    /// Keys still debouncing or cooling down are abandoned without a write and
    /// their waiters released. Writes already in flight run to completion.
    /// Idempotent.
    pub fn shutdown(&self) {
        let inner = &self.inner;
        {
            let mut sched = inner.lock();
            if !sched.shutdown {
                sched.shutdown = true;
                sched.timers.clear();
                let pending: Vec<K> = sched
                    .keys
                    .iter()
                    .filter(|(_, s)| matches!(s.phase, Phase::Debouncing | Phase::CoolingDown))
                    .map(|(k, _)| k.clone())
                    .collect();
                if !pending.is_empty() {
                    tracing::debug!(
                        queue = %inner.name,
                        abandoned = pending.len(),
                        "save queue shut down with pending keys"
                    );
                }
                for key in &pending {
                    inner.finish_cycle(&mut sched, key);
                }
            }
        }
        inner.timer_cv.notify_all();

        let handle = self.timer_handle.lock().take();
        if let Some(h) = handle {
            let _ = h.join();
        }
    }
}

impl<K> Drop for SaveQueue<K>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ---------------------------------------------------------------------------
// Timer + flush workers
// ---------------------------------------------------------------------------

fn timer_loop<K>(inner: &Arc<Inner<K>>)
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    let mut sched = inner.lock();
    loop {
        if sched.shutdown {
            break;
        }
        let now = Instant::now();
        let next_deadline = sched.timers.peek().map(|t| t.deadline);
        match next_deadline {
            None => {
                sched = inner
                    .timer_cv
                    .wait(sched)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            Some(deadline) if deadline > now => {
                sched = inner
                    .timer_cv
                    .wait_timeout(sched, deadline - now)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
            }
            Some(_) => {
                let Some(entry) = sched.timers.pop() else {
                    continue;
                };
                let Some(followup) = begin_flush(&mut sched, &entry.key) else {
                    continue;
                };
                drop(sched);
                spawn_flush(inner, entry.key, followup);
                sched = inner.lock();
            }
        }
    }
}

/// Move `key` into `Saving` if its timer is still relevant.
///
/// Returns whether this is a follow-up flush, or `None` for a stale timer.
fn begin_flush<K>(sched: &mut Sched<K>, key: &K) -> Option<bool>
where
    K: Eq + Hash + Debug,
{
    let state = sched.keys.get_mut(key)?;
    let followup = match state.phase {
        Phase::Debouncing => false,
        Phase::CoolingDown => true,
        other => {
            tracing::debug!(key = ?key, phase = ?other, "ignoring stale save timer");
            return None;
        }
    };
    state.phase = Phase::Saving;
    Some(followup)
}

fn spawn_flush<K>(inner: &Arc<Inner<K>>, key: K, followup: bool)
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    let worker = Arc::clone(inner);
    // The key is needed again if the spawn fails.
    let fallback_key = key.clone();
    let spawned = std::thread::Builder::new()
        .name(format!("save-flush-{}", inner.name))
        .spawn(move || run_flush(&worker, key, followup));
    if let Err(e) = spawned {
        tracing::warn!(
            queue = %inner.name,
            "[save-queue] could not spawn flush thread, flushing inline: {e}"
        );
        run_flush(inner, fallback_key, followup);
    }
}

fn run_flush<K>(inner: &Arc<Inner<K>>, key: K, followup: bool)
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    let metrics = &global_metrics().storage;
    inner.counters.flushes.inc();
    metrics.flushes_total.inc();
    if followup {
        inner.counters.followup_flushes.inc();
        metrics.followup_flushes_total.inc();
    }

    let started = Instant::now();
    let outcome = catch_unwind(AssertUnwindSafe(|| (inner.save_fn)(&key)))
        .unwrap_or_else(|payload| Err(StorageError::SavePanicked(panic_message(&*payload))));
    tracing::debug!(
        queue = %inner.name,
        key = ?key,
        followup,
        ok = outcome.is_ok(),
        elapsed_us = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX),
        "flush finished"
    );

    if let Err(err) = outcome {
        inner.counters.errors.inc();
        metrics.save_errors_total.inc();
        let sink = catch_unwind(AssertUnwindSafe(|| (inner.on_error)(&key, &err)));
        if sink.is_err() {
            tracing::warn!(queue = %inner.name, key = ?key, "[save-queue] error sink panicked");
        }
    }

    complete_flush(inner, &key);
}

fn complete_flush<K>(inner: &Inner<K>, key: &K)
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    let mut sched = inner.lock();
    let phase = sched.keys.get(key).map(|s| s.phase);
    match phase {
        Some(Phase::SavingDirty) if !sched.shutdown => {
            if let Some(state) = sched.keys.get_mut(key) {
                state.phase = Phase::CoolingDown;
            }
            sched.arm(key.clone(), Instant::now() + inner.cooldown);
            drop(sched);
            inner.timer_cv.notify_one();
        }
        Some(Phase::Saving | Phase::SavingDirty) => inner.finish_cycle(&mut sched, key),
        other => {
            tracing::warn!(key = ?key, phase = ?other, "flush completed for key in unexpected phase");
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}
