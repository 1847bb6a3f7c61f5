//! Timer subsystem.
//!
//! A [`TimerQueue`] holds one-shot callbacks keyed by [`TimerId`]. Entries
//! are bucketed on a timing wheel for cheap expiration and live in a slab
//! for O(1) cancellation. Cancellation is advisory: a callback that has
//! already been taken off the queue still runs, and its owner must
//! re-validate state before acting.
//!
//! The queue does not own a thread. Tests drive it with a [`ManualClock`]
//! and [`TimerQueue::run_expired`]; production code spawns a
//! [`TimerDriver`].

use std::num::NonZeroU64;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use slab::Slab;

/// Source of monotonic time in microseconds.
pub trait Clock: Send + Sync {
    fn now_us(&self) -> u64;
}

/// Wall-independent monotonic clock.
#[derive(Debug)]
pub struct MonotonicClock {
    start: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    #[inline]
    fn now_us(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move time forward by `us` microseconds.
    pub fn advance(&self, us: u64) {
        self.now.fetch_add(us, Ordering::SeqCst);
    }

    /// Jump to an absolute time. Time never moves backwards.
    pub fn set(&self, us: u64) {
        self.now.fetch_max(us, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    #[inline]
    fn now_us(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Handle of a scheduled timer. Never zero, so `Option<TimerId>` doubles as
/// the "not armed" state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(NonZeroU64);

impl TimerId {
    fn new(key: usize, generation: u32) -> Self {
        let raw = ((generation as u64) << 32) | (key as u64 + 1);
        // key + 1 is never zero
        Self(NonZeroU64::new(raw).unwrap_or(NonZeroU64::MIN))
    }

    #[inline]
    fn key(self) -> usize {
        ((self.0.get() & 0xffff_ffff) - 1) as usize
    }

    #[inline]
    fn generation(self) -> u32 {
        (self.0.get() >> 32) as u32
    }

    /// Raw value, for logging.
    #[inline]
    pub fn as_u64(self) -> u64 {
        self.0.get()
    }
}

/// Callback run when a timer expires. Receives its own id so the owner
/// can tell a current timer from a superseded one.
pub type TimerCallback = Box<dyn FnOnce(TimerId) + Send>;

/// Entry in the timing wheel.
#[derive(Debug, Clone, Copy)]
pub struct TimerEntry {
    pub id: TimerId,
    /// Expiration timestamp (microseconds).
    pub expires_at: u64,
}

/// Timing wheel.
///
/// Slot `current_slot + k` covers `[current_ts + k*d, current_ts + (k+1)*d)`
/// where `d` is the slot duration. Entries beyond one rotation park in the
/// last slot and are re-bucketed when that slot is drained.
pub struct TimingWheel {
    slots: Vec<Vec<TimerEntry>>,
    num_slots: usize,
    slot_duration_us: u64,
    current_slot: usize,
    /// Start of the current slot's window.
    current_ts: u64,
    wheel_duration_us: u64,
    /// Entries drained but not yet due.
    carry: Vec<TimerEntry>,
}

impl TimingWheel {
    /// Create a new timing wheel.
    ///
    /// # Arguments
    /// * `num_slots` - Number of slots in the wheel
    /// * `slot_duration_us` - Duration of each slot in microseconds
    pub fn new(num_slots: usize, slot_duration_us: u64) -> Self {
        let num_slots = num_slots.max(1);
        let slot_duration_us = slot_duration_us.max(1);
        Self {
            slots: (0..num_slots).map(|_| Vec::new()).collect(),
            num_slots,
            slot_duration_us,
            current_slot: 0,
            current_ts: 0,
            wheel_duration_us: num_slots as u64 * slot_duration_us,
            carry: Vec::new(),
        }
    }

    /// Wheel sized for management timeouts.
    ///
    /// Default: 1024 slots, 1ms per slot = 1.024s per rotation
    pub fn default_for_mads() -> Self {
        Self::new(1024, 1000)
    }

    /// Initialize the wheel with a starting timestamp.
    pub fn init(&mut self, ts: u64) {
        self.current_ts = ts;
        self.current_slot = 0;
    }

    /// Insert a timer entry. Entries already due land in the current slot
    /// and come out on the next advance.
    pub fn insert(&mut self, entry: TimerEntry) -> usize {
        let delta = entry.expires_at.saturating_sub(self.current_ts);
        let slots_ahead = if delta >= self.wheel_duration_us {
            self.num_slots - 1
        } else {
            (delta / self.slot_duration_us) as usize
        };
        let slot = (self.current_slot + slots_ahead) % self.num_slots;
        self.slots[slot].push(entry);
        slot
    }

    /// Advance the wheel to `now`, pushing due entries into `out`.
    ///
    /// The buffer is NOT cleared.
    pub fn advance_into(&mut self, now: u64, out: &mut Vec<TimerEntry>) {
        if now < self.current_ts {
            return;
        }

        let mut steps = 0;
        loop {
            for entry in self.slots[self.current_slot].drain(..) {
                if entry.expires_at <= now {
                    out.push(entry);
                } else {
                    self.carry.push(entry);
                }
            }
            if self.current_ts + self.slot_duration_us > now || steps == self.num_slots {
                break;
            }
            self.current_slot = (self.current_slot + 1) % self.num_slots;
            self.current_ts += self.slot_duration_us;
            steps += 1;
        }

        // A full rotation drained every slot; realign to the slot holding `now`.
        if self.current_ts + self.slot_duration_us <= now {
            let skip = (now - self.current_ts) / self.slot_duration_us;
            self.current_ts += skip * self.slot_duration_us;
            self.current_slot = (self.current_slot + (skip % self.num_slots as u64) as usize)
                % self.num_slots;
        }

        let carry = std::mem::take(&mut self.carry);
        for entry in &carry {
            self.insert(*entry);
        }
        self.carry = carry;
        self.carry.clear();
    }

    /// Advance the wheel, returning the due entries.
    pub fn advance(&mut self, now: u64) -> Vec<TimerEntry> {
        let mut expired = Vec::new();
        self.advance_into(now, &mut expired);
        expired
    }

    /// Number of entries on the wheel, including cancelled ones not yet
    /// drained.
    pub fn len(&self) -> usize {
        self.slots.iter().map(|s| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|s| s.is_empty())
    }

    #[inline]
    pub fn current_ts(&self) -> u64 {
        self.current_ts
    }

    #[inline]
    pub fn wheel_duration(&self) -> u64 {
        self.wheel_duration_us
    }
}

struct Pending {
    generation: u32,
    expires_at: u64,
    callback: TimerCallback,
}

struct QueueInner {
    wheel: TimingWheel,
    pending: Slab<Pending>,
    next_generation: u32,
    expired: Vec<TimerEntry>,
}

impl QueueInner {
    fn next_deadline(&self) -> Option<u64> {
        self.pending.iter().map(|(_, p)| p.expires_at).min()
    }
}

/// One-shot timer queue.
pub struct TimerQueue {
    clock: Arc<dyn Clock>,
    inner: Mutex<QueueInner>,
    wakeup: Condvar,
    terminate: AtomicBool,
}

impl TimerQueue {
    /// Create a queue on `clock` with the default wheel geometry.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_wheel(clock, TimingWheel::default_for_mads())
    }

    /// Create a queue on `clock` using `wheel`.
    pub fn with_wheel(clock: Arc<dyn Clock>, mut wheel: TimingWheel) -> Self {
        wheel.init(clock.now_us());
        Self {
            clock,
            inner: Mutex::new(QueueInner {
                wheel,
                pending: Slab::new(),
                next_generation: 0,
                expired: Vec::new(),
            }),
            wakeup: Condvar::new(),
            terminate: AtomicBool::new(false),
        }
    }

    /// The queue's clock.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Run `callback` once `delay_us` has elapsed.
    pub fn schedule(&self, delay_us: u64, callback: TimerCallback) -> TimerId {
        let expires_at = self.clock.now_us().saturating_add(delay_us);
        let mut inner = self.inner.lock();
        let generation = inner.next_generation;
        inner.next_generation = inner.next_generation.wrapping_add(1);
        let key = inner.pending.insert(Pending {
            generation,
            expires_at,
            callback,
        });
        let id = TimerId::new(key, generation);
        inner.wheel.insert(TimerEntry { id, expires_at });
        drop(inner);
        self.wakeup.notify_one();
        id
    }

    /// Cancel a pending timer. Returns false if it already fired, was
    /// already cancelled, or is currently being run.
    pub fn cancel(&self, id: TimerId) -> bool {
        let mut inner = self.inner.lock();
        let key = id.key();
        match inner.pending.get(key) {
            Some(p) if p.generation == id.generation() => {
                inner.pending.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Whether `id` is still pending.
    pub fn is_pending(&self, id: TimerId) -> bool {
        let inner = self.inner.lock();
        matches!(inner.pending.get(id.key()), Some(p) if p.generation == id.generation())
    }

    /// Number of pending timers.
    pub fn len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Earliest pending expiration, if any.
    pub fn next_deadline(&self) -> Option<u64> {
        self.inner.lock().next_deadline()
    }

    /// Fire every timer due at the clock's current time. Callbacks run on
    /// the calling thread with no queue lock held. Returns the number of
    /// callbacks run.
    pub fn run_expired(&self) -> usize {
        let now = self.clock.now_us();
        let mut due = Vec::new();
        {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            inner.expired.clear();
            inner.wheel.advance_into(now, &mut inner.expired);
            for entry in inner.expired.drain(..) {
                let key = entry.id.key();
                let live = matches!(
                    inner.pending.get(key),
                    Some(p) if p.generation == entry.id.generation()
                );
                if live {
                    let pending = inner.pending.remove(key);
                    due.push((entry.id, pending.expires_at, pending.callback));
                }
            }
        }
        due.sort_by_key(|(_, expires_at, _)| *expires_at);
        let fired = due.len();
        for (id, _, callback) in due {
            tracing::trace!(timer = id.as_u64(), "timer fired");
            callback(id);
        }
        fired
    }
}

/// Thread that fires a [`TimerQueue`]'s callbacks as they come due.
pub struct TimerDriver {
    queue: Arc<TimerQueue>,
    thread: Option<JoinHandle<()>>,
}

impl TimerDriver {
    /// Start a driver thread for `queue`.
    pub fn spawn(queue: Arc<TimerQueue>) -> std::io::Result<Self> {
        queue.terminate.store(false, Ordering::SeqCst);
        let thread = std::thread::Builder::new().name("ibmf-timer".to_string()).spawn({
            let queue = queue.clone();
            move || run(&queue)
        })?;
        Ok(Self {
            queue,
            thread: Some(thread),
        })
    }

    pub fn queue(&self) -> &Arc<TimerQueue> {
        &self.queue
    }
}

fn run(queue: &TimerQueue) {
    loop {
        {
            let mut inner = queue.inner.lock();
            if queue.terminate.load(Ordering::SeqCst) {
                break;
            }
            let now = queue.clock.now_us();
            match inner.next_deadline() {
                Some(deadline) if deadline > now => {
                    queue
                        .wakeup
                        .wait_for(&mut inner, Duration::from_micros(deadline - now));
                    continue;
                }
                Some(_) => {}
                None => {
                    queue.wakeup.wait(&mut inner);
                    continue;
                }
            }
        }
        queue.run_expired();
    }
}

impl Drop for TimerDriver {
    fn drop(&mut self) {
        {
            let _inner = self.queue.inner.lock();
            self.queue.terminate.store(true, Ordering::SeqCst);
        }
        self.queue.wakeup.notify_all();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
