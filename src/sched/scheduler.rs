//! Dispatcher core.
//!
//! Placement, selection, preemption, dispatch and reclamation for the
//! three-band ready set. Every entry point assumes the caller has
//! disabled interrupts; on a uniprocessor that assumption is the mutual
//! exclusion, so the spin locks below never contend and exist to carve
//! the state into independently borrowable pieces. Locks are acquired in
//! the order current -> ready -> blocked -> destroyed and all are
//! released before the machine switch.
//!
//! Thread descriptors are uniquely owned: a READY thread by its band
//! queue, a BLOCKED thread by the registry, the running thread by the
//! `current` slot and a finished thread by the one-slot destruction
//! mailbox. Moving a thread between those places is a transfer of the
//! owning `Box`.

use super::aging::age_ready_threads;
use super::queue::{Band, ReadySet};
use crate::config::SchedConfig;
use crate::platform::{InterruptLevel, Platform};
use crate::sched_assert;
use crate::thread::{Thread, ThreadId, ThreadState};
use crate::trace::TraceEvent;
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use spin::{Mutex, MutexGuard};

/// Copied head-of-queue facts for preemption decisions. A snapshot keeps
/// queue ownership unique; no borrow escapes the ready set.
#[derive(Debug, Clone, Copy)]
pub struct NextPreview {
    pub id: ThreadId,
    pub band: Band,
    pub priority: u32,
    /// Whole-tick burst estimate.
    pub predicted_burst: u64,
    pub(crate) predicted_scaled: u64,
}

/// Scheduler statistics snapshot.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerStats {
    pub dispatches: u64,
    pub preemptions: u64,
    pub quantum_expiries: u64,
    pub aging_boosts: u64,
    pub admissions: u64,
    pub l1_len: usize,
    pub l2_len: usize,
    pub l3_len: usize,
    pub blocked: usize,
}

/// Bookkeeping handle for the thread leaving the CPU. Its descriptor has
/// already been handed to a queue, the blocked registry or the
/// destruction mailbox; the raw pointer stays valid because the heap
/// allocation never moves and nothing else runs while interrupts are off.
struct Departed {
    ptr: *mut Thread,
    id: ThreadId,
    ran: u64,
}

/// The thread dispatcher. One per kernel, bound to its platform.
pub struct Scheduler<P: Platform> {
    platform: P,
    config: SchedConfig,

    ready: Mutex<ReadySet>,
    current: Mutex<Option<Box<Thread>>>,
    blocked: Mutex<BTreeMap<ThreadId, Box<Thread>>>,
    to_be_destroyed: Mutex<Option<Box<Thread>>>,

    /// A thread was admitted above L3; a preemption check is pending.
    enable_preempt_once: AtomicBool,

    /// Monotone admission stamp; FIFO tie-break source.
    admission_seq: AtomicU64,

    dispatches: AtomicU64,
    preemptions: AtomicU64,
    quantum_expiries: AtomicU64,
    aging_boosts: AtomicU64,
    admissions: AtomicU64,
}

impl<P: Platform> Scheduler<P> {
    /// Create a scheduler bound to `platform`.
    pub fn new(platform: P, config: SchedConfig) -> Self {
        sched_assert!(config.validate().is_ok(), "invalid scheduler configuration");

        Self {
            platform,
            config,
            ready: Mutex::new(ReadySet::new()),
            current: Mutex::new(None),
            blocked: Mutex::new(BTreeMap::new()),
            to_be_destroyed: Mutex::new(None),
            enable_preempt_once: AtomicBool::new(false),
            admission_seq: AtomicU64::new(0),
            dispatches: AtomicU64::new(0),
            preemptions: AtomicU64::new(0),
            quantum_expiries: AtomicU64::new(0),
            aging_boosts: AtomicU64::new(0),
            admissions: AtomicU64::new(0),
        }
    }

    fn assert_interrupts_off(&self) {
        sched_assert!(
            self.platform.interrupt_level() == InterruptLevel::Off,
            "scheduler entered with interrupts enabled"
        );
    }

    /// Mark a thread ready and place it in the band its priority selects.
    ///
    /// External admissions only (new threads and wake-ups); the running
    /// thread re-enters through [`run`](Self::run) or
    /// [`preempt_current`](Self::preempt_current). Admitting a RUNNING or
    /// TERMINATED thread is fatal.
    pub fn ready_to_run(&self, thread: Box<Thread>) {
        self.assert_interrupts_off();
        sched_assert!(
            thread.state().is_schedulable(),
            "cannot admit a running or finished thread"
        );
        self.admit(thread, true);
    }

    /// Placement shared by admissions, yield re-entry and aging rebuilds.
    fn admit(&self, mut thread: Box<Thread>, arm_preempt: bool) -> Band {
        let now = self.platform.now_ticks();
        let seq = self.admission_seq.fetch_add(1, Ordering::Relaxed);
        thread.note_admitted(now, seq);
        self.admissions.fetch_add(1, Ordering::Relaxed);

        let band = Band::of_priority(thread.priority());
        log::debug!(
            "admitting thread {} ({}) to {:?}, priority {}, predicted burst {}",
            thread.id(),
            thread.name(),
            band,
            thread.priority(),
            thread.predicted_burst()
        );
        self.platform.trace(TraceEvent::Inserted {
            tick: now,
            thread: thread.id(),
            queue: band,
        });

        self.ready.lock().enqueue(thread);

        if arm_preempt && band != Band::L3 {
            self.enable_preempt_once.store(true, Ordering::Release);
        }
        band
    }

    /// Remove and return the head of the highest non-empty band, driving
    /// the quantum timer: on for an L3 pick, off otherwise. `None` when
    /// every queue is empty; the idle loop is the caller's concern.
    pub fn find_next_to_run(&self) -> Option<Box<Thread>> {
        self.assert_interrupts_off();

        let (thread, band) = self.ready.lock().dequeue()?;
        self.platform.set_alarm(band == Band::L3);
        self.platform.trace(TraceEvent::Removed {
            tick: self.platform.now_ticks(),
            thread: thread.id(),
            queue: band,
        });
        Some(thread)
    }

    /// Head of the highest non-empty band, without removal or side
    /// effects.
    pub fn peek_next(&self) -> Option<NextPreview> {
        self.assert_interrupts_off();

        self.ready.lock().peek().map(|(t, band)| NextPreview {
            id: t.id(),
            band,
            priority: t.priority(),
            predicted_burst: t.predicted_burst(),
            predicted_scaled: t.predicted_scaled(),
        })
    }

    /// Install the very first thread on the CPU. There is no predecessor,
    /// so no replacement event and no switch.
    pub fn start(&self, mut first: Box<Thread>) {
        self.assert_interrupts_off();

        let mut current = self.current.lock();
        sched_assert!(current.is_none(), "start with a thread already running");

        let now = self.platform.now_ticks();
        first.set_state(ThreadState::Running);
        first.stamp_dispatch(now);
        self.dispatches.fetch_add(1, Ordering::Relaxed);
        self.platform.trace(TraceEvent::Selected {
            tick: now,
            thread: first.id(),
        });
        *current = Some(first);
    }

    /// Dispatch the CPU to `next`.
    ///
    /// The caller has already set the running thread's state to READY
    /// (yield), BLOCKED, or TERMINATED (with `finishing`); it is disposed
    /// of accordingly before the switch. A READY or BLOCKED departure
    /// feeds its accumulated burst into its predictor first, so the
    /// shortest-burst queue orders on the fresh estimate.
    ///
    /// Control returns here only when a future dispatch selects the
    /// departing thread again; the first thing done on return is
    /// reclamation of any finished predecessor.
    pub fn run(&self, next: Box<Thread>, finishing: bool) {
        self.assert_interrupts_off();

        let mut current = self.current.lock();
        let Some(old) = current.take() else {
            panic!("scheduler invariant violated: dispatch with no running thread");
        };
        let departed = self.dispose_current(old, finishing);
        self.dispatch(current, next, departed, finishing);
    }

    /// Move the departing thread to the container its state selects and
    /// return the bookkeeping handle.
    fn dispose_current(&self, mut old: Box<Thread>, finishing: bool) -> Departed {
        let id = old.id();
        let ran = old.accum_burst();
        let ptr: *mut Thread = &mut *old;

        match old.state() {
            ThreadState::Ready => {
                sched_assert!(!finishing, "finishing dispatch requires a terminated thread");
                old.feed_predictor();
                self.admit(old, false);
            }
            ThreadState::Blocked => {
                sched_assert!(!finishing, "finishing dispatch requires a terminated thread");
                old.feed_predictor();
                log::debug!("thread {} blocks after {} ticks", id, ran);
                self.blocked.lock().insert(id, old);
            }
            ThreadState::Terminated => {
                sched_assert!(finishing, "terminated thread requires a finishing dispatch");
                let mut slot = self.to_be_destroyed.lock();
                sched_assert!(slot.is_none(), "destruction slot already occupied");
                *slot = Some(old);
            }
            state => {
                panic!(
                    "scheduler invariant violated: running thread disposed in state {}",
                    state
                );
            }
        }

        Departed { ptr, id, ran }
    }

    /// The switch protocol shared by every dispatch path.
    fn dispatch(
        &self,
        mut current: MutexGuard<'_, Option<Box<Thread>>>,
        mut next: Box<Thread>,
        departed: Departed,
        finishing: bool,
    ) {
        let now = self.platform.now_ticks();

        // SAFETY: the departed descriptor lives in a queue, the blocked
        // registry or the destruction mailbox; interrupts are off, so
        // nothing else touches it and the allocation is stable.
        unsafe {
            let old = &mut *departed.ptr;
            old.save_user();
            old.check_overflow();
        }

        // Any pending check is consumed by the dispatch itself
        self.enable_preempt_once.store(false, Ordering::Release);

        next.set_state(ThreadState::Running);
        let next_id = next.id();
        let next_ptr: *const Thread = &*next;
        log::debug!("switching from thread {} to thread {}", departed.id, next_id);
        *current = Some(next);
        self.dispatches.fetch_add(1, Ordering::Relaxed);

        self.platform.trace(TraceEvent::Selected {
            tick: now,
            thread: next_id,
        });
        self.platform.trace(TraceEvent::Replaced {
            tick: now,
            thread: departed.id,
            ran_ticks: departed.ran,
        });

        // SAFETY: as above; the switch primitive may observe both
        // descriptors, which alias only on a self-dispatch.
        unsafe {
            (*departed.ptr).stamp_dispatch(now);
        }

        drop(current);

        // SAFETY: both descriptors are owned by scheduler containers and
        // stay put for the duration of the call.
        unsafe {
            self.platform.context_switch(departed.ptr, next_ptr);
        }

        // Back on the departed thread's stack, at some future dispatch.
        // Interrupts are still off; reclaim the predecessor before any
        // user work resumes.
        self.assert_interrupts_off();
        self.check_to_be_destroyed();
        if !finishing {
            // SAFETY: a non-finishing departure still owns its
            // descriptor in a scheduler container.
            unsafe {
                (*departed.ptr).restore_user();
            }
        }
    }

    /// Destroy the thread waiting in the destruction mailbox, if any.
    /// Idempotent; called between the stack swap and the resumption of
    /// user work. A thread never reclaims itself: its own dispatch
    /// parked it here for the successor.
    pub fn check_to_be_destroyed(&self) {
        let mut slot = self.to_be_destroyed.lock();
        if let Some(dead) = slot.take() {
            log::debug!("reclaiming thread {} ({})", dead.id(), dead.name());
            drop(dead);
        }
    }

    /// Voluntary yield. Picks a successor first; with an empty ready set
    /// the caller keeps the CPU and `false` is returned.
    pub fn yield_now(&self) -> bool {
        self.assert_interrupts_off();

        let Some(next) = self.find_next_to_run() else {
            log::debug!("yield with an empty ready set");
            return false;
        };
        let marked = self.with_current(|t| t.set_state(ThreadState::Ready));
        sched_assert!(marked.is_some(), "yield with no running thread");
        self.run(next, false);
        true
    }

    /// Involuntary preemption: re-admit the running thread, then dispatch
    /// the head of the ready set, which may be the same thread when it
    /// is the only runnable one.
    pub fn preempt_current(&self) {
        self.assert_interrupts_off();

        let mut current = self.current.lock();
        let Some(mut old) = current.take() else {
            log::warn!("preemption requested with no running thread");
            return;
        };

        let id = old.id();
        let ran = old.accum_burst();
        let ptr: *mut Thread = &mut *old;
        old.set_state(ThreadState::Ready);
        old.feed_predictor();
        self.admit(old, false);
        self.preemptions.fetch_add(1, Ordering::Relaxed);

        let Some(next) = self.find_next_to_run() else {
            panic!("scheduler invariant violated: ready set empty after re-admission");
        };
        self.dispatch(current, next, Departed { ptr, id, ran }, false);
    }

    /// Block the running thread and dispatch a successor. The kernel must
    /// keep some thread runnable (an idle thread); blocking the last
    /// runnable thread is fatal.
    pub fn block_current(&self) {
        self.assert_interrupts_off();

        let next = self.find_next_to_run();
        sched_assert!(next.is_some(), "blocking with no runnable successor");
        let marked = self.with_current(|t| t.set_state(ThreadState::Blocked));
        sched_assert!(marked.is_some(), "blocking with no running thread");
        if let Some(next) = next {
            self.run(next, false);
        }
    }

    /// Terminate the running thread and dispatch a successor. The
    /// descriptor is parked for reclamation by the successor; it is never
    /// freed while the CPU still runs on its stack.
    pub fn finish_current(&self) {
        self.assert_interrupts_off();

        let next = self.find_next_to_run();
        sched_assert!(next.is_some(), "finishing with no runnable successor");
        let marked = self.with_current(|t| t.set_state(ThreadState::Terminated));
        sched_assert!(marked.is_some(), "finishing with no running thread");
        if let Some(next) = next {
            self.run(next, true);
        }
    }

    /// Wake a blocked thread: move it from the registry back through
    /// admission. Returns `false` when the thread is not blocked here.
    pub fn unblock(&self, id: ThreadId) -> bool {
        self.assert_interrupts_off();

        // Drop the registry guard before admit takes the ready lock
        let removed = self.blocked.lock().remove(&id);
        match removed {
            Some(thread) => {
                log::debug!("waking thread {} ({})", id, thread.name());
                self.admit(thread, true);
                true
            }
            None => {
                log::warn!("unblock: thread {} not in blocked registry", id);
                false
            }
        }
    }

    /// Timer interrupt hook: burst accounting, the aging pass, then the
    /// preemption triggers.
    pub fn on_tick(&self) {
        self.assert_interrupts_off();

        let now = self.platform.now_ticks();

        // Burst accounting for the running thread
        let running = {
            let mut current = self.current.lock();
            current.as_mut().map(|t| {
                t.record_tick();
                (
                    Band::of_priority(t.priority()),
                    t.accum_burst(),
                    t.predicted_scaled(),
                )
            })
        };

        // Aging runs every tick, even while higher bands stay busy
        {
            let mut ready = self.ready.lock();
            let summary = age_ready_threads(&self.platform, &mut ready, &self.config, now);
            drop(ready);
            if summary.boosts > 0 {
                self.aging_boosts.fetch_add(summary.boosts, Ordering::Relaxed);
            }
            if summary.armed {
                self.enable_preempt_once.store(true, Ordering::Release);
            }
        }

        let Some((band, accum, predicted_scaled)) = running else {
            return;
        };

        // Quantum expiry: round-robin applies to L3 only
        if band == Band::L3 && accum >= self.config.quantum_ticks {
            log::debug!("quantum expired after {} ticks", accum);
            self.quantum_expiries.fetch_add(1, Ordering::Relaxed);
            self.preempt_current();
            return;
        }

        // Arrival-driven check, armed by admissions above L3 and consumed
        // by the evaluation whether or not it preempts
        if self.enable_preempt_once.swap(false, Ordering::AcqRel) {
            let preempt = match self.peek_next() {
                Some(head) => match band {
                    Band::L3 | Band::L2 => head.band.dominates(band),
                    // an equal estimate at the head does not preempt
                    Band::L1 => head.band == Band::L1 && head.predicted_scaled < predicted_scaled,
                },
                None => false,
            };
            if preempt {
                self.preempt_current();
            }
        }
    }

    /// Execute a closure against the running thread.
    pub fn with_current<R>(&self, f: impl FnOnce(&mut Thread) -> R) -> Option<R> {
        self.current.lock().as_mut().map(|t| f(t))
    }

    /// ID of the running thread.
    pub fn current_thread_id(&self) -> Option<ThreadId> {
        self.current.lock().as_ref().map(|t| t.id())
    }

    /// IDs queued in `band`, in queue order. Debug accessor.
    pub fn queued_ids(&self, band: Band) -> Vec<ThreadId> {
        self.ready.lock().iter_band(band).map(|t| t.id()).collect()
    }

    /// True while a finished thread awaits reclamation.
    pub fn destruction_pending(&self) -> bool {
        self.to_be_destroyed.lock().is_some()
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> SchedulerStats {
        let (l1_len, l2_len, l3_len) = self.ready.lock().lengths();
        SchedulerStats {
            dispatches: self.dispatches.load(Ordering::Relaxed),
            preemptions: self.preemptions.load(Ordering::Relaxed),
            quantum_expiries: self.quantum_expiries.load(Ordering::Relaxed),
            aging_boosts: self.aging_boosts.load(Ordering::Relaxed),
            admissions: self.admissions.load(Ordering::Relaxed),
            l1_len,
            l2_len,
            l3_len,
            blocked: self.blocked.lock().len(),
        }
    }

    /// Dump the ready set, L1 first, as (id, priority, predicted burst,
    /// accumulated burst) tuples. For debugging.
    pub fn print(&self) {
        let ready = self.ready.lock();
        log::info!("ready set contents:");
        for band in [Band::L1, Band::L2, Band::L3] {
            let entries: Vec<String> = ready
                .iter_band(band)
                .map(|t| {
                    format!(
                        "({}, {}, {}, {})",
                        t.id(),
                        t.priority(),
                        t.predicted_burst(),
                        t.accum_burst()
                    )
                })
                .collect();
            log::info!("  L{}: {}", band.level(), entries.join(" "));
        }
    }
}
