//! Thread descriptor.
//!
//! The scheduler-visible control block: identity, priority, burst
//! accounting, saved context, kernel stack and optional user-space hooks.
//! Creation and teardown mechanics belong to the kernel proper; the
//! descriptor only carries what dispatch decisions need.

use super::stack::{Stack, DEFAULT_KERNEL_STACK_SIZE};
use super::state::{validate_transition, ThreadState};
use crate::config::PRIORITY_MAX;
use crate::platform::AddressSpace;
use crate::prediction::BurstPredictor;
use crate::sched_assert;
use alloc::boxed::Box;

/// Thread ID type.
pub type ThreadId = u64;

/// Saved callee state handed to the machine switch primitive.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ThreadContext {
    /// Kernel stack pointer.
    pub sp: u64,
    /// Resume instruction pointer.
    pub ip: u64,
}

impl ThreadContext {
    pub const fn empty() -> Self {
        Self { sp: 0, ip: 0 }
    }
}

/// Thread control block.
pub struct Thread {
    /// Stable identity, assigned by the creator.
    id: ThreadId,

    /// Thread name (for debugging).
    name: Box<str>,

    /// Current state.
    state: ThreadState,

    /// Urgency in `[0, PRIORITY_MAX]`; higher runs sooner.
    priority: u32,

    /// Next-burst estimate.
    predictor: BurstPredictor,

    /// Ticks consumed since the last dispatch.
    accum_burst: u64,

    /// Tick recorded at the last dispatch point.
    last_dispatch_tick: u64,

    /// Tick at which the thread last entered a ready queue.
    wait_start_tick: u64,

    /// Monotone admission stamp; FIFO tie-break within a queue.
    admission_seq: u64,

    /// Saved context for the switch primitive.
    context: ThreadContext,

    /// Kernel stack.
    stack: Stack,

    /// User-space hooks, present only for user threads.
    space: Option<Box<dyn AddressSpace>>,
}

impl Thread {
    /// Create a kernel thread descriptor with the default stack size.
    pub fn new(id: ThreadId, name: &str, priority: u32) -> Self {
        Self::with_stack_size(id, name, priority, DEFAULT_KERNEL_STACK_SIZE)
    }

    /// Create a descriptor with an explicit kernel stack size.
    pub fn with_stack_size(id: ThreadId, name: &str, priority: u32, stack_size: usize) -> Self {
        sched_assert!(priority <= PRIORITY_MAX, "priority out of range");

        let stack = Stack::new(stack_size);
        let context = ThreadContext {
            sp: stack.top() as u64,
            ip: 0,
        };

        Self {
            id,
            name: name.into(),
            state: ThreadState::New,
            priority,
            predictor: BurstPredictor::new(),
            accum_burst: 0,
            last_dispatch_tick: 0,
            wait_start_tick: 0,
            admission_seq: 0,
            context,
            stack,
            space: None,
        }
    }

    /// Attach user-space hooks.
    pub fn with_space(mut self, space: Box<dyn AddressSpace>) -> Self {
        self.space = Some(space);
        self
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ThreadState {
        self.state
    }

    /// Transition to `next`; illegal transitions are fatal.
    pub fn set_state(&mut self, next: ThreadState) {
        sched_assert!(
            validate_transition(self.state, next),
            "illegal thread state transition"
        );
        self.state = next;
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    /// Overwrite the priority; out-of-range values are fatal.
    pub fn set_priority(&mut self, priority: u32) {
        sched_assert!(priority <= PRIORITY_MAX, "priority out of range");
        self.priority = priority;
    }

    /// Raise the priority, saturating at the ceiling.
    pub(crate) fn boost_priority(&mut self, amount: u32) {
        self.priority = self.priority.saturating_add(amount).min(PRIORITY_MAX);
    }

    /// Next-burst estimate in whole ticks.
    pub fn predicted_burst(&self) -> u64 {
        self.predictor.predicted_ticks()
    }

    /// Seed the next-burst estimate (whole ticks).
    pub fn set_predicted_burst(&mut self, ticks: u64) {
        self.predictor.seed(ticks);
    }

    /// Scaled estimate for exact queue ordering.
    pub(crate) fn predicted_scaled(&self) -> u64 {
        self.predictor.predicted_scaled()
    }

    /// Fold the accumulated burst into the estimate.
    pub(crate) fn feed_predictor(&mut self) {
        self.predictor.observe(self.accum_burst);
    }

    /// Ticks consumed since the last dispatch.
    pub fn accum_burst(&self) -> u64 {
        self.accum_burst
    }

    /// Account one tick of CPU consumption.
    pub(crate) fn record_tick(&mut self) {
        self.accum_burst += 1;
    }

    pub fn last_dispatch_tick(&self) -> u64 {
        self.last_dispatch_tick
    }

    pub fn wait_start_tick(&self) -> u64 {
        self.wait_start_tick
    }

    pub(crate) fn admission_seq(&self) -> u64 {
        self.admission_seq
    }

    /// Stamp an admission into a ready queue.
    pub(crate) fn note_admitted(&mut self, now: u64, seq: u64) {
        self.set_state(ThreadState::Ready);
        self.wait_start_tick = now;
        self.admission_seq = seq;
    }

    /// Restart the aging clock after a boost.
    pub(crate) fn reset_wait(&mut self, now: u64) {
        self.wait_start_tick = now;
    }

    /// Record a dispatch point: burst accounting restarts here.
    pub(crate) fn stamp_dispatch(&mut self, now: u64) {
        self.last_dispatch_tick = now;
        self.accum_burst = 0;
    }

    /// Saved context, for switch primitives.
    pub fn context(&self) -> &ThreadContext {
        &self.context
    }

    /// Fatal check of the kernel stack fence.
    pub fn check_overflow(&self) {
        sched_assert!(self.stack.fence_intact(), "kernel stack overflow");
    }

    /// Save user register file and address-space state, if any.
    pub(crate) fn save_user(&mut self) {
        if let Some(space) = self.space.as_mut() {
            space.save_user_state();
            space.save_state();
        }
    }

    /// Restore user register file and address-space state, if any.
    pub(crate) fn restore_user(&mut self) {
        if let Some(space) = self.space.as_mut() {
            space.restore_user_state();
            space.restore_state();
        }
    }
}
