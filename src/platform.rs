//! Abstract collaborators of the scheduler.
//!
//! The scheduler runs inside a kernel whose interrupt controller, quantum
//! timer, context-switch primitive and address spaces are machine
//! dependent. Everything consumed from that machinery goes through the
//! [`Platform`] trait so the core stays host-testable.

use crate::thread::Thread;
use crate::trace::TraceEvent;

/// Processor interrupt level as reported by the interrupt controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptLevel {
    On,
    Off,
}

/// Kernel services the scheduler consumes.
pub trait Platform {
    /// Current interrupt level; consulted only by assertions.
    fn interrupt_level(&self) -> InterruptLevel;

    /// Monotonic tick counter.
    fn now_ticks(&self) -> u64;

    /// Enable or disable the round-robin quantum timer.
    fn set_alarm(&self, enabled: bool);

    /// Machine-level stack and register swap. Control returns on `old`
    /// only when a future dispatch selects `old` again.
    ///
    /// # Safety
    ///
    /// Both pointers must refer to live thread descriptors whose owning
    /// containers are not mutated for the duration of the call, and
    /// interrupts must be disabled. The descriptors may alias when a
    /// thread is re-dispatched onto itself.
    unsafe fn context_switch(&self, old: *mut Thread, next: *const Thread);

    /// Sink for the stable trace events. Defaults to the log facade.
    fn trace(&self, event: TraceEvent) {
        log::info!("{}", event);
    }
}

/// User-mode state hooks for a thread that owns an address space.
///
/// Invoked around dispatch. A pure kernel thread has none.
pub trait AddressSpace: Send {
    /// Save the user register file.
    fn save_user_state(&mut self);

    /// Restore the user register file.
    fn restore_user_state(&mut self);

    /// Save address-space state (e.g. translation registers).
    fn save_state(&mut self);

    /// Restore address-space state.
    fn restore_state(&mut self);
}
