//! Scheduler trace events.
//!
//! The four strings below are a stable external format; test harnesses
//! match them verbatim. Events reach the outside world only through
//! [`Platform::trace`](crate::platform::Platform::trace), never a global
//! stream.

use crate::sched::Band;
use crate::thread::ThreadId;
use core::fmt;

/// A scheduling decision worth reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceEvent {
    /// Thread entered a ready queue.
    Inserted {
        tick: u64,
        thread: ThreadId,
        queue: Band,
    },
    /// Thread left a ready queue.
    Removed {
        tick: u64,
        thread: ThreadId,
        queue: Band,
    },
    /// Thread was installed on the CPU.
    Selected { tick: u64, thread: ThreadId },
    /// Thread left the CPU after consuming `ran_ticks`.
    Replaced {
        tick: u64,
        thread: ThreadId,
        ran_ticks: u64,
    },
}

impl fmt::Display for TraceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Inserted {
                tick,
                thread,
                queue,
            } => write!(
                f,
                "Tick {}: Thread {} is inserted into queue L{}",
                tick,
                thread,
                queue.level()
            ),
            Self::Removed {
                tick,
                thread,
                queue,
            } => write!(
                f,
                "Tick {}: Thread {} is removed from queue L{}",
                tick,
                thread,
                queue.level()
            ),
            Self::Selected { tick, thread } => write!(
                f,
                "Tick {}: Thread {} is now selected for execution",
                tick, thread
            ),
            Self::Replaced {
                tick,
                thread,
                ran_ticks,
            } => write!(
                f,
                "Tick {}: Thread {} is replaced, and it has executed {} ticks",
                tick, thread, ran_ticks
            ),
        }
    }
}
