//! Priority aging.
//!
//! The sole starvation-prevention mechanism: a thread that has waited in
//! a ready queue past the configured threshold gets a priority boost,
//! migrating across bands when it crosses a band boundary. The running
//! thread and blocked threads are untouched; they are not waiting in any
//! queue.

use super::queue::{Band, ReadySet};
use crate::config::SchedConfig;
use crate::platform::Platform;
use crate::trace::TraceEvent;

/// What one aging pass did.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct AgingSummary {
    /// Number of threads boosted.
    pub boosts: u64,
    /// A boosted thread arrived in L1 or L2; a preemption check is due.
    pub armed: bool,
}

/// Boost every queued thread whose wait exceeds the threshold, then
/// rebuild the queues so each band's ordering discipline holds again.
pub(crate) fn age_ready_threads<P: Platform>(
    platform: &P,
    ready: &mut ReadySet,
    config: &SchedConfig,
    now: u64,
) -> AgingSummary {
    let mut summary = AgingSummary::default();

    let due = ready
        .iter()
        .any(|(t, _)| now.saturating_sub(t.wait_start_tick()) >= config.aging_wait_ticks);
    if !due {
        return summary;
    }

    for (mut thread, old_band) in ready.take_all() {
        if now.saturating_sub(thread.wait_start_tick()) >= config.aging_wait_ticks {
            thread.boost_priority(config.aging_boost);
            thread.reset_wait(now);
            summary.boosts += 1;
        }

        let new_band = Band::of_priority(thread.priority());
        if new_band != old_band {
            log::debug!(
                "aging migrates thread {} ({}) from {:?} to {:?} at priority {}",
                thread.id(),
                thread.name(),
                old_band,
                new_band,
                thread.priority()
            );
            platform.trace(TraceEvent::Removed {
                tick: now,
                thread: thread.id(),
                queue: old_band,
            });
            platform.trace(TraceEvent::Inserted {
                tick: now,
                thread: thread.id(),
                queue: new_band,
            });
            if new_band != Band::L3 {
                summary.armed = true;
            }
        }

        ready.enqueue(thread);
    }

    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PRIORITY_MAX;
    use crate::platform::InterruptLevel;
    use crate::thread::Thread;
    use alloc::boxed::Box;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingPlatform {
        events: Mutex<Vec<String>>,
    }

    impl Platform for RecordingPlatform {
        fn interrupt_level(&self) -> InterruptLevel {
            InterruptLevel::Off
        }
        fn now_ticks(&self) -> u64 {
            0
        }
        fn set_alarm(&self, _enabled: bool) {}
        unsafe fn context_switch(&self, _old: *mut Thread, _next: *const Thread) {}
        fn trace(&self, event: TraceEvent) {
            self.events.lock().unwrap().push(event.to_string());
        }
    }

    fn queued(id: u64, priority: u32, admitted_at: u64, seq: u64) -> Box<Thread> {
        let mut t = Thread::new(id, "t", priority);
        t.note_admitted(admitted_at, seq);
        Box::new(t)
    }

    #[test]
    fn test_below_threshold_is_untouched() {
        let platform = RecordingPlatform::default();
        let mut ready = ReadySet::new();
        ready.enqueue(queued(1, 10, 0, 0));

        let summary = age_ready_threads(&platform, &mut ready, &SchedConfig::default(), 1499);
        assert_eq!(summary.boosts, 0);
        assert_eq!(ready.peek().map(|(t, _)| t.priority()), Some(10));
    }

    #[test]
    fn test_boost_at_threshold() {
        let platform = RecordingPlatform::default();
        let mut ready = ReadySet::new();
        ready.enqueue(queued(1, 10, 0, 0));

        let summary = age_ready_threads(&platform, &mut ready, &SchedConfig::default(), 1500);
        assert_eq!(summary.boosts, 1);
        assert!(!summary.armed);
        let (head, band) = ready.peek().unwrap();
        assert_eq!(head.priority(), 20);
        assert_eq!(band, Band::L3);
        // the wait clock restarted
        assert_eq!(head.wait_start_tick(), 1500);
    }

    #[test]
    fn test_boost_saturates_at_ceiling() {
        let platform = RecordingPlatform::default();
        let mut ready = ReadySet::new();
        ready.enqueue(queued(1, 145, 0, 0));

        age_ready_threads(&platform, &mut ready, &SchedConfig::default(), 1500);
        assert_eq!(ready.peek().unwrap().0.priority(), PRIORITY_MAX);
    }

    #[test]
    fn test_migration_emits_traces_and_arms() {
        let platform = RecordingPlatform::default();
        let mut ready = ReadySet::new();
        ready.enqueue(queued(4, 45, 0, 0));

        let summary = age_ready_threads(&platform, &mut ready, &SchedConfig::default(), 1500);
        assert!(summary.armed);
        assert_eq!(ready.peek().map(|(_, b)| b), Some(Band::L2));

        let events = platform.events.lock().unwrap();
        assert_eq!(
            *events,
            [
                "Tick 1500: Thread 4 is removed from queue L3",
                "Tick 1500: Thread 4 is inserted into queue L2",
            ]
        );
    }

    #[test]
    fn test_boost_reorders_within_band() {
        let platform = RecordingPlatform::default();
        let mut ready = ReadySet::new();
        // seq 0 waited long enough to leapfrog seq 1 after the boost
        ready.enqueue(queued(1, 60, 0, 0));
        ready.enqueue(queued(2, 65, 1400, 1));

        age_ready_threads(&platform, &mut ready, &SchedConfig::default(), 1500);
        let order: Vec<u64> = ready.iter_band(Band::L2).map(|t| t.id()).collect();
        assert_eq!(order, [1, 2]);
        assert_eq!(ready.iter_band(Band::L2).next().unwrap().priority(), 70);
    }
}
