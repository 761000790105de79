//! The timer wheel: an unsorted, linearly scanned list of due times.
//! The outstanding count is bounded by circuits plus a handful of
//! periodics, so a scan per wake is cheap. Every timer is identified by
//! its [`TimerKind`]; cancellation marks the entry and the next sweep
//! drops it.

use embassy_time::{Duration, Instant};

const MAX_TIMERS: usize = 64;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum TimerKind {
    /// Periodic full refresh of non-broadcast routing state.
    T1Tick,
    /// Periodic full refresh of broadcast routing state.
    BcT1Tick,
    /// Update process pacing tick.
    UpdateTick,
    /// Adjacency liveness sweep.
    PurgeAdjacencies,
    /// End of the designated-router startup grace window.
    DrDelay,
    /// Per-circuit hello to All Routers.
    RouterHello(usize),
    /// Per-circuit hello to All Level 2 Routers.
    Level2Hello(usize),
    /// Per-circuit hello to All End Nodes, sent while designated router.
    EndnodeHello(usize),
    /// Per-circuit hello-and-test on a point-to-point circuit.
    DdcmpHello(usize),
    /// Throttle for reinitializing a point-to-point circuit.
    Recall(usize),
}

#[derive(Copy, Clone)]
struct Timer {
    kind: TimerKind,
    due: Instant,
    interval: Option<Duration>,
    cancelled: bool,
}

#[derive(Default)]
pub struct TimerWheel {
    timers: heapless::Vec<Timer, MAX_TIMERS>,
}

impl TimerWheel {
    pub const fn new() -> Self {
        Self {
            timers: heapless::Vec::new(),
        }
    }

    pub fn create(&mut self, kind: TimerKind, due: Instant, interval: Option<Duration>) {
        self.cancel(kind);

        let timer = Timer {
            kind,
            due,
            interval,
            cancelled: false,
        };

        if self.timers.push(timer).is_err() {
            // Bounded by design; hitting this means a leak.
            log::error!("timer list full, dropping {:?}", kind);
        }
    }

    pub fn create_periodic(&mut self, kind: TimerKind, first: Instant, interval: Duration) {
        self.create(kind, first, Some(interval));
    }

    pub fn create_oneshot(&mut self, kind: TimerKind, due: Instant) {
        self.create(kind, due, None);
    }

    pub fn cancel(&mut self, kind: TimerKind) {
        for timer in &mut self.timers {
            if timer.kind == kind {
                timer.cancelled = true;
            }
        }
    }

    pub fn is_active(&self, kind: TimerKind) -> bool {
        self.timers
            .iter()
            .any(|timer| timer.kind == kind && !timer.cancelled)
    }

    pub fn next_due(&self) -> Option<Instant> {
        self.timers
            .iter()
            .filter(|timer| !timer.cancelled)
            .map(|timer| timer.due)
            .min()
    }

    /// Collects every timer due at `now`, advancing periodic ones and
    /// retiring one-shots. Handlers run after the sweep, so they are
    /// free to create and cancel timers.
    pub fn take_due(&mut self, now: Instant) -> heapless::Vec<TimerKind, MAX_TIMERS> {
        let mut due = heapless::Vec::new();

        for timer in &mut self.timers {
            if !timer.cancelled && timer.due <= now {
                let _ = due.push(timer.kind);

                match timer.interval {
                    Some(interval) => timer.due += interval,
                    None => timer.cancelled = true,
                }
            }
        }

        self.timers.retain(|timer| !timer.cancelled);

        due
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn at(secs: u64) -> Instant {
        Instant::from_secs(secs)
    }

    #[test]
    fn periodic_timer_reschedules() {
        let mut wheel = TimerWheel::new();
        wheel.create_periodic(TimerKind::PurgeAdjacencies, at(1), Duration::from_secs(1));

        assert_eq!(wheel.next_due(), Some(at(1)));
        assert_eq!(&wheel.take_due(at(1))[..], &[TimerKind::PurgeAdjacencies]);
        assert_eq!(wheel.next_due(), Some(at(2)));
    }

    #[test]
    fn oneshot_retires_after_firing() {
        let mut wheel = TimerWheel::new();
        wheel.create_oneshot(TimerKind::DrDelay, at(10));

        assert!(wheel.take_due(at(9)).is_empty());
        assert_eq!(&wheel.take_due(at(10))[..], &[TimerKind::DrDelay]);
        assert_eq!(wheel.next_due(), None);
        assert!(!wheel.is_active(TimerKind::DrDelay));
    }

    #[test]
    fn cancelled_timer_does_not_fire() {
        let mut wheel = TimerWheel::new();
        wheel.create_periodic(TimerKind::RouterHello(1), at(5), Duration::from_secs(15));
        wheel.create_periodic(TimerKind::RouterHello(2), at(6), Duration::from_secs(15));

        wheel.cancel(TimerKind::RouterHello(1));
        assert!(!wheel.is_active(TimerKind::RouterHello(1)));
        assert!(wheel.is_active(TimerKind::RouterHello(2)));

        assert_eq!(&wheel.take_due(at(10))[..], &[TimerKind::RouterHello(2)]);
    }

    #[test]
    fn recreate_replaces_existing() {
        let mut wheel = TimerWheel::new();
        wheel.create_oneshot(TimerKind::Recall(3), at(5));
        wheel.create_oneshot(TimerKind::Recall(3), at(50));

        assert!(wheel.take_due(at(10)).is_empty());
        assert_eq!(&wheel.take_due(at(50))[..], &[TimerKind::Recall(3)]);
    }
}
