#![forbid(unsafe_code)]

//! Timer system: alarms driven by an external clock.
//!
//! Time does not flow on its own. The host calls [`TimerSystem::advance`]
//! (from its event loop, or a test after moving a [`ManualClock`]); every
//! alarm whose deadline has been reached fires in its own transaction, in
//! deadline order, with [`TimerSystem::time`] set to that deadline.
//!
//! ```
//! use natrium_core::timer::{self, ManualClock, TimerSystem};
//!
//! let clock = ManualClock::new(0);
//! let sys = TimerSystem::new(clock.clone());
//! let ticks = timer::periodic(&sys, 10).expect("ticker");
//! clock.advance(25);
//! assert_eq!(sys.advance(), 2);
//! assert_eq!(sys.time().sample(), 25);
//! # drop(ticks);
//! ```

use std::cell::{Cell as StdCell, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Add;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;
use web_time::Instant;

use crate::cell::Cell;
use crate::error::Result;
use crate::loops::CellLoop;
use crate::stream::{Stream, StreamSink, WeakSink};
use crate::transaction::Transaction;

/// Source of the current time.
pub trait Clock {
    type Time: Ord + Copy + fmt::Debug + 'static;

    fn now(&self) -> Self::Time;
}

/// Virtual milliseconds, moved only by [`ManualClock::advance`] and
/// [`ManualClock::set`].
///
/// Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    millis: Arc<AtomicU64>,
}

impl ManualClock {
    #[must_use]
    pub fn new(start_ms: u64) -> Self {
        Self {
            millis: Arc::new(AtomicU64::new(start_ms)),
        }
    }

    pub fn advance(&self, delta_ms: u64) {
        self.millis.fetch_add(delta_ms, Ordering::Release);
    }

    pub fn set(&self, now_ms: u64) {
        self.millis.store(now_ms, Ordering::Release);
    }
}

impl Clock for ManualClock {
    type Time = u64;

    fn now(&self) -> u64 {
        self.millis.load(Ordering::Acquire)
    }
}

/// Wall-clock milliseconds elapsed since the clock was created.
#[derive(Debug, Clone)]
pub struct MillisecondsClock {
    epoch: Instant,
}

impl MillisecondsClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for MillisecondsClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MillisecondsClock {
    type Time = u64;

    fn now(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

type AlarmKey<T> = (T, u64);

/// Pending alarms ordered by deadline, then by arming order.
struct AlarmQueue<T> {
    /// Pending alarms by deadline, then registration order.
    alarms: RefCell<BTreeMap<AlarmKey<T>, WeakSink<T>>>,
    seq: StdCell<u64>,
}

impl<T: Ord + Copy> AlarmQueue<T> {
    fn new() -> Self {
        Self {
            alarms: RefCell::new(BTreeMap::new()),
            seq: StdCell::new(0),
        }
    }

    fn arm(&self, deadline: T, sink: WeakSink<T>) -> AlarmKey<T> {
        let seq = self.seq.get() + 1;
        self.seq.set(seq);
        self.alarms.borrow_mut().insert((deadline, seq), sink);
        (deadline, seq)
    }

    fn cancel(&self, key: AlarmKey<T>) {
        self.alarms.borrow_mut().remove(&key);
    }

    fn pop_due(&self, now: T) -> Option<(T, WeakSink<T>)> {
        let mut alarms = self.alarms.borrow_mut();
        let first = alarms.first_key_value().map(|(key, _)| *key)?;
        if first.0 > now {
            return None;
        }
        alarms.remove(&first).map(|sink| (first.0, sink))
    }

    fn next_deadline(&self) -> Option<T> {
        self.alarms.borrow().first_key_value().map(|(key, _)| key.0)
    }
}

/// Alarm scheduler over a [`Clock`].
pub struct TimerSystem<C: Clock> {
    clock: C,
    alarms: Rc<AlarmQueue<C::Time>>,
    time_sink: StreamSink<C::Time>,
    time: Cell<C::Time>,
}

impl<C: Clock> fmt::Debug for TimerSystem<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerSystem")
            .field("time", &self.time.try_sample().ok())
            .field("next_deadline", &self.next_deadline())
            .finish_non_exhaustive()
    }
}

impl<C: Clock> TimerSystem<C> {
    pub fn new(clock: C) -> Self {
        let now = clock.now();
        let time_sink = StreamSink::new();
        let time = time_sink.stream().hold(now);
        Self {
            clock,
            alarms: Rc::new(AlarmQueue::new()),
            time_sink,
            time,
        }
    }

    /// Time as of the last alarm fired or the last [`TimerSystem::advance`].
    /// Never a live read of the clock.
    #[must_use]
    pub fn time(&self) -> Cell<C::Time> {
        self.time.clone()
    }

    /// Fire once the clock reaches the deadline held in `when`. A new value
    /// in `when` re-arms the alarm.
    pub fn at(&self, when: &Cell<C::Time>) -> Stream<C::Time> {
        self.at_optional(&when.map(|t| Some(*t)))
    }

    /// Like [`TimerSystem::at`]; `None` disarms the alarm.
    pub fn at_optional(&self, when: &Cell<Option<C::Time>>) -> Stream<C::Time> {
        Transaction::run(|| {
            let alarm = StreamSink::new();
            let target = alarm.downgrade();
            let alarms = Rc::clone(&self.alarms);
            let mut armed: Option<AlarmKey<C::Time>> = None;
            let rearm = when.value().listen_unchecked(move |deadline: &Option<C::Time>| {
                if let Some(key) = armed.take() {
                    alarms.cancel(key);
                }
                if let Some(deadline) = *deadline {
                    armed = Some(alarms.arm(deadline, target.clone()));
                }
            });
            let stream = alarm.stream();
            stream.retain(rearm);
            stream
        })
    }

    /// Fire every alarm due at the clock's current time, then commit that
    /// time. Returns the number of alarms fired.
    ///
    /// Call this outside of any transaction; alarms re-armed by a firing
    /// (periodic timers) fire in the same call if they are also due.
    pub fn advance(&self) -> usize {
        let now = self.clock.now();
        let mut fired = 0;
        while let Some((deadline, target)) = self.alarms.pop_due(now) {
            let Some(alarm) = target.upgrade() else {
                continue;
            };
            debug!(?deadline, ?now, "timer fired");
            Transaction::run(|| {
                self.time_sink.send(deadline);
                alarm.send(deadline);
            });
            fired += 1;
        }
        if self.time.try_sample().ok() != Some(now) {
            self.time_sink.send(now);
        }
        fired
    }

    /// Earliest armed deadline, for hosts that sleep until the next alarm.
    #[must_use]
    pub fn next_deadline(&self) -> Option<C::Time> {
        self.alarms.next_deadline()
    }
}

/// A ticker firing every `period`, starting one period after the current
/// time.
///
/// Built as a loop: the next deadline is the last fired time plus `period`,
/// held from `time + period`.
pub fn periodic<C>(sys: &TimerSystem<C>, period: C::Time) -> Result<Stream<C::Time>>
where
    C: Clock,
    C::Time: Add<Output = C::Time>,
{
    Transaction::run(|| {
        let next_due = CellLoop::new();
        let ticks = sys.at(&next_due.cell());
        let start = sys.time().try_sample()? + period;
        next_due.close(&ticks.map(move |t| *t + period).hold(start))?;
        Ok(ticks)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(stream: &Stream<u64>) -> (crate::Listener, Rc<RefCell<Vec<u64>>>) {
        let out = Rc::new(RefCell::new(Vec::new()));
        let o = Rc::clone(&out);
        let listener = stream
            .listen(move |t| o.borrow_mut().push(*t))
            .expect("listen");
        (listener, out)
    }

    #[test]
    fn manual_clock_clones_share_time() {
        let clock = ManualClock::new(5);
        let other = clock.clone();
        clock.advance(10);
        assert_eq!(other.now(), 15);
        other.set(3);
        assert_eq!(clock.now(), 3);
    }

    #[test]
    fn alarm_fires_once_when_due() {
        let clock = ManualClock::new(0);
        let sys = TimerSystem::new(clock.clone());
        let alarm = sys.at(&Cell::new(50));
        let (_l, fired) = record(&alarm);
        clock.advance(49);
        assert_eq!(sys.advance(), 0);
        assert_eq!(sys.next_deadline(), Some(50));
        clock.advance(1);
        assert_eq!(sys.advance(), 1);
        clock.advance(100);
        assert_eq!(sys.advance(), 0);
        assert_eq!(*fired.borrow(), vec![50]);
        assert_eq!(sys.time().sample(), 150);
    }

    #[test]
    fn alarm_snapshot_sees_time_before_the_tick() {
        let clock = ManualClock::new(0);
        let sys = TimerSystem::new(clock.clone());
        let alarm = sys.at(&Cell::new(20));
        let seen = alarm.snapshot(&sys.time(), |fired, before| (*fired, *before));
        let out = Rc::new(RefCell::new(Vec::new()));
        let o = Rc::clone(&out);
        let _l = seen.listen(move |v| o.borrow_mut().push(*v)).expect("listen");
        clock.advance(30);
        sys.advance();
        assert_eq!(*out.borrow(), vec![(20, 0)]);
        assert_eq!(sys.time().sample(), 30);
    }

    #[test]
    fn none_disarms() {
        let clock = ManualClock::new(0);
        let sys = TimerSystem::new(clock.clone());
        let deadline = StreamSink::new();
        let alarm = sys.at_optional(&deadline.stream().hold(Some(10)));
        let (_l, fired) = record(&alarm);
        deadline.send(None);
        assert_eq!(sys.next_deadline(), None);
        clock.advance(20);
        assert_eq!(sys.advance(), 0);
        assert!(fired.borrow().is_empty());
    }

    #[test]
    fn dropped_alarm_is_skipped() {
        let clock = ManualClock::new(0);
        let sys = TimerSystem::new(clock.clone());
        drop(sys.at(&Cell::new(5)));
        clock.advance(10);
        assert_eq!(sys.advance(), 0);
    }

    #[test]
    fn periodic_ticks_without_gaps() {
        let clock = ManualClock::new(0);
        let sys = TimerSystem::new(clock.clone());
        let ticks = periodic(&sys, 10).expect("ticker");
        let (_l, seen) = record(&ticks);
        for _ in 0..4 {
            clock.advance(10);
            sys.advance();
        }
        assert_eq!(*seen.borrow(), vec![10, 20, 30, 40]);
        clock.advance(35);
        assert_eq!(sys.advance(), 3);
        assert_eq!(*seen.borrow(), vec![10, 20, 30, 40, 50, 60, 70]);
        assert_eq!(sys.next_deadline(), Some(80));
    }
}
