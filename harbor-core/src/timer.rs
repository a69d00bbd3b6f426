//! Monotonic timer wheel, millisecond granularity.
//!
//! Due callbacks fire in non-decreasing due-time order, ties broken by
//! insertion order. Cancellation is lazy: the heap keeps stale deadlines and
//! skips them when they surface. `tick` is O(k + log n) for k fired timers.
//!
//! All callbacks run on the owning service thread; the wheel itself is
//! single-threaded state.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

pub type TimerId = u64;

/// What a periodic callback wants to happen next. One-shot timers are
/// removed regardless of the returned value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerFire {
    Rearm,
    Stop,
}

/// Passed to a firing callback. Cancels issued here take effect before the
/// cancelled timer can fire again, including later in the same tick.
pub struct TimerContext<'a> {
    pub id: TimerId,
    pub now_ms: u64,
    cancelled: &'a mut HashSet<TimerId>,
}

impl TimerContext<'_> {
    pub fn cancel(&mut self, id: TimerId) {
        self.cancelled.insert(id);
    }
}

type Callback = Box<dyn FnMut(&mut TimerContext) -> TimerFire>;

struct Task {
    period_ms: Option<u64>,
    cb: Callback,
}

#[derive(PartialEq, Eq, PartialOrd, Ord)]
struct Deadline {
    due_ms: u64,
    seq: u64,
    id: TimerId,
}

pub struct TimerWheel {
    heap: BinaryHeap<Reverse<Deadline>>,
    tasks: HashMap<TimerId, Task>,
    now_ms: u64,
    next_id: TimerId,
    next_seq: u64,
}

impl Default for TimerWheel {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerWheel {
    pub fn new() -> Self {
        TimerWheel {
            heap: BinaryHeap::new(),
            tasks: HashMap::new(),
            now_ms: 0,
            next_id: 1,
            next_seq: 0,
        }
    }

    /// Arms a timer due `delay_ms` from the wheel's current time. With a
    /// period it re-arms after every fire until cancelled or the callback
    /// returns [`TimerFire::Stop`].
    pub fn schedule<F>(&mut self, delay_ms: u64, period_ms: Option<u64>, cb: F) -> TimerId
    where
        F: FnMut(&mut TimerContext) -> TimerFire + 'static,
    {
        let id = self.next_id;
        self.next_id += 1;
        self.tasks.insert(
            id,
            Task {
                period_ms,
                cb: Box::new(cb),
            },
        );
        self.push_deadline(id, self.now_ms + delay_ms);
        id
    }

    /// Returns whether the timer was still armed.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        self.tasks.remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Due time of the nearest armed timer. Stale deadlines left behind by
    /// cancellation are discarded on the way.
    pub fn next_due(&mut self) -> Option<u64> {
        while let Some(Reverse(top)) = self.heap.peek() {
            if self.tasks.contains_key(&top.id) {
                return Some(top.due_ms);
            }
            self.heap.pop();
        }
        None
    }

    /// Advances the wheel to `now_ms` and fires everything due. Returns the
    /// fired count.
    pub fn tick(&mut self, now_ms: u64) -> usize {
        self.now_ms = self.now_ms.max(now_ms);
        let mut fired = 0;
        let mut cancelled: HashSet<TimerId> = HashSet::new();

        while let Some(Reverse(top)) = self.heap.peek() {
            if top.due_ms > self.now_ms {
                break;
            }
            let deadline = self.heap.pop().expect("peeked entry").0;
            let mut task = match self.tasks.remove(&deadline.id) {
                Some(task) => task,
                // Stale deadline of a cancelled or re-armed timer.
                None => continue,
            };
            if cancelled.contains(&deadline.id) {
                continue;
            }

            let mut ctx = TimerContext {
                id: deadline.id,
                now_ms: self.now_ms,
                cancelled: &mut cancelled,
            };
            let outcome = (task.cb)(&mut ctx);
            fired += 1;

            if let (Some(period), TimerFire::Rearm) = (task.period_ms, outcome) {
                if !cancelled.contains(&deadline.id) {
                    let period = period.max(1);
                    // Drift-free from the previous due time; skip ahead if
                    // the loop fell behind by more than one period.
                    let mut due = deadline.due_ms + period;
                    if due <= self.now_ms {
                        due = self.now_ms + period;
                    }
                    self.tasks.insert(deadline.id, task);
                    self.push_deadline(deadline.id, due);
                }
            }
        }

        // Cancels aimed at timers due in later ticks.
        for id in cancelled {
            self.tasks.remove(&id);
        }
        fired
    }

    fn push_deadline(&mut self, id: TimerId, due_ms: u64) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(Deadline { due_ms, seq, id }));
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;

    fn log_cb(log: &Rc<RefCell<Vec<u32>>>, tag: u32) -> impl FnMut(&mut TimerContext) -> TimerFire {
        let log = log.clone();
        move |_ctx| {
            log.borrow_mut().push(tag);
            TimerFire::Rearm
        }
    }

    #[test]
    fn fires_in_due_order_with_insertion_tiebreak() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut wheel = TimerWheel::new();
        wheel.schedule(20, None, log_cb(&log, 1));
        wheel.schedule(10, None, log_cb(&log, 2));
        wheel.schedule(10, None, log_cb(&log, 3));
        wheel.schedule(5, None, log_cb(&log, 4));

        assert_eq!(wheel.tick(4), 0);
        assert_eq!(wheel.tick(25), 4);
        assert_eq!(*log.borrow(), vec![4, 2, 3, 1]);
        assert!(wheel.is_empty());
    }

    #[test]
    fn never_fires_before_due() {
        let mut wheel = TimerWheel::new();
        let fired = Rc::new(RefCell::new(Vec::new()));
        wheel.schedule(10, None, log_cb(&fired, 1));
        for now in 0..10 {
            assert_eq!(wheel.tick(now), 0, "fired early at {now}");
        }
        assert_eq!(wheel.tick(10), 1);
    }

    #[test]
    fn periodic_rearms_until_stop() {
        let mut wheel = TimerWheel::new();
        let count = Rc::new(RefCell::new(0u32));
        let c = count.clone();
        wheel.schedule(10, Some(10), move |_ctx| {
            *c.borrow_mut() += 1;
            if *c.borrow() == 3 {
                TimerFire::Stop
            } else {
                TimerFire::Rearm
            }
        });
        for now in [10, 20, 30, 40, 50] {
            wheel.tick(now);
        }
        assert_eq!(*count.borrow(), 3);
        assert!(wheel.is_empty());
    }

    #[test]
    fn cancel_disarms() {
        let mut wheel = TimerWheel::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let id = wheel.schedule(10, Some(10), log_cb(&log, 1));
        assert!(wheel.cancel(id));
        assert!(!wheel.cancel(id));
        assert_eq!(wheel.tick(100), 0);
        assert!(log.borrow().is_empty());
        assert_eq!(wheel.next_due(), None);
    }

    #[test]
    fn cancel_during_fire_stops_periodic_timer() {
        let mut wheel = TimerWheel::new();
        let count = Rc::new(RefCell::new(0u32));
        let c = count.clone();
        wheel.schedule(10, Some(10), move |ctx| {
            *c.borrow_mut() += 1;
            ctx.cancel(ctx.id);
            TimerFire::Rearm
        });
        assert_eq!(wheel.tick(10), 1);
        assert_eq!(wheel.tick(100), 0);
        assert_eq!(*count.borrow(), 1);
        assert!(wheel.is_empty());
    }

    #[test]
    fn cancel_of_a_later_timer_in_same_tick() {
        let mut wheel = TimerWheel::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let victim = {
            let log = log.clone();
            wheel.schedule(10, None, move |_ctx| {
                log.borrow_mut().push(2);
                TimerFire::Rearm
            })
        };
        // Fires first (earlier due), cancels the victim before it surfaces.
        let l = log.clone();
        wheel.schedule(5, None, move |ctx| {
            l.borrow_mut().push(1);
            ctx.cancel(victim);
            TimerFire::Rearm
        });
        assert_eq!(wheel.tick(50), 1);
        assert_eq!(*log.borrow(), vec![1]);
        assert!(wheel.is_empty());
    }

    #[test]
    fn next_due_skips_stale_deadlines() {
        let mut wheel = TimerWheel::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let id = wheel.schedule(5, None, log_cb(&log, 1));
        wheel.schedule(10, None, log_cb(&log, 2));
        wheel.cancel(id);
        assert_eq!(wheel.next_due(), Some(10));
    }
}
