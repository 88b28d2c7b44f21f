//! Per-session event loop
//!
//! All connections of a session are driven from one FIFO queue. Handlers run
//! to completion; the only suspension points are socket readiness and timers,
//! and timers are plain queue entries that can be cancelled before they fire.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Handle of a scheduled timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

/// What a timer guards
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Transport connect did not finish within the active timeout
    Connect,
    /// No Login Response within the login (or auth) timeout
    Login,
    /// Backoff before the next login attempt
    Reconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// A PDU is ready to be read on the connection
    RecvPdu,
    /// The transport should be polled for connect completion
    Poll,
    /// A timer expired
    Timer(TimerKind),
}

/// One unit of work for a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub cid: u16,
    pub kind: EventKind,
}

impl Event {
    pub fn new(cid: u16, kind: EventKind) -> Self {
        Event { cid, kind }
    }
}

#[derive(Debug)]
struct Timer {
    id: TimerId,
    cid: u16,
    kind: TimerKind,
    deadline: Instant,
}

/// Event queue plus timer wheel of one session
#[derive(Debug, Default)]
pub struct Mainloop {
    queue: VecDeque<Event>,
    timers: Vec<Timer>,
    next_timer: u64,
}

impl Mainloop {
    pub fn new() -> Self {
        Mainloop::default()
    }

    /// Queue an event behind everything already pending
    pub fn post(&mut self, event: Event) {
        self.queue.push_back(event);
    }

    /// Take the oldest pending event
    pub fn pop(&mut self) -> Option<Event> {
        self.queue.pop_front()
    }

    /// Number of queued events (timers not included)
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Nothing queued and nothing armed
    pub fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.timers.is_empty()
    }

    /// Arm a timer firing `after` from `now`
    pub fn schedule(&mut self, cid: u16, kind: TimerKind, after: Duration, now: Instant) -> TimerId {
        self.next_timer += 1;
        let id = TimerId(self.next_timer);
        log::debug!("cid {}: arm {:?} timer {:?} in {:?}", cid, kind, id, after);
        self.timers.push(Timer {
            id,
            cid,
            kind,
            deadline: now + after,
        });
        id
    }

    /// Disarm a timer. Returns false if it already fired or never existed.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        let before = self.timers.len();
        self.timers.retain(|t| t.id != id);
        let cancelled = self.timers.len() != before;
        if cancelled {
            log::debug!("cancel timer {:?}", id);
        }
        cancelled
    }

    /// True if a timer of `kind` is armed for `cid`
    pub fn is_armed(&self, cid: u16, kind: TimerKind) -> bool {
        self.timers.iter().any(|t| t.cid == cid && t.kind == kind)
    }

    /// Drop every timer and queued event of a connection
    pub fn cancel_cnx(&mut self, cid: u16) {
        self.timers.retain(|t| t.cid != cid);
        self.queue.retain(|e| e.cid != cid);
    }

    /// Earliest armed deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.iter().map(|t| t.deadline).min()
    }

    /// Move every timer due at `now` into the queue, earliest first
    pub fn fire_expired(&mut self, now: Instant) -> usize {
        let mut due: Vec<Timer> = Vec::new();
        let mut i = 0;
        while i < self.timers.len() {
            if self.timers[i].deadline <= now {
                due.push(self.timers.swap_remove(i));
            } else {
                i += 1;
            }
        }
        due.sort_by_key(|t| (t.deadline, t.id));

        for t in &due {
            log::debug!("cid {}: {:?} timer {:?} fired", t.cid, t.kind, t.id);
            self.queue.push_back(Event::new(t.cid, EventKind::Timer(t.kind)));
        }
        due.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_are_fifo() {
        let mut ml = Mainloop::new();
        ml.post(Event::new(0, EventKind::Poll));
        ml.post(Event::new(1, EventKind::RecvPdu));
        ml.post(Event::new(0, EventKind::RecvPdu));

        assert_eq!(ml.pending(), 3);
        assert_eq!(ml.pop(), Some(Event::new(0, EventKind::Poll)));
        assert_eq!(ml.pop(), Some(Event::new(1, EventKind::RecvPdu)));
        assert_eq!(ml.pop(), Some(Event::new(0, EventKind::RecvPdu)));
        assert_eq!(ml.pop(), None);
    }

    #[test]
    fn test_timer_fires_once_when_due() {
        let mut ml = Mainloop::new();
        let start = Instant::now();
        ml.schedule(2, TimerKind::Login, Duration::from_secs(15), start);

        assert_eq!(ml.fire_expired(start + Duration::from_secs(14)), 0);
        assert!(ml.is_armed(2, TimerKind::Login));

        assert_eq!(ml.fire_expired(start + Duration::from_secs(15)), 1);
        assert_eq!(
            ml.pop(),
            Some(Event::new(2, EventKind::Timer(TimerKind::Login)))
        );
        assert_eq!(ml.fire_expired(start + Duration::from_secs(60)), 0);
        assert!(ml.is_idle());
    }

    #[test]
    fn test_expired_timers_queue_in_deadline_order() {
        let mut ml = Mainloop::new();
        let start = Instant::now();
        ml.schedule(1, TimerKind::Reconnect, Duration::from_secs(3), start);
        ml.schedule(0, TimerKind::Connect, Duration::from_secs(1), start);

        assert_eq!(ml.next_deadline(), Some(start + Duration::from_secs(1)));
        assert_eq!(ml.fire_expired(start + Duration::from_secs(5)), 2);
        assert_eq!(ml.pop().unwrap().cid, 0);
        assert_eq!(ml.pop().unwrap().cid, 1);
    }

    #[test]
    fn test_cancelled_timer_never_fires() {
        let mut ml = Mainloop::new();
        let start = Instant::now();
        let id = ml.schedule(0, TimerKind::Login, Duration::from_secs(1), start);

        assert!(ml.cancel(id));
        assert!(!ml.cancel(id));
        assert_eq!(ml.fire_expired(start + Duration::from_secs(2)), 0);
    }

    #[test]
    fn test_cancel_cnx_drops_only_that_connection() {
        let mut ml = Mainloop::new();
        let start = Instant::now();
        ml.schedule(0, TimerKind::Login, Duration::from_secs(1), start);
        ml.schedule(1, TimerKind::Login, Duration::from_secs(1), start);
        ml.post(Event::new(0, EventKind::RecvPdu));
        ml.post(Event::new(1, EventKind::RecvPdu));

        ml.cancel_cnx(0);

        assert_eq!(ml.pop(), Some(Event::new(1, EventKind::RecvPdu)));
        assert_eq!(ml.pop(), None);
        assert_eq!(ml.fire_expired(start + Duration::from_secs(1)), 1);
        assert_eq!(ml.pop().unwrap().cid, 1);
    }
}
