//! Cross-stream completion tokens.
//!
//! An [`Event`] is recorded on one stream and waited on by another stream or by
//! the host. Each record issues a new target generation; a wait captures the
//! target current at the time it is enqueued, so re-recording the event later
//! never satisfies (or blocks) an earlier wait.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Default)]
struct EventState {
    /// Generations issued by `record`
    issued: u64,
    /// Highest generation retired by a stream
    completed: u64,
    /// Host clock when the last generation retired
    timestamp: Option<Instant>,
}

#[derive(Debug)]
struct EventInner {
    name: String,
    state: Mutex<EventState>,
    cond: Condvar,
}

/// Completion token shared between streams and the controlling thread.
#[derive(Debug, Clone)]
pub struct Event {
    inner: Arc<EventInner>,
}

impl Event {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(EventInner {
                name: name.into(),
                state: Mutex::new(EventState::default()),
                cond: Condvar::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Issue a new generation; returns the target a stream must retire.
    pub(crate) fn issue(&self) -> u64 {
        let mut state = self.inner.state.lock();
        state.issued += 1;
        state.issued
    }

    /// Generation a wait enqueued now must observe.
    pub(crate) fn current_target(&self) -> u64 {
        self.inner.state.lock().issued
    }

    pub(crate) fn complete(&self, target: u64) {
        let mut state = self.inner.state.lock();
        if target > state.completed {
            state.completed = target;
        }
        state.timestamp = Some(Instant::now());
        self.inner.cond.notify_all();
    }

    /// Block until `target` has retired. Target 0 (never recorded) returns at once.
    pub(crate) fn wait_for(&self, target: u64) {
        let mut state = self.inner.state.lock();
        while state.completed < target {
            self.inner.cond.wait(&mut state);
        }
    }

    /// True when every issued generation has retired.
    pub fn query(&self) -> bool {
        let state = self.inner.state.lock();
        state.completed >= state.issued
    }

    /// Block the host until the latest record has retired.
    pub fn synchronize(&self) {
        let target = self.current_target();
        self.wait_for(target);
    }

    /// Spin on [`Event::query`], yielding between polls.
    pub fn synchronize_polling(&self) {
        while !self.query() {
            std::thread::yield_now();
        }
    }

    pub fn timestamp(&self) -> Option<Instant> {
        self.inner.state.lock().timestamp
    }

    /// Milliseconds between this event's and `end`'s last retirement.
    ///
    /// `None` while either event is still pending or has never been recorded.
    pub fn elapsed_ms(&self, end: &Event) -> Option<f64> {
        if !self.query() || !end.query() {
            return None;
        }
        let start = self.timestamp()?;
        let stop = end.timestamp()?;
        Some(
            stop.checked_duration_since(start)
                .map(|d| d.as_secs_f64() * 1e3)
                .unwrap_or(0.0),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_unrecorded_event_is_complete() {
        let ev = Event::new("idle");
        assert!(ev.query());
        ev.synchronize();
        assert!(ev.timestamp().is_none());
    }

    #[test]
    fn test_wait_captures_target() {
        let ev = Event::new("gate");
        let first = ev.issue();
        let second = ev.issue();
        assert!(!ev.query());

        ev.complete(first);
        ev.wait_for(first);
        assert!(!ev.query());

        let waiter = {
            let ev = ev.clone();
            std::thread::spawn(move || ev.wait_for(second))
        };
        std::thread::sleep(Duration::from_millis(5));
        ev.complete(second);
        waiter.join().unwrap();
        assert!(ev.query());
    }

    #[test]
    fn test_elapsed_between_events() {
        let start = Event::new("start");
        let stop = Event::new("stop");
        let a = start.issue();
        let b = stop.issue();
        assert!(start.elapsed_ms(&stop).is_none());

        start.complete(a);
        std::thread::sleep(Duration::from_millis(2));
        stop.complete(b);
        let ms = start.elapsed_ms(&stop).unwrap();
        assert!(ms >= 1.0, "elapsed {ms} ms");
    }
}
