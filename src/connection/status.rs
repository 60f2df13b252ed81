use crate::error::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Lifecycle status of a connection.
///
/// Ordered by progress: `Init`, then one of `ConnectRequested` or
/// `AcceptPending`, then `Connected`, `ShutdownRequested` and `Down`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnStatus {
    Init,
    ConnectRequested,
    AcceptPending,
    Connected,
    ShutdownRequested,
    Down,
}

impl ConnStatus {
    #[inline]
    fn rank(self) -> u8 {
        match self {
            ConnStatus::Init => 0,
            ConnStatus::ConnectRequested | ConnStatus::AcceptPending => 1,
            ConnStatus::Connected => 2,
            ConnStatus::ShutdownRequested => 3,
            ConnStatus::Down => 4,
        }
    }

    /// Whether moving from `self` to `next` goes forward.
    #[inline]
    pub fn can_advance_to(self, next: ConnStatus) -> bool {
        next.rank() > self.rank()
    }

    /// `Connected` or `Down`: the states a readiness waiter stops at.
    #[inline]
    pub fn is_settled(self) -> bool {
        matches!(self, ConnStatus::Connected | ConnStatus::Down)
    }

    #[inline]
    pub fn is_down(self) -> bool {
        self == ConnStatus::Down
    }
}

/// Status guarded by its own mutex, with a condition variable for waiters.
///
/// Status only moves forward; every change wakes all waiters, which re-check
/// their predicate before returning.
#[derive(Debug)]
pub struct StatusCell {
    status: Mutex<ConnStatus>,
    cond: Condvar,
}

impl StatusCell {
    pub fn new(initial: ConnStatus) -> Self {
        Self {
            status: Mutex::new(initial),
            cond: Condvar::new(),
        }
    }

    pub fn get(&self) -> ConnStatus {
        *self.status.lock()
    }

    /// Move to `next` if that goes forward. Returns the previous status when
    /// the move happened.
    pub fn advance(&self, next: ConnStatus) -> Option<ConnStatus> {
        let mut status = self.status.lock();
        let prev = *status;
        if !prev.can_advance_to(next) {
            return None;
        }
        *status = next;
        drop(status);
        self.cond.notify_all();
        Some(prev)
    }

    /// Block until `pred` holds, or until `timeout` elapses.
    ///
    /// Returns the status that satisfied the predicate, or `Error::Timeout`.
    pub fn wait_for<F>(&self, timeout: Option<Duration>, mut pred: F) -> Result<ConnStatus>
    where
        F: FnMut(ConnStatus) -> bool,
    {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut status = self.status.lock();
        while !pred(*status) {
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut status, deadline).timed_out() && !pred(*status) {
                        return Err(Error::Timeout);
                    }
                }
                None => self.cond.wait(&mut status),
            }
        }
        Ok(*status)
    }

    /// Block while the status is neither `Connected` nor `Down`.
    pub fn wait_settled(&self, timeout: Option<Duration>) -> Result<ConnStatus> {
        self.wait_for(timeout, ConnStatus::is_settled)
    }

    pub fn wait_down(&self, timeout: Option<Duration>) -> Result<()> {
        self.wait_for(timeout, ConnStatus::is_down).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_status_monotonic() {
        let cell = StatusCell::new(ConnStatus::Init);
        assert_eq!(cell.advance(ConnStatus::ConnectRequested), Some(ConnStatus::Init));
        assert_eq!(cell.advance(ConnStatus::AcceptPending), None);
        assert_eq!(cell.advance(ConnStatus::Init), None);
        assert_eq!(cell.advance(ConnStatus::Connected), Some(ConnStatus::ConnectRequested));
        assert_eq!(cell.advance(ConnStatus::Down), Some(ConnStatus::Connected));
        assert_eq!(cell.advance(ConnStatus::ShutdownRequested), None);
        assert_eq!(cell.advance(ConnStatus::Down), None);
        assert_eq!(cell.get(), ConnStatus::Down);
    }

    #[test]
    fn test_every_path_is_monotonic() {
        let all = [
            ConnStatus::Init,
            ConnStatus::ConnectRequested,
            ConnStatus::AcceptPending,
            ConnStatus::Connected,
            ConnStatus::ShutdownRequested,
            ConnStatus::Down,
        ];
        for from in all {
            assert!(!from.can_advance_to(from));
            assert!(!ConnStatus::Down.can_advance_to(from));
        }
    }

    #[test]
    fn test_wait_settled_wakes_on_connected() {
        let cell = Arc::new(StatusCell::new(ConnStatus::ConnectRequested));
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let cell = cell.clone();
                thread::spawn(move || cell.wait_settled(Some(Duration::from_secs(5))))
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        cell.advance(ConnStatus::Connected);

        for w in waiters {
            assert_eq!(w.join().unwrap().unwrap(), ConnStatus::Connected);
        }
    }

    #[test]
    fn test_wait_settled_wakes_on_down() {
        let cell = Arc::new(StatusCell::new(ConnStatus::AcceptPending));
        let waiter = {
            let cell = cell.clone();
            thread::spawn(move || cell.wait_settled(None))
        };
        thread::sleep(Duration::from_millis(20));
        cell.advance(ConnStatus::Down);
        assert_eq!(waiter.join().unwrap().unwrap(), ConnStatus::Down);
    }

    #[test]
    fn test_wait_times_out() {
        let cell = StatusCell::new(ConnStatus::ConnectRequested);
        let res = cell.wait_settled(Some(Duration::from_millis(10)));
        assert!(matches!(res, Err(Error::Timeout)));
    }

    #[test]
    fn test_wait_returns_immediately_when_settled() {
        let cell = StatusCell::new(ConnStatus::Down);
        assert_eq!(cell.wait_settled(Some(Duration::ZERO)).unwrap(), ConnStatus::Down);
        assert!(cell.wait_down(Some(Duration::ZERO)).is_ok());
    }
}
