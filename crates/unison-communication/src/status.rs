use std::{
    sync::{Condvar, Mutex},
    time::Duration,
};

use crate::AwaitTimeout;

/// Shared monotonic status word guarded by a mutex + condvar.
///
/// One thread advances the status, others wait for it to reach a level.
/// The wait predicate is `status >= target`, so a waiter is released by any
/// later stage as well (including an error stage ordered above everything
/// else); callers inspect the returned value to tell which one fired.
pub struct StatusCell<T> {
    state: Mutex<T>,
    changed: Condvar,
}

impl<T: Copy + Ord> StatusCell<T> {
    pub fn new(initial: T) -> Self {
        Self { state: Mutex::new(initial), changed: Condvar::new() }
    }

    pub fn set(&self, status: T) {
        let mut state = self.state.lock().expect("status cell poisoned");
        *state = status;
        self.changed.notify_all();
    }

    pub fn get(&self) -> T {
        *self.state.lock().expect("status cell poisoned")
    }

    /// Waits until the status reaches at least `target` and returns the
    /// status actually observed. `None` waits forever.
    pub fn await_reached(&self, target: T, timeout: Option<Duration>) -> Result<T, AwaitTimeout> {
        let mut state = self.state.lock().expect("status cell poisoned");
        match timeout {
            None => {
                while *state < target {
                    state = self.changed.wait(state).expect("status cell poisoned");
                }
                Ok(*state)
            }
            Some(timeout) => {
                let (state, res) = self
                    .changed
                    .wait_timeout_while(state, timeout, |state| *state < target)
                    .expect("status cell poisoned");
                if res.timed_out() && *state < target { Err(AwaitTimeout) } else { Ok(*state) }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::{sync::Arc, thread, time::Duration};

    use super::*;

    #[test]
    fn await_sees_level_reached_before_wait() {
        let cell = StatusCell::new(3u32);
        assert_eq!(cell.await_reached(1, Some(Duration::from_millis(1))), Ok(3));
    }

    #[test]
    fn await_released_by_later_stage() {
        let cell = Arc::new(StatusCell::new(0u32));
        let waiter = {
            let cell = cell.clone();
            thread::spawn(move || cell.await_reached(2, None))
        };
        thread::sleep(Duration::from_millis(20));
        cell.set(5);
        assert_eq!(waiter.join().unwrap(), Ok(5));
    }

    #[test]
    fn await_times_out() {
        let cell = StatusCell::new(0u32);
        assert_eq!(cell.await_reached(1, Some(Duration::from_millis(10))), Err(AwaitTimeout));
        assert_eq!(cell.get(), 0);
    }
}
