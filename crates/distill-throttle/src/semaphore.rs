//! Resizable counting semaphore.

use std::pin::pin;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::ThrottleError;

#[derive(Debug)]
struct SemState {
    limit: usize,
    in_flight: usize,
}

/// A counting semaphore whose capacity can be changed while held.
///
/// Growing the limit wakes parked waiters up to the new capacity. Shrinking
/// never cancels in-flight holders; it only prevents new acquisitions until
/// the in-flight count drains below the new limit.
///
/// `tokio::sync::Semaphore` cannot shrink below its outstanding permit
/// count, hence the hand-rolled state + [`Notify`] here. Waiters always
/// re-check the state after registering for notification, which closes the
/// missed-wakeup window.
#[derive(Debug)]
pub struct AdaptiveSemaphore {
    state: Mutex<SemState>,
    notify: Notify,
}

impl AdaptiveSemaphore {
    pub fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SemState {
                limit,
                in_flight: 0,
            }),
            notify: Notify::new(),
        })
    }

    /// Acquire one unit, waiting until the in-flight count is below the
    /// limit or `cancel` fires. The unit is released when the returned
    /// [`Permit`] drops.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<Permit<'_>, ThrottleError> {
        loop {
            {
                let mut st = self.state.lock();
                if st.in_flight < st.limit {
                    st.in_flight += 1;
                    return Ok(Permit { sem: self });
                }
            }

            let mut notified = pin!(self.notify.notified());
            notified.as_mut().enable();

            // A release between the check above and enable() would otherwise
            // be lost; re-check before parking.
            {
                let st = self.state.lock();
                if st.in_flight < st.limit {
                    continue;
                }
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = cancel.cancelled() => return Err(ThrottleError::Cancelled),
            }
        }
    }

    /// Set a new capacity. Growth wakes all waiters so they can race for
    /// the freed units; shrink takes effect as holders drain.
    pub fn set_limit(&self, limit: usize) {
        let grew = {
            let mut st = self.state.lock();
            let grew = limit > st.limit;
            st.limit = limit;
            grew
        };
        metrics::gauge!("throttle_concurrency_limit").set(limit as f64);
        if grew {
            self.notify.notify_waiters();
        }
    }

    /// Current capacity.
    pub fn limit(&self) -> usize {
        self.state.lock().limit
    }

    /// Units currently held.
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight
    }

    fn release(&self) {
        {
            let mut st = self.state.lock();
            debug_assert!(st.in_flight > 0);
            st.in_flight = st.in_flight.saturating_sub(1);
        }
        self.notify.notify_one();
    }
}

/// RAII guard for one semaphore unit.
#[derive(Debug)]
pub struct Permit<'a> {
    sem: &'a AdaptiveSemaphore,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        self.sem.release();
    }
}
