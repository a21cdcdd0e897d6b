//! Leaky-bucket rate limiter.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::ThrottleError;

#[derive(Debug)]
struct LimiterState {
    rpm: u32,
    /// Emission interval derived from `rpm`; `None` when the limiter is
    /// disabled (`rpm == 0`).
    interval: Option<Duration>,
    /// Earliest instant at which the next permit may be granted.
    next_grant: Instant,
}

fn interval_for(rpm: u32) -> Option<Duration> {
    if rpm == 0 {
        None
    } else {
        Some(Duration::from_secs_f64(60.0 / rpm as f64))
    }
}

/// A single-resource leaky bucket parameterized in requests per minute.
///
/// One permit is emitted every `60s / rpm`. Unused capacity from a quiet
/// period never accumulates beyond a single immediate permit, so there is
/// no burst behavior. The rate can be changed at any time with
/// [`RateLimiter::set_rpm`]; parked waiters pick up the new interval
/// without being dropped or granted twice, and permits that were already
/// granted are never retracted.
#[derive(Debug)]
pub struct RateLimiter {
    state: Mutex<LimiterState>,
    reconfigured: Notify,
}

impl RateLimiter {
    /// Create a limiter emitting `rpm` permits per minute. `rpm == 0`
    /// disables shaping: [`RateLimiter::acquire`] returns immediately.
    pub fn new(rpm: u32) -> Self {
        Self {
            state: Mutex::new(LimiterState {
                rpm,
                interval: interval_for(rpm),
                next_grant: Instant::now(),
            }),
            reconfigured: Notify::new(),
        }
    }

    /// Current requests-per-minute setting.
    pub fn rpm(&self) -> u32 {
        self.state.lock().rpm
    }

    /// Reconfigure the emission rate.
    ///
    /// A raised rate takes effect immediately: the pending grant time is
    /// pulled forward to at most `now + new_interval` and sleeping waiters
    /// are woken to recompute. A lowered rate applies from the next grant;
    /// a permit already scheduled is not pushed out further.
    pub fn set_rpm(&self, rpm: u32) {
        {
            let mut st = self.state.lock();
            if st.rpm == rpm {
                return;
            }
            st.rpm = rpm;
            st.interval = interval_for(rpm);
            let now = Instant::now();
            match st.interval {
                None => st.next_grant = now,
                Some(iv) => st.next_grant = st.next_grant.min(now + iv),
            }
        }
        metrics::gauge!("throttle_rate_limit_rpm").set(rpm as f64);
        self.reconfigured.notify_waiters();
    }

    /// Wait for the next permit.
    ///
    /// Returns immediately when the limiter is disabled. Fails with
    /// [`ThrottleError::Cancelled`] when `cancel` fires first.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), ThrottleError> {
        loop {
            let wait = {
                let mut st = self.state.lock();
                let Some(interval) = st.interval else {
                    return Ok(());
                };
                let now = Instant::now();
                if st.next_grant <= now {
                    // Quiet periods do not bank permits: the next grant is
                    // scheduled relative to now, not to the stale deadline.
                    st.next_grant = now + interval;
                    return Ok(());
                }
                st.next_grant - now
            };

            let reconfigured = self.reconfigured.notified();
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = reconfigured => {}
                _ = cancel.cancelled() => return Err(ThrottleError::Cancelled),
            }
        }
    }
}
