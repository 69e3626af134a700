use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::error::{CoreError, CoreResult};

/// Idle time beyond this is not turned into burst allowance.
const MAX_CREDIT: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct ThrottleState {
    window_start: Instant,
    window_bytes: u64,
    limit_bytes_per_sec: u64,
}

impl ThrottleState {
    fn new(limit_bytes_per_sec: u64) -> Self {
        Self {
            window_start: Instant::now(),
            window_bytes: 0,
            limit_bytes_per_sec,
        }
    }

    fn reserve_sleep(&mut self, bytes: u64, now: Instant) -> Duration {
        if self.limit_bytes_per_sec == 0 {
            return Duration::ZERO;
        }
        let limit = self.limit_bytes_per_sec as f64;
        let owed = self.window_bytes as f64 / limit;
        let idle = now.saturating_duration_since(self.window_start).as_secs_f64() - owed;
        if idle > MAX_CREDIT.as_secs_f64() {
            self.window_start = now;
            self.window_bytes = 0;
        }
        self.window_bytes = self.window_bytes.saturating_add(bytes);
        let expected = self.window_bytes as f64 / limit;
        let elapsed = now.saturating_duration_since(self.window_start).as_secs_f64();
        if expected > elapsed {
            Duration::from_secs_f64(expected - elapsed)
        } else {
            Duration::ZERO
        }
    }
}

/// Shared bytes-per-second limiter for all chunk tasks of a download.
/// A limit of zero disables throttling.
#[derive(Debug, Clone)]
pub struct Throttle {
    state: Arc<Mutex<ThrottleState>>,
}

impl Throttle {
    pub fn new(limit_bytes_per_sec: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(ThrottleState::new(limit_bytes_per_sec))),
        }
    }

    pub fn limit(&self) -> u64 {
        self.state
            .lock()
            .map(|state| state.limit_bytes_per_sec)
            .unwrap_or(0)
    }

    /// Changing the limit restarts the accounting window so earlier bytes are
    /// not billed against the new rate.
    pub fn set_limit(&self, limit_bytes_per_sec: u64) {
        if let Ok(mut state) = self.state.lock() {
            *state = ThrottleState::new(limit_bytes_per_sec);
        }
    }

    /// Starts a fresh accounting window with the current limit.
    pub fn restart(&self) {
        if let Ok(mut state) = self.state.lock() {
            let limit = state.limit_bytes_per_sec;
            *state = ThrottleState::new(limit);
        }
    }

    pub fn delay_for(&self, bytes: u64) -> Duration {
        self.delay_at(bytes, Instant::now())
    }

    fn delay_at(&self, bytes: u64, now: Instant) -> Duration {
        self.state
            .lock()
            .map(|mut state| state.reserve_sleep(bytes, now))
            .unwrap_or(Duration::ZERO)
    }

    pub async fn throttle(&self, bytes: u64, cancel: &CancellationToken) -> CoreResult<()> {
        let delay = self.delay_for(bytes);
        if delay.is_zero() {
            return Ok(());
        }
        tokio::select! {
            _ = cancel.cancelled() => Err(CoreError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}
