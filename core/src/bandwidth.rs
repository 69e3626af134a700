use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Samples shorter than this are accumulated instead of producing a rate.
pub const DEFAULT_SAMPLE_WINDOW: Duration = Duration::from_millis(1000);

#[derive(Debug)]
struct BandwidthState {
    window: Duration,
    checkpoint: Instant,
    pending_bytes: u64,
    speed: f64,
    average_speed: f64,
    samples: u64,
}

impl BandwidthState {
    fn new(window: Duration, now: Instant) -> Self {
        Self {
            window,
            checkpoint: now,
            pending_bytes: 0,
            speed: 0.0,
            average_speed: 0.0,
            samples: 0,
        }
    }

    fn sample(&mut self, bytes: u64, now: Instant) {
        self.pending_bytes = self.pending_bytes.saturating_add(bytes);
        let elapsed = now.saturating_duration_since(self.checkpoint);
        if elapsed.is_zero() || elapsed < self.window {
            return;
        }
        let speed = self.pending_bytes as f64 / elapsed.as_secs_f64();
        self.speed = speed;
        self.average_speed =
            (self.average_speed * self.samples as f64 + speed) / (self.samples + 1) as f64;
        self.samples += 1;
        self.pending_bytes = 0;
        self.checkpoint = now;
    }
}

/// Instantaneous and running-average transfer speed in bytes per second.
#[derive(Debug)]
pub struct Bandwidth {
    state: Mutex<BandwidthState>,
}

impl Default for Bandwidth {
    fn default() -> Self {
        Self::with_window(DEFAULT_SAMPLE_WINDOW)
    }
}

impl Bandwidth {
    pub fn with_window(window: Duration) -> Self {
        Self {
            state: Mutex::new(BandwidthState::new(window, Instant::now())),
        }
    }

    pub fn calculate_speed(&self, bytes: u64) {
        self.calculate_speed_at(bytes, Instant::now());
    }

    pub fn calculate_speed_at(&self, bytes: u64, now: Instant) {
        if let Ok(mut state) = self.state.lock() {
            state.sample(bytes, now);
        }
    }

    pub fn speed(&self) -> f64 {
        self.state.lock().map(|state| state.speed).unwrap_or(0.0)
    }

    pub fn average_speed(&self) -> f64 {
        self.state
            .lock()
            .map(|state| state.average_speed)
            .unwrap_or(0.0)
    }

    pub fn reset(&self) {
        if let Ok(mut state) = self.state.lock() {
            let window = state.window;
            *state = BandwidthState::new(window, Instant::now());
        }
    }
}
