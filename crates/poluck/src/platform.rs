use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Trusted time and monotonic counter exposed to the enclave.
pub trait Platform: Send {
    /// Time elapsed since an arbitrary fixed origin.
    fn trusted_time(&self) -> Duration;

    fn read_counter(&self) -> u64;

    /// Increment the counter and return the new value.
    fn increment_counter(&self) -> u64;
}

/// Platform backed by the host's monotonic clock. Inside a runtime with a
/// paused clock it follows tokio's virtual time.
pub struct SystemPlatform {
    origin: Instant,
    counter: AtomicU64,
}

impl SystemPlatform {
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            counter: AtomicU64::new(0),
        }
    }
}

impl Default for SystemPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for SystemPlatform {
    fn trusted_time(&self) -> Duration {
        self.origin.elapsed()
    }

    fn read_counter(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }

    fn increment_counter(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[derive(Default)]
struct ManualState {
    now: Duration,
    counter: u64,
}

/// Hand-driven platform. Clones share the same clock and counter, so a test can
/// keep a handle after moving one into an enclave.
#[derive(Clone, Default)]
pub struct ManualPlatform {
    state: Arc<Mutex<ManualState>>,
}

impl ManualPlatform {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        self.state.lock().now += by;
    }

    /// Overwrite the counter, as a rolled-back or cloned environment would.
    pub fn set_counter(&self, value: u64) {
        self.state.lock().counter = value;
    }
}

impl Platform for ManualPlatform {
    fn trusted_time(&self) -> Duration {
        self.state.lock().now
    }

    fn read_counter(&self) -> u64 {
        self.state.lock().counter
    }

    fn increment_counter(&self) -> u64 {
        let mut state = self.state.lock();
        state.counter += 1;
        state.counter
    }
}
