use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// A single injectable clock source, per spec §4.1 ("the engine reads monotonic time
/// from a single clock source (injectable for testing)").
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before unix epoch")
            .as_millis() as i64
    }
}

/// A settable clock for deterministic tests of cursor monotonicity, flood-wait
/// expiry, and rate-limiter window aggregation.
#[derive(Debug, Default)]
pub struct MockClock {
    millis: AtomicI64,
}

impl MockClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            millis: AtomicI64::new(start_ms),
        }
    }

    pub fn advance_ms(&self, delta: i64) {
        self.millis.fetch_add(delta, Ordering::SeqCst);
    }

    pub fn set_ms(&self, value: i64) {
        self.millis.store(value, Ordering::SeqCst);
    }
}

impl Clock for MockClock {
    fn now_ms(&self) -> i64 {
        self.millis.load(Ordering::SeqCst)
    }
}

/// A 63-bit positive random request nonce, per spec §4.1.
pub fn random_nonce() -> i64 {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    rng.gen_range(1..=i64::MAX)
}
