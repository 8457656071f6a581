use std::time::Duration;

use arbor_store::StoreTransaction;
use rand::Rng;
use tracing::{debug, warn};

use crate::config::LockConfig;
use crate::error::{CacheError, CacheResult};

/// Bounded, jittered retry loop around one batch lock request.
#[derive(Clone, Debug)]
pub struct LockRetry {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl LockRetry {
    pub fn new(config: &LockConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: config.base_delay(),
            max_delay: config.max_delay(),
        }
    }

    /// Wait after failed attempt `attempt` (1-based), before jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt).min(self.max_delay)
    }

    fn jitter(&self) -> Duration {
        let bound = self.base_delay.as_millis() as u64;
        if bound == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=bound))
    }

    /// Lock every key in `keys` through `txn`, retrying on contention.
    ///
    /// Returns the number of attempts used. After `max_attempts` failed
    /// attempts returns [`CacheError::LockTimeout`]; no key is held then.
    pub fn acquire(&self, txn: &mut StoreTransaction<'_>, keys: &[String]) -> CacheResult<u32> {
        for attempt in 1..=self.max_attempts {
            if txn.lock(keys)? {
                debug!(keys = keys.len(), attempt, "batch lock acquired");
                return Ok(attempt);
            }
            if attempt < self.max_attempts {
                let delay = self.backoff(attempt) + self.jitter();
                warn!(keys = keys.len(), attempt, delay_ms = delay.as_millis() as u64, "batch lock contended, retrying");
                std::thread::sleep(delay);
            }
        }
        warn!(keys = keys.len(), attempts = self.max_attempts, "batch lock not acquired");
        Err(CacheError::LockTimeout {
            keys: keys.to_vec(),
            attempts: self.max_attempts,
        })
    }
}
