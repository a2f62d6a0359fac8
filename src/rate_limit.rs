use std::num::NonZeroU32;
use std::sync::Arc;

use governor::clock::DefaultClock;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};

/// Per-key token bucket, used both for `/auth/token` (keyed by source IP)
/// and payment-create (keyed by client id).
#[derive(Clone)]
pub struct KeyedRateLimiter {
    inner: Arc<RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>>,
}

impl KeyedRateLimiter {
    pub fn per_minute(limit: u32) -> Self {
        let limit = NonZeroU32::new(limit.max(1)).unwrap();
        let quota = Quota::per_minute(limit);
        Self {
            inner: Arc::new(RateLimiter::keyed(quota)),
        }
    }

    pub fn check(&self, key: &str) -> bool {
        self.inner.check_key(&key.to_string()).is_ok()
    }
}
