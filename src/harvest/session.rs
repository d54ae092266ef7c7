use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::SessionStrategy;
use crate::model::{CrawlSession, Device};

/// Hands out session stamps that strictly increase within a run.
#[derive(Debug)]
pub struct SessionClock {
    strategy: SessionStrategy,
    last: AtomicU64,
}

impl SessionClock {
    pub fn new(strategy: SessionStrategy) -> Self {
        Self {
            strategy,
            last: AtomicU64::new(0),
        }
    }

    pub fn next_stamp(&self) -> u64 {
        let candidate = match self.strategy {
            SessionStrategy::UnixMillis => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or_default(),
            SessionStrategy::Counter => 0,
        };

        // Two sessions in the same millisecond still get distinct stamps.
        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let next = candidate.max(prev + 1);
            match self
                .last
                .compare_exchange_weak(prev, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }

    pub fn begin(&self, device: &Device) -> CrawlSession {
        CrawlSession {
            device: device.clone(),
            stamp: self.next_stamp(),
        }
    }
}

/// Cooperative cancellation, checked between pipeline stages.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
