use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Outcome of one operator run.
#[derive(Debug, Clone, Default)]
pub struct RunResult {
    pub desc: String,
    pub path: String,
    pub skipped: bool,
    pub error: Option<String>,
}

impl RunResult {
    pub fn new(desc: &str, path: &str) -> Self {
        Self {
            desc: desc.to_string(),
            path: path.to_string(),
            skipped: false,
            error: None,
        }
    }
}

/// Aggregate outcome of a multiplexed run. Counters are atomic because
/// operators complete concurrently.
#[derive(Debug, Default)]
pub struct RunNResult {
    pub total: AtomicU64,
    pub success: AtomicU64,
    pub failure: AtomicU64,
    pub skipped: AtomicU64,
    results: Mutex<BTreeMap<String, RunResult>>,
}

impl RunNResult {
    pub fn store(&self, key: String, result: RunResult) {
        if result.error.is_some() {
            self.failure.fetch_add(1, Ordering::Relaxed);
        } else if result.skipped {
            self.skipped.fetch_add(1, Ordering::Relaxed);
        } else {
            self.success.fetch_add(1, Ordering::Relaxed);
        }
        if let Ok(mut results) = self.results.lock() {
            results.insert(key, result);
        }
    }

    pub fn results(&self) -> BTreeMap<String, RunResult> {
        self.results
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn counts(&self) -> (u64, u64, u64, u64) {
        (
            self.total.load(Ordering::Relaxed),
            self.success.load(Ordering::Relaxed),
            self.failure.load(Ordering::Relaxed),
            self.skipped.load(Ordering::Relaxed),
        )
    }
}
