//! Per-run timing spans, dumped as JSON when profiling is enabled.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct SpanRecord {
    pub id: String,
    pub seconds: f64,
}

#[derive(Debug, Default)]
pub struct Stopwatch {
    disabled: AtomicBool,
    records: Mutex<Vec<SpanRecord>>,
}

impl Stopwatch {
    pub fn new(enabled: bool) -> Self {
        let sw = Self::default();
        sw.disabled.store(!enabled, Ordering::Relaxed);
        sw
    }

    pub fn disable(&self) {
        self.disabled.store(true, Ordering::Relaxed);
    }

    /// Start a span; it records itself when the guard drops.
    pub fn span(&self, id: impl Into<String>) -> SpanGuard<'_> {
        SpanGuard {
            sw: self,
            id: id.into(),
            start: Instant::now(),
        }
    }

    fn record(&self, id: String, seconds: f64) {
        if self.disabled.load(Ordering::Relaxed) {
            return;
        }
        if let Ok(mut records) = self.records.lock() {
            records.push(SpanRecord { id, seconds });
        }
    }

    pub fn dump_profile<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        let records = self
            .records
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default();
        serde_json::to_writer(&mut *w, &records)?;
        writeln!(w)
    }
}

pub struct SpanGuard<'a> {
    sw: &'a Stopwatch,
    id: String,
    start: Instant,
}

impl Drop for SpanGuard<'_> {
    fn drop(&mut self) {
        let seconds = self.start.elapsed().as_secs_f64();
        self.sw.record(std::mem::take(&mut self.id), seconds);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_stopwatch_records_nothing() {
        let sw = Stopwatch::new(false);
        drop(sw.span("op"));
        let mut out = Vec::new();
        sw.dump_profile(&mut out).unwrap();
        assert_eq!(String::from_utf8_lossy(&out).trim(), "[]");
    }

    #[test]
    fn spans_record_on_drop() {
        let sw = Stopwatch::new(true);
        {
            let _outer = sw.span("runbook");
            let _inner = sw.span("step 0");
        }
        let mut out = Vec::new();
        sw.dump_profile(&mut out).unwrap();
        let parsed: Vec<serde_json::Value> = serde_json::from_slice(&out).unwrap();
        let ids: Vec<&str> = parsed.iter().filter_map(|r| r["id"].as_str()).collect();
        assert_eq!(ids, vec!["step 0", "runbook"]);
    }
}
