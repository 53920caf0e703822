//! Opt-in perf counters (`BEACH_TIDE_PERF=1`) and logging setup.

pub mod logging;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::info;

const REPORT_EVERY: u64 = 100;

pub(crate) fn env_flag(var: &str) -> Option<bool> {
    std::env::var(var)
        .ok()
        .map(|value| !value.is_empty() && value != "0" && !value.eq_ignore_ascii_case("false"))
}

static ENABLED: Lazy<bool> = Lazy::new(|| env_flag("BEACH_TIDE_PERF").unwrap_or(false));

static COUNTERS: Lazy<Mutex<HashMap<&'static str, Counter>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

#[derive(Debug, Default, Clone, Copy)]
pub struct Counter {
    pub samples: u64,
    pub total: Duration,
    pub max: Duration,
    pub bytes: u64,
}

impl Counter {
    pub fn mean(&self) -> Duration {
        if self.samples == 0 {
            return Duration::ZERO;
        }
        self.total / self.samples.min(u32::MAX as u64) as u32
    }
}

pub fn enabled() -> bool {
    *ENABLED
}

pub fn record_duration(label: &'static str, elapsed: Duration) {
    if enabled() {
        record(label, |counter| {
            counter.total += elapsed;
            counter.max = counter.max.max(elapsed);
        });
    }
}

pub fn record_bytes(label: &'static str, bytes: usize) {
    if enabled() {
        record(label, |counter| counter.bytes += bytes as u64);
    }
}

fn record(label: &'static str, update: impl FnOnce(&mut Counter)) {
    let mut counters = COUNTERS.lock();
    let counter = counters.entry(label).or_default();
    counter.samples += 1;
    update(counter);
    if counter.samples % REPORT_EVERY == 0 {
        report(label, counter);
    }
}

fn report(label: &'static str, counter: &Counter) {
    info!(
        target = "tide::perf",
        label,
        samples = counter.samples,
        mean_us = counter.mean().as_micros() as u64,
        max_us = counter.max.as_micros() as u64,
        kib = counter.bytes / 1024,
        "perf sample"
    );
}

/// Records the time between construction and drop. `None` when perf
/// counters are off.
pub struct PerfGuard {
    label: &'static str,
    started: Instant,
}

impl PerfGuard {
    pub fn new(label: &'static str) -> Option<Self> {
        enabled().then(|| Self {
            label,
            started: Instant::now(),
        })
    }
}

impl Drop for PerfGuard {
    fn drop(&mut self) {
        record_duration(self.label, self.started.elapsed());
    }
}
