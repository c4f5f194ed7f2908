//! Live event statistics
//!
//! One writer (the aggregator thread) records results; any number of readers
//! take snapshots. Both go through a short `Mutex` critical section, so a
//! snapshot always reflects a whole number of recorded events.

use crate::analysis::event::{EventClass, EventResult};
use crate::stats::histogram::{FrequencyHistogram, HistogramBin};
use crate::stats::rate::RateMeter;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

/// Aggregator shared between the pipeline threads and readers
pub type SharedAggregator = Arc<Mutex<EventAggregator>>;

/// Lock a shared aggregator, recovering from a poisoned lock
///
/// Every mutation completes before the guard is released, so the state
/// behind a poisoned lock is still consistent.
pub fn lock(shared: &SharedAggregator) -> MutexGuard<'_, EventAggregator> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-class event counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassCounts {
    pub no_ion: u64,
    pub single: u64,
    pub multiple: u64,
}

impl ClassCounts {
    /// Counter for one class
    pub fn get(&self, class: EventClass) -> u64 {
        match class {
            EventClass::NoIon => self.no_ion,
            EventClass::Single => self.single,
            EventClass::Multiple => self.multiple,
        }
    }

    fn increment(&mut self, class: EventClass) {
        match class {
            EventClass::NoIon => self.no_ion += 1,
            EventClass::Single => self.single += 1,
            EventClass::Multiple => self.multiple += 1,
        }
    }

    /// Sum over all classes
    pub fn total(&self) -> u64 {
        self.no_ion + self.single + self.multiple
    }
}

/// One row of the recent-event log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub time: DateTime<Utc>,
    pub class: EventClass,
    pub fundamental_khz: Option<f64>,
    pub snr_db: Option<f64>,
    pub peak_count: usize,
    pub sequence: u64,
}

impl From<&EventResult> for EventRecord {
    fn from(result: &EventResult) -> Self {
        Self {
            time: result.timestamp,
            class: result.class,
            fundamental_khz: result.fundamental_khz(),
            snr_db: result.snr_db,
            peak_count: result.peak_count,
            sequence: result.sequence,
        }
    }
}

/// Point-in-time copy of the aggregate state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub counts: ClassCounts,
    pub total_events: u64,
    /// Events per second over the last completed tick
    pub rate_evt_per_s: f64,
    /// Rate ticks since the last reset
    pub rate_ticks: u64,
    /// Oldest first
    pub recent_events: Vec<EventRecord>,
    pub histogram: Vec<HistogramBin>,
}

/// Counters, bounded event log, f0 histogram, and rate
#[derive(Debug)]
pub struct EventAggregator {
    counts: ClassCounts,
    total: u64,
    log: VecDeque<EventRecord>,
    log_capacity: usize,
    histogram: FrequencyHistogram,
    rate: RateMeter,
}

impl EventAggregator {
    /// Create an aggregator keeping the last [`EVENT_LOG_CAPACITY`](crate::EVENT_LOG_CAPACITY) events
    pub fn new() -> Self {
        Self::with_log_capacity(crate::EVENT_LOG_CAPACITY)
    }

    /// Create an aggregator with a custom log capacity
    pub fn with_log_capacity(log_capacity: usize) -> Self {
        Self {
            counts: ClassCounts::default(),
            total: 0,
            log: VecDeque::with_capacity(log_capacity),
            log_capacity,
            histogram: FrequencyHistogram::new(),
            rate: RateMeter::new(Instant::now()),
        }
    }

    /// Wrap a fresh aggregator for sharing across threads
    pub fn shared() -> SharedAggregator {
        Arc::new(Mutex::new(Self::new()))
    }

    /// Fold one result into the statistics
    pub fn record(&mut self, result: &EventResult) {
        self.counts.increment(result.class);
        self.total += 1;

        if self.log.len() >= self.log_capacity {
            self.log.pop_front();
        }
        if self.log_capacity > 0 {
            self.log.push_back(EventRecord::from(result));
        }

        if result.class == EventClass::Single {
            if let Some(f0_khz) = result.fundamental_khz().filter(|&f| f > 0.0) {
                if self.histogram.push(f0_khz) {
                    tracing::trace!(values = self.histogram.len(), "Histogram rebuilt");
                }
            }
        }
    }

    /// Close the current rate window
    pub fn tick_rate(&mut self, now: Instant) -> f64 {
        self.rate.tick(now, self.total)
    }

    /// Begin a new rate window at `now`
    pub fn restart_rate_window(&mut self, now: Instant) {
        self.rate.restart(now, self.total);
    }

    /// Clear counters, log, histogram, and rate
    pub fn reset(&mut self) {
        self.counts = ClassCounts::default();
        self.total = 0;
        self.log.clear();
        self.histogram.clear();
        self.rate.reset(Instant::now());
    }

    pub fn counts(&self) -> ClassCounts {
        self.counts
    }

    pub fn total_events(&self) -> u64 {
        self.total
    }

    pub fn log_len(&self) -> usize {
        self.log.len()
    }

    /// Copy out the current state
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            counts: self.counts,
            total_events: self.total,
            rate_evt_per_s: self.rate.rate(),
            rate_ticks: self.rate.ticks(),
            recent_events: self.log.iter().cloned().collect(),
            histogram: self.histogram.bins().to_vec(),
        }
    }
}

impl Default for EventAggregator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::time::Duration;

    fn result(class: EventClass, f0_hz: Option<f64>, sequence: u64) -> EventResult {
        EventResult {
            class,
            fundamental_hz: f0_hz,
            snr_db: f0_hz.map(|_| 30.0),
            peak_count: if f0_hz.is_some() { 3 } else { 0 },
            timestamp: Utc::now(),
            sequence,
            fft_len: 262_144,
            fs_hz: 2_400_000.0,
        }
    }

    #[test]
    fn test_counts_by_class() {
        let mut agg = EventAggregator::new();
        agg.record(&result(EventClass::NoIon, None, 0));
        agg.record(&result(EventClass::Single, Some(50_000.0), 1));
        agg.record(&result(EventClass::Multiple, Some(60_000.0), 2));
        agg.record(&result(EventClass::Single, Some(51_000.0), 3));

        let counts = agg.counts();
        assert_eq!(counts.no_ion, 1);
        assert_eq!(counts.single, 2);
        assert_eq!(counts.multiple, 1);
        assert_eq!(counts.total(), 4);
        assert_eq!(counts.get(EventClass::Single), 2);
    }

    #[test]
    fn test_log_is_bounded() {
        let mut agg = EventAggregator::new();
        for i in 0..501 {
            let class = if i % 2 == 0 {
                EventClass::NoIon
            } else {
                EventClass::Single
            };
            let f0 = (class == EventClass::Single).then_some(50_000.0);
            agg.record(&result(class, f0, i));
        }

        let snap = agg.snapshot();
        assert_eq!(snap.recent_events.len(), 500);
        assert_eq!(snap.counts.no_ion, 251);
        assert_eq!(snap.counts.single, 250);
        assert_eq!(snap.total_events, 501);
        // Oldest evicted
        assert_eq!(snap.recent_events.first().unwrap().sequence, 1);
        assert_eq!(snap.recent_events.last().unwrap().sequence, 500);
    }

    #[test]
    fn test_histogram_only_counts_single_with_f0() {
        let mut agg = EventAggregator::new();
        for i in 0..5 {
            agg.record(&result(EventClass::Multiple, Some(50_000.0), i));
            agg.record(&result(EventClass::NoIon, None, i));
        }
        assert!(agg.snapshot().histogram.is_empty());

        for i in 0..4 {
            agg.record(&result(EventClass::Single, Some(50_000.0 + i as f64 * 1000.0), i));
        }
        assert!(agg.snapshot().histogram.is_empty());

        agg.record(&result(EventClass::Single, Some(55_000.0), 4));
        let hist = agg.snapshot().histogram;
        assert_eq!(hist.len(), 20);
        assert_eq!(hist.iter().map(|b| b.count).sum::<u64>(), 5);
    }

    #[test]
    fn test_record_stores_khz() {
        let mut agg = EventAggregator::new();
        agg.record(&result(EventClass::Single, Some(48_500.0), 7));
        let rec = &agg.snapshot().recent_events[0];
        assert_eq!(rec.fundamental_khz, Some(48.5));
        assert_eq!(rec.class, EventClass::Single);
        assert_eq!(rec.sequence, 7);
    }

    #[test]
    fn test_rate_tick() {
        let mut agg = EventAggregator::new();
        let t0 = Instant::now();
        agg.restart_rate_window(t0);
        for i in 0..4 {
            agg.record(&result(EventClass::NoIon, None, i));
        }
        let rate = agg.tick_rate(t0 + Duration::from_secs(1));
        assert_abs_diff_eq!(rate, 4.0, epsilon = 1e-9);

        let snap = agg.snapshot();
        assert_abs_diff_eq!(snap.rate_evt_per_s, 4.0, epsilon = 1e-9);
        assert_eq!(snap.rate_ticks, 1);
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut agg = EventAggregator::new();
        let t0 = Instant::now();
        for i in 0..10 {
            agg.record(&result(EventClass::Single, Some(50_000.0), i));
        }
        agg.tick_rate(t0 + Duration::from_secs(1));
        agg.reset();

        let snap = agg.snapshot();
        assert_eq!(snap.counts, ClassCounts::default());
        assert_eq!(snap.total_events, 0);
        assert!(snap.recent_events.is_empty());
        assert!(snap.histogram.is_empty());
        assert_eq!(snap.rate_evt_per_s, 0.0);
        assert_eq!(snap.rate_ticks, 0);
    }

    #[test]
    fn test_zero_capacity_log() {
        let mut agg = EventAggregator::with_log_capacity(0);
        agg.record(&result(EventClass::NoIon, None, 0));
        assert_eq!(agg.log_len(), 0);
        assert_eq!(agg.total_events(), 1);
    }

    #[test]
    fn test_snapshot_serializes() {
        let mut agg = EventAggregator::new();
        agg.record(&result(EventClass::Single, Some(50_000.0), 0));
        let json = serde_json::to_value(agg.snapshot()).unwrap();
        assert_eq!(json["counts"]["single"], 1);
        assert_eq!(json["recent_events"][0]["class"], "single");
    }

    #[test]
    fn test_poisoned_lock_is_recovered() {
        let shared = EventAggregator::shared();
        let clone = Arc::clone(&shared);
        let _ = std::thread::spawn(move || {
            let _guard = clone.lock().unwrap();
            panic!("poison the lock");
        })
        .join();

        assert!(shared.is_poisoned());
        lock(&shared).record(&result(EventClass::NoIon, None, 0));
        assert_eq!(lock(&shared).total_events(), 1);
    }
}
