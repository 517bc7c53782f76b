//! Sliding-window sample statistics.
//!
//! A [`MonitoredQuantity`] accumulates samples cheaply under its own lock and
//! publishes aggregates only when [`MonitoredQuantity::calculate_statistics`]
//! runs. A [`StatisticsCollector`] owns a background thread that performs
//! that flush for every registered quantity once per interval.
//!
//! The collector is an ordinary value: whoever owns the process lifetime
//! constructs it, starts it, and stops it (or drops it) during shutdown.

use crate::consts::DEFAULT_STATISTICS_INTERVAL_SECS;
use crate::queue::wait_until_deadline;
use crate::time::now_secs;
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

/// Published aggregates of one quantity.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitoredQuantityStats {
    /// Samples since creation or reset.
    pub full_sample_count: u64,
    /// Samples per second over the full history.
    pub full_sample_rate: f64,
    /// Sum of sample values over the full history.
    pub full_value_sum: f64,
    /// Sum of squared sample values over the full history.
    pub full_value_sum_of_squares: f64,
    /// Mean sample value over the full history.
    pub full_value_average: f64,
    /// Root mean square deviation over the full history.
    pub full_value_rms: f64,
    /// Smallest sample over the full history.
    pub full_value_min: f64,
    /// Largest sample over the full history.
    pub full_value_max: f64,
    /// Value sum per second over the full history.
    pub full_value_rate: f64,
    /// Seconds covered by the full history.
    pub full_duration: f64,

    /// Samples within the recent window.
    pub recent_sample_count: u64,
    /// Samples per second within the recent window.
    pub recent_sample_rate: f64,
    /// Sum of sample values within the recent window.
    pub recent_value_sum: f64,
    /// Sum of squared sample values within the recent window.
    pub recent_value_sum_of_squares: f64,
    /// Mean sample value within the recent window.
    pub recent_value_average: f64,
    /// Root mean square deviation within the recent window.
    pub recent_value_rms: f64,
    /// Smallest sample within the recent window.
    pub recent_value_min: f64,
    /// Largest sample within the recent window.
    pub recent_value_max: f64,
    /// Value sum per second within the recent window.
    pub recent_value_rate: f64,
    /// Seconds covered by the recent window.
    pub recent_duration: f64,

    /// Per-bin sample counts of the recent window.
    pub recent_binned_sample_counts: Vec<u64>,
    /// Per-bin value sums of the recent window.
    pub recent_binned_value_sums: Vec<f64>,
    /// Per-bin durations of the recent window.
    pub recent_binned_durations: Vec<f64>,

    /// Most recent sample.
    pub last_sample_value: f64,
    /// Value sum per second during the last calculation interval.
    pub last_value_rate: f64,
    /// Time of the last calculation, in seconds.
    pub last_calculation_time: f64,
    /// Whether the quantity accepts samples.
    pub enabled: bool,
}

impl MonitoredQuantityStats {
    fn empty(bins: usize, enabled: bool) -> Self {
        Self {
            full_sample_count: 0,
            full_sample_rate: 0.0,
            full_value_sum: 0.0,
            full_value_sum_of_squares: 0.0,
            full_value_average: 0.0,
            full_value_rms: 0.0,
            full_value_min: f64::INFINITY,
            full_value_max: f64::NEG_INFINITY,
            full_value_rate: 0.0,
            full_duration: 0.0,
            recent_sample_count: 0,
            recent_sample_rate: 0.0,
            recent_value_sum: 0.0,
            recent_value_sum_of_squares: 0.0,
            recent_value_average: 0.0,
            recent_value_rms: 0.0,
            recent_value_min: f64::INFINITY,
            recent_value_max: f64::NEG_INFINITY,
            recent_value_rate: 0.0,
            recent_duration: 0.0,
            recent_binned_sample_counts: vec![0; bins],
            recent_binned_value_sums: vec![0.0; bins],
            recent_binned_durations: vec![0.0; bins],
            last_sample_value: 0.0,
            last_value_rate: 0.0,
            last_calculation_time: 0.0,
            enabled,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Working {
    count: u64,
    sum: f64,
    sum_of_squares: f64,
    min: f64,
    max: f64,
    last: f64,
}

impl Working {
    const fn new() -> Self {
        Self {
            count: 0,
            sum: 0.0,
            sum_of_squares: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            last: 0.0,
        }
    }
}

#[derive(Debug)]
struct Results {
    stats: MonitoredQuantityStats,
    bin_min: Vec<f64>,
    bin_max: Vec<f64>,
    bin_sum_of_squares: Vec<f64>,
    working_bin: usize,
    start_time: Option<f64>,
    last_calculation: Option<f64>,
    calculations: u64,
}

/// Accumulator for one monitored value.
#[derive(Debug)]
pub struct MonitoredQuantity {
    calculation_interval: f64,
    enabled: AtomicBool,
    working: Mutex<Working>,
    results: Mutex<Results>,
    flushed: Condvar,
}

fn rms(count: u64, sum: f64, sum_of_squares: f64) -> f64 {
    if count == 0 {
        return 0.0;
    }
    let n = count as f64;
    let mean = sum / n;
    (sum_of_squares / n - mean * mean).max(0.0).sqrt()
}

fn bin_count(calculation_interval: f64, time_window: f64) -> usize {
    ((time_window / calculation_interval).round() as usize).max(1)
}

impl MonitoredQuantity {
    /// Create a quantity flushed every `calculation_interval` whose recent
    /// results cover `time_window`.
    pub fn new(calculation_interval: Duration, time_window: Duration) -> Self {
        let interval = calculation_interval.as_secs_f64().max(f64::EPSILON);
        let bins = bin_count(interval, time_window.as_secs_f64());
        Self {
            calculation_interval: interval,
            enabled: AtomicBool::new(true),
            working: Mutex::new(Working::new()),
            results: Mutex::new(Self::fresh_results(bins, true)),
            flushed: Condvar::new(),
        }
    }

    fn fresh_results(bins: usize, enabled: bool) -> Results {
        Results {
            stats: MonitoredQuantityStats::empty(bins, enabled),
            bin_min: vec![f64::INFINITY; bins],
            bin_max: vec![f64::NEG_INFINITY; bins],
            bin_sum_of_squares: vec![0.0; bins],
            working_bin: 0,
            start_time: None,
            last_calculation: None,
            calculations: 0,
        }
    }

    /// Record a sample.
    pub fn add_sample(&self, value: f64) {
        if !self.enabled.load(Ordering::Acquire) {
            return;
        }
        let mut working = self.working.lock();
        working.count += 1;
        working.sum += value;
        working.sum_of_squares += value * value;
        working.min = working.min.min(value);
        working.max = working.max.max(value);
        working.last = value;
    }

    /// Record an integer sample.
    pub fn add_count(&self, value: u64) {
        self.add_sample(value as f64);
    }

    /// Flush working samples into the published results.
    ///
    /// The first call only records the start time. Later calls calculate when
    /// at least one calculation interval has passed since the previous one.
    /// Returns whether a calculation took place.
    pub fn calculate_statistics(&self, now: f64) -> bool {
        if !self.enabled.load(Ordering::Acquire) {
            return false;
        }

        let mut results = self.results.lock();
        let Some(previous) = results.last_calculation else {
            results.start_time = Some(now);
            results.last_calculation = Some(now);
            results.stats.last_calculation_time = now;
            return false;
        };
        if now - previous < self.calculation_interval {
            return false;
        }

        let working = std::mem::replace(&mut *self.working.lock(), Working::new());
        let interval = now - previous;
        let start = results.start_time.unwrap_or(previous);
        let bin = results.working_bin;

        let r = &mut *results;
        let stats = &mut r.stats;

        stats.full_sample_count += working.count;
        stats.full_value_sum += working.sum;
        stats.full_value_sum_of_squares += working.sum_of_squares;
        stats.full_value_min = stats.full_value_min.min(working.min);
        stats.full_value_max = stats.full_value_max.max(working.max);
        stats.full_duration = now - start;
        if working.count > 0 {
            stats.last_sample_value = working.last;
        }
        stats.last_value_rate = working.sum / interval;

        stats.recent_binned_sample_counts[bin] = working.count;
        stats.recent_binned_value_sums[bin] = working.sum;
        stats.recent_binned_durations[bin] = interval;
        r.bin_sum_of_squares[bin] = working.sum_of_squares;
        r.bin_min[bin] = working.min;
        r.bin_max[bin] = working.max;

        stats.recent_sample_count = stats.recent_binned_sample_counts.iter().sum();
        stats.recent_value_sum = stats.recent_binned_value_sums.iter().sum();
        stats.recent_value_sum_of_squares = r.bin_sum_of_squares.iter().sum();
        stats.recent_duration = stats.recent_binned_durations.iter().sum();
        stats.recent_value_min = r.bin_min.iter().copied().fold(f64::INFINITY, f64::min);
        stats.recent_value_max = r.bin_max.iter().copied().fold(f64::NEG_INFINITY, f64::max);

        let per_second = |amount: f64, duration: f64| {
            if duration > 0.0 { amount / duration } else { 0.0 }
        };
        let average = |sum: f64, count: u64| {
            if count > 0 { sum / count as f64 } else { 0.0 }
        };

        stats.full_value_average = average(stats.full_value_sum, stats.full_sample_count);
        stats.full_value_rms = rms(
            stats.full_sample_count,
            stats.full_value_sum,
            stats.full_value_sum_of_squares,
        );
        stats.full_sample_rate = per_second(stats.full_sample_count as f64, stats.full_duration);
        stats.full_value_rate = per_second(stats.full_value_sum, stats.full_duration);

        stats.recent_value_average = average(stats.recent_value_sum, stats.recent_sample_count);
        stats.recent_value_rms = rms(
            stats.recent_sample_count,
            stats.recent_value_sum,
            stats.recent_value_sum_of_squares,
        );
        stats.recent_sample_rate =
            per_second(stats.recent_sample_count as f64, stats.recent_duration);
        stats.recent_value_rate = per_second(stats.recent_value_sum, stats.recent_duration);
        stats.last_calculation_time = now;

        r.working_bin = (bin + 1) % stats.recent_binned_sample_counts.len();
        r.last_calculation = Some(now);
        r.calculations += 1;
        drop(results);
        self.flushed.notify_all();
        true
    }

    /// Copy of the published results.
    pub fn stats(&self) -> MonitoredQuantityStats {
        self.results.lock().stats.clone()
    }

    /// Forget every sample and result.
    pub fn reset(&self) {
        *self.working.lock() = Working::new();
        let mut results = self.results.lock();
        let bins = results.stats.recent_binned_sample_counts.len();
        *results = Self::fresh_results(bins, self.enabled.load(Ordering::Acquire));
    }

    /// Accept samples again.
    pub fn enable(&self) {
        if !self.enabled.swap(true, Ordering::AcqRel) {
            self.reset();
        }
    }

    /// Ignore samples and skip calculations.
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
        self.results.lock().stats.enabled = false;
    }

    /// Whether samples are accepted.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Change the recent-results window; resets the quantity.
    pub fn set_time_window(&self, time_window: Duration) {
        let bins = bin_count(self.calculation_interval, time_window.as_secs_f64());
        *self.working.lock() = Working::new();
        *self.results.lock() = Self::fresh_results(bins, self.enabled.load(Ordering::Acquire));
    }

    /// Expected time between calculations.
    pub fn calculation_interval(&self) -> Duration {
        Duration::from_secs_f64(self.calculation_interval)
    }

    /// Block until the next calculation completes or `timeout` elapses.
    ///
    /// Returns `true` if a calculation happened while waiting.
    pub fn wait_until_flushed(&self, timeout: Duration) -> bool {
        let mut results = self.results.lock();
        let seen = results.calculations;
        let deadline = std::time::Instant::now().checked_add(timeout);
        while results.calculations == seen {
            if wait_until_deadline(&self.flushed, &mut results, deadline) {
                return results.calculations != seen;
            }
        }
        true
    }
}

struct Registry {
    quantities: Mutex<BTreeMap<String, Arc<MonitoredQuantity>>>,
    running: AtomicBool,
    wake: Condvar,
    wake_lock: Mutex<()>,
}

/// Periodically flushes every registered [`MonitoredQuantity`].
pub struct StatisticsCollector {
    interval: Duration,
    registry: Arc<Registry>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl StatisticsCollector {
    /// Create a stopped collector flushing every `interval`.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            registry: Arc::new(Registry {
                quantities: Mutex::new(BTreeMap::new()),
                running: AtomicBool::new(false),
                wake: Condvar::new(),
                wake_lock: Mutex::new(()),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Flush interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Register a quantity under `key`, replacing any previous one.
    pub fn register(&self, key: impl Into<String>, quantity: Arc<MonitoredQuantity>) {
        let key = key.into();
        tracing::debug!("Registering monitored quantity '{}'", key);
        self.registry.quantities.lock().insert(key, quantity);
    }

    /// Create and register a quantity flushed at the collector's interval.
    pub fn register_new(&self, key: impl Into<String>, time_window: Duration) -> Arc<MonitoredQuantity> {
        let quantity = Arc::new(MonitoredQuantity::new(self.interval, time_window));
        self.register(key, Arc::clone(&quantity));
        quantity
    }

    /// Look up a quantity.
    pub fn get(&self, key: &str) -> Option<Arc<MonitoredQuantity>> {
        self.registry.quantities.lock().get(key).cloned()
    }

    /// Registered keys in sorted order.
    pub fn keys(&self) -> Vec<String> {
        self.registry.quantities.lock().keys().cloned().collect()
    }

    /// Reset every registered quantity.
    pub fn reset_all(&self) {
        for quantity in self.registry.quantities.lock().values() {
            quantity.reset();
        }
    }

    /// Run one flush at time `now` (seconds); returns how many quantities calculated.
    pub fn flush(&self, now: f64) -> usize {
        Self::flush_registry(&self.registry, now)
    }

    fn flush_registry(registry: &Registry, now: f64) -> usize {
        let quantities: Vec<Arc<MonitoredQuantity>> =
            registry.quantities.lock().values().cloned().collect();
        quantities
            .iter()
            .filter(|quantity| quantity.calculate_statistics(now))
            .count()
    }

    /// Start the background thread; a no-op when already running.
    pub fn start(&self) -> std::io::Result<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }
        self.registry.running.store(true, Ordering::Release);

        let registry = Arc::clone(&self.registry);
        let interval = self.interval;
        let handle = std::thread::Builder::new()
            .name("daq-statistics".to_string())
            .spawn(move || {
                tracing::debug!("Statistics collector started ({:?} interval)", interval);
                while registry.running.load(Ordering::Acquire) {
                    Self::flush_registry(&registry, now_secs());
                    let mut guard = registry.wake_lock.lock();
                    if registry.running.load(Ordering::Acquire) {
                        registry.wake.wait_for(&mut guard, interval);
                    }
                }
                tracing::debug!("Statistics collector stopped");
            })?;
        *worker = Some(handle);
        Ok(())
    }

    /// Stop and join the background thread.
    pub fn stop(&self) {
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            {
                let _guard = self.registry.wake_lock.lock();
                self.registry.running.store(false, Ordering::Release);
                self.registry.wake.notify_all();
            }
            if handle.join().is_err() {
                tracing::error!("Statistics collector thread panicked");
            }
        }
    }

    /// Whether the background thread is running.
    pub fn is_running(&self) -> bool {
        self.worker.lock().is_some()
    }
}

impl Default for StatisticsCollector {
    fn default() -> Self {
        Self::new(Duration::from_secs_f64(DEFAULT_STATISTICS_INTERVAL_SECS))
    }
}

impl Drop for StatisticsCollector {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn first_calculation_only_starts_the_clock() {
        let q = MonitoredQuantity::new(Duration::from_secs(1), Duration::from_secs(5));
        q.add_sample(1.0);
        assert!(!q.calculate_statistics(100.0));
        assert_eq!(q.stats().full_sample_count, 0);
    }

    #[test]
    fn calculation_waits_for_interval() {
        let q = MonitoredQuantity::new(Duration::from_secs(1), Duration::from_secs(5));
        q.calculate_statistics(100.0);
        q.add_sample(1.0);
        assert!(!q.calculate_statistics(100.5));
        assert!(q.calculate_statistics(101.0));
    }

    #[test]
    fn full_statistics() {
        let q = MonitoredQuantity::new(Duration::from_secs(1), Duration::from_secs(5));
        q.calculate_statistics(0.0);
        for value in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
            q.add_sample(value);
        }
        assert!(q.calculate_statistics(2.0));

        let stats = q.stats();
        assert_eq!(stats.full_sample_count, 8);
        assert!(approx(stats.full_value_sum, 40.0));
        assert!(approx(stats.full_value_average, 5.0));
        assert!(approx(stats.full_value_rms, 2.0));
        assert!(approx(stats.full_value_min, 2.0));
        assert!(approx(stats.full_value_max, 9.0));
        assert!(approx(stats.full_duration, 2.0));
        assert!(approx(stats.full_sample_rate, 4.0));
        assert!(approx(stats.full_value_rate, 20.0));
        assert!(approx(stats.last_sample_value, 9.0));
    }

    #[test]
    fn recent_window_forgets_old_bins() {
        // 2 bins of 1 second each
        let q = MonitoredQuantity::new(Duration::from_secs(1), Duration::from_secs(2));
        q.calculate_statistics(0.0);

        q.add_sample(10.0);
        assert!(q.calculate_statistics(1.0));
        q.add_sample(20.0);
        assert!(q.calculate_statistics(2.0));
        assert_eq!(q.stats().recent_sample_count, 2);
        assert!(approx(q.stats().recent_value_sum, 30.0));

        q.add_sample(30.0);
        assert!(q.calculate_statistics(3.0));
        let stats = q.stats();
        assert_eq!(stats.recent_sample_count, 2);
        assert!(approx(stats.recent_value_sum, 50.0));
        assert!(approx(stats.recent_value_min, 20.0));
        assert!(approx(stats.recent_value_max, 30.0));
        assert_eq!(stats.full_sample_count, 3);
        assert_eq!(stats.recent_binned_sample_counts.len(), 2);
    }

    #[test]
    fn disabled_quantity_ignores_samples() {
        let q = MonitoredQuantity::new(Duration::from_secs(1), Duration::from_secs(1));
        q.calculate_statistics(0.0);
        q.disable();
        q.add_sample(5.0);
        assert!(!q.calculate_statistics(5.0));
        assert!(!q.stats().enabled);
        q.enable();
        assert!(q.is_enabled());
        assert_eq!(q.stats().full_sample_count, 0);
    }

    #[test]
    fn collector_flushes_registered_quantities() {
        let collector = StatisticsCollector::new(Duration::from_secs(1));
        let a = collector.register_new("a", Duration::from_secs(3));
        let b = collector.register_new("b", Duration::from_secs(3));
        assert_eq!(collector.keys(), vec!["a".to_string(), "b".to_string()]);

        assert_eq!(collector.flush(0.0), 0);
        a.add_sample(1.0);
        b.add_sample(2.0);
        assert_eq!(collector.flush(1.0), 2);
        assert_eq!(collector.get("b").unwrap().stats().full_sample_count, 1);

        collector.reset_all();
        assert_eq!(a.stats().full_sample_count, 0);
        assert!(collector.get("missing").is_none());
    }

    #[test]
    fn collector_thread_starts_and_stops() {
        let collector = StatisticsCollector::new(Duration::from_millis(10));
        let q = collector.register_new("rate", Duration::from_millis(50));
        collector.start().unwrap();
        collector.start().unwrap();
        assert!(collector.is_running());

        q.add_sample(3.0);
        assert!(q.wait_until_flushed(Duration::from_secs(2)));
        assert!(q.wait_until_flushed(Duration::MAX));
        collector.stop();
        assert!(!collector.is_running());
        assert_eq!(q.stats().full_sample_count, 1);
    }
}
