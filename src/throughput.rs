//! Decayed throughput accounting with periodic reporting.
//!
//! Each endpoint owns one [`Throughput`]. Workers and handlers call
//! [`Throughput::add`] after every completed packet; a background task logs
//! the decayed rate on a fixed interval until stopped.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::error::{NetsumError, Result};

/// Default interval between rate reports.
pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(5);

/// Landmark age after which the counter rescales to avoid overflow.
const RESCALE_THRESHOLD_SECS: u64 = 50;

/// Exponentially decayed counter using forward decay.
///
/// Values are weighted by `exp(alpha * (t - landmark))` when added and the
/// total is divided by the current weight when read. With `alpha = 1 / T`
/// the counter approximates the amount added over the last `T` seconds, and
/// `count * alpha` is a per-second rate.
#[derive(Debug)]
pub struct DecayCounter {
    alpha: f64,
    start: Instant,
    state: Mutex<DecayState>,
}

#[derive(Debug)]
struct DecayState {
    landmark_secs: u64,
    count: f64,
}

impl DecayCounter {
    /// Create a counter with decay factor `alpha` (per second).
    pub fn new(alpha: f64) -> Self {
        Self::starting_at(alpha, Instant::now())
    }

    /// Counter that decays over roughly one minute.
    pub fn one_minute() -> Self {
        Self::new(1.0 / 60.0)
    }

    fn starting_at(alpha: f64, start: Instant) -> Self {
        Self {
            alpha,
            start,
            state: Mutex::new(DecayState {
                landmark_secs: 0,
                count: 0.0,
            }),
        }
    }

    /// Add `value` at the current time.
    pub fn add(&self, value: u64) {
        self.add_at(value, Instant::now());
    }

    /// Decayed rate per second at the current time.
    pub fn rate(&self) -> f64 {
        self.rate_at(Instant::now())
    }

    /// Add `value` as of `now`.
    pub fn add_at(&self, value: u64, now: Instant) {
        let now_secs = self.tick(now);
        let mut state = self.lock();
        if now_secs.saturating_sub(state.landmark_secs) >= RESCALE_THRESHOLD_SECS {
            let factor = self.weight(state.landmark_secs, now_secs);
            state.count /= factor;
            state.landmark_secs = now_secs;
        }
        state.count += value as f64 * self.weight(state.landmark_secs, now_secs);
    }

    /// Decayed count as of `now`.
    pub fn count_at(&self, now: Instant) -> f64 {
        let now_secs = self.tick(now);
        let state = self.lock();
        state.count / self.weight(state.landmark_secs, now_secs)
    }

    /// Decayed rate per second as of `now`.
    pub fn rate_at(&self, now: Instant) -> f64 {
        self.count_at(now) * self.alpha
    }

    fn weight(&self, landmark_secs: u64, now_secs: u64) -> f64 {
        (self.alpha * (now_secs as f64 - landmark_secs as f64)).exp()
    }

    fn tick(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.start).as_secs()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DecayState> {
        // The state is two plain numbers, so a poisoned guard is still usable.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Shared throughput meter with a background reporter.
///
/// Clones share the same counter and reporter.
#[derive(Clone)]
pub struct Throughput {
    counter: Arc<DecayCounter>,
    stop: Arc<watch::Sender<bool>>,
}

impl Throughput {
    /// Create a meter and spawn its reporter on `handle`.
    pub fn start(handle: &Handle, name: &'static str, interval: Duration) -> (Self, JoinHandle<()>) {
        let counter = Arc::new(DecayCounter::one_minute());
        let (stop, stopped) = watch::channel(false);

        let reporter = handle.spawn(report_loop(Arc::clone(&counter), name, interval, stopped));

        (
            Self {
                counter,
                stop: Arc::new(stop),
            },
            reporter,
        )
    }

    /// Record `bytes` transferred.
    pub fn add(&self, bytes: u64) {
        self.counter.add(bytes);
    }

    /// Current decayed rate in bytes per second.
    pub fn rate(&self) -> f64 {
        self.counter.rate()
    }

    /// Ask the reporter to exit after its current wait.
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }
}

async fn report_loop(
    counter: Arc<DecayCounter>,
    name: &'static str,
    period: Duration,
    mut stopped: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = report(&counter, name) {
                    error!(meter = name, error = %e, "Reporting failed");
                    return;
                }
            }
            changed = stopped.changed() => {
                if changed.is_err() || *stopped.borrow() {
                    return;
                }
            }
        }
    }
}

fn report(counter: &DecayCounter, name: &'static str) -> Result<()> {
    let rate = counter.rate();
    if !rate.is_finite() {
        return Err(NetsumError::RateUnavailable(rate));
    }
    info!(meter = name, "Rate: {}", group_thousands(rate as u64));
    Ok(())
}

/// Format an integer with comma thousands separators.
pub fn group_thousands(value: u64) -> String {
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_thousands() {
        assert_eq!(group_thousands(0), "0");
        assert_eq!(group_thousands(999), "999");
        assert_eq!(group_thousands(1000), "1,000");
        assert_eq!(group_thousands(1_234_567), "1,234,567");
        assert_eq!(group_thousands(100_000), "100,000");
    }

    #[test]
    fn test_rate_without_elapsed_time() {
        let start = Instant::now();
        let counter = DecayCounter::starting_at(1.0 / 60.0, start);
        counter.add_at(600, start);
        assert!((counter.rate_at(start) - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_add_never_decreases_rate() {
        let start = Instant::now();
        let counter = DecayCounter::starting_at(1.0 / 60.0, start);
        let now = start + Duration::from_secs(7);

        let mut previous = counter.rate_at(now);
        for n in [1, 10, 100_000, 3, 1 << 30] {
            counter.add_at(n, now);
            let current = counter.rate_at(now);
            assert!(current > previous);
            previous = current;
        }
    }

    #[test]
    fn test_rate_decays_over_time() {
        let start = Instant::now();
        let counter = DecayCounter::starting_at(1.0 / 60.0, start);
        counter.add_at(6000, start);

        let fresh = counter.rate_at(start);
        let after_minute = counter.rate_at(start + Duration::from_secs(60));
        assert!((after_minute - fresh / std::f64::consts::E).abs() < 1e-9);
    }

    #[test]
    fn test_rescale_preserves_count() {
        let start = Instant::now();
        let counter = DecayCounter::starting_at(1.0 / 60.0, start);
        counter.add_at(1000, start);

        let later = start + Duration::from_secs(120);
        let before = counter.count_at(later);
        counter.add_at(0, later);
        let after = counter.count_at(later);
        assert!((before - after).abs() < 1e-9);
        assert_eq!(counter.lock().landmark_secs, 120);
    }

    #[test]
    fn test_concurrent_adds() {
        let start = Instant::now();
        let counter = Arc::new(DecayCounter::starting_at(1.0 / 60.0, start));

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let counter = Arc::clone(&counter);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        counter.add_at(1, start);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert!((counter.count_at(start) - 8000.0).abs() < 1e-6);
    }

    #[test]
    fn test_report_rejects_non_finite_rate() {
        let counter = DecayCounter::new(f64::NAN);
        assert!(matches!(
            report(&counter, "test"),
            Err(NetsumError::RateUnavailable(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reporter_stops_on_request() {
        let (meter, reporter) =
            Throughput::start(&Handle::current(), "test", Duration::from_secs(5));
        meter.add(100);
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(!reporter.is_finished());

        meter.stop();
        tokio::time::timeout(Duration::from_secs(1), reporter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_clones_share_counter() {
        let (meter, _reporter) =
            Throughput::start(&Handle::current(), "test", DEFAULT_REPORT_INTERVAL);
        let other = meter.clone();
        other.add(60);
        assert!(meter.rate() > 0.0);
        meter.stop();
    }
}
