use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

/// One sample window of the throughput estimate. Also the window over which a
/// full burst budget can accumulate, so a sender that was idle may burst up to
/// `rate * SAMPLE_PERIOD` bytes before being paced.
const SAMPLE_PERIOD: Duration = Duration::from_millis(100);

/// Weight of the newest sample window in the moving average.
const EWMA_WEIGHT: f64 = 0.25;

/// Paces one direction of one raw stream: a remaining-budget counter that
/// refills continuously at the configured rate (capped at one window's worth of
/// burst), plus an exponentially weighted estimate of the recent throughput.
///
/// A monitor is owned exclusively by the worker of its direction and is never
/// shared, so all state is plain fields behind `&mut self`. Nothing here does
/// I/O and nothing is persisted.
pub struct RateMonitor {
    start: Instant,
    total_bytes: i64,

    /// remaining byte budget; goes negative when a batch overshoots, so the
    /// debt is paid back before the next grant
    budget: f64,
    budget_primed: bool,
    last_refill: Instant,

    sample_start: Instant,
    sample_bytes: i64,
    rate_estimate: f64,
}

impl RateMonitor {
    pub fn new() -> RateMonitor {
        let now = Instant::now();
        RateMonitor {
            start: now,
            total_bytes: 0,
            budget: 0.0,
            budget_primed: false,
            last_refill: now,
            sample_start: now,
            sample_bytes: 0,
            rate_estimate: 0.0,
        }
    }

    /// Blocks the calling worker until transferring up to `want` bytes keeps
    /// the recent average throughput at or below `rate` bytes/sec, and returns
    /// the number of bytes actually granted. A non-positive `rate` means
    /// unlimited. With `block == false` the call never suspends and may
    /// grant 0.
    pub async fn limit(&mut self, want: usize, rate: i64, block: bool) -> usize {
        if rate <= 0 {
            return want;
        }

        self.refill(rate, Instant::now());
        if block {
            while self.budget < 1.0 {
                let deficit_secs = (1.0 - self.budget) / rate as f64;
                trace!("rate budget exhausted, suspending worker for {:.3}s", deficit_secs);
                tokio::time::sleep(Duration::from_secs_f64(deficit_secs)).await;
                self.refill(rate, Instant::now());
            }
        }

        (self.budget.max(0.0) as usize).min(want)
    }

    /// Records `n` bytes actually transferred.
    pub fn update(&mut self, n: usize) {
        self.total_bytes += n as i64;
        self.budget -= n as f64;

        let now = Instant::now();
        while now.duration_since(self.sample_start) >= SAMPLE_PERIOD {
            let window_rate = self.sample_bytes as f64 / SAMPLE_PERIOD.as_secs_f64();
            self.rate_estimate += EWMA_WEIGHT * (window_rate - self.rate_estimate);
            self.sample_bytes = 0;
            self.sample_start += SAMPLE_PERIOD;
        }
        self.sample_bytes += n as i64;
    }

    /// Exponentially weighted estimate of the recent throughput in bytes/sec.
    pub fn rate_estimate(&self) -> f64 {
        self.rate_estimate
    }

    /// Average throughput since the monitor was created, in bytes/sec.
    pub fn mean_rate(&self) -> f64 {
        let elapsed = self.start.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        self.total_bytes as f64 / elapsed
    }

    pub fn total_bytes(&self) -> i64 {
        self.total_bytes
    }

    fn refill(&mut self, rate: i64, now: Instant) {
        let burst_capacity = rate as f64 * SAMPLE_PERIOD.as_secs_f64();
        if !self.budget_primed {
            // a freshly created monitor may burst immediately
            self.budget = burst_capacity;
            self.budget_primed = true;
        }
        else {
            let refilled = now.duration_since(self.last_refill).as_secs_f64() * rate as f64;
            self.budget = (self.budget + refilled).min(burst_capacity);
        }
        self.last_refill = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::runtime::Builder;

    fn paused_rt() -> tokio::runtime::Runtime {
        Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap()
    }

    #[test]
    fn test_unlimited_rate_grants_everything() {
        paused_rt().block_on(async {
            let mut monitor = RateMonitor::new();
            monitor.update(1_000_000);
            assert_eq!(monitor.limit(12345, 0, true).await, 12345);
            assert_eq!(monitor.limit(12345, -1, true).await, 12345);
        });
    }

    #[test]
    fn test_initial_burst_capped_at_one_window() {
        paused_rt().block_on(async {
            let mut monitor = RateMonitor::new();
            // 10_000 bytes/sec -> 1_000 bytes per 100ms window
            let granted = monitor.limit(5_000, 10_000, true).await;
            assert_eq!(granted, 1_000);
        });
    }

    #[test]
    fn test_blocks_when_budget_is_exhausted() {
        paused_rt().block_on(async {
            let mut monitor = RateMonitor::new();
            let rate = 10_000;

            let granted = monitor.limit(1_000, rate, true).await;
            monitor.update(granted);
            assert_eq!(granted, 1_000);

            // budget is exhausted: a blocking call suspends until the refill
            // makes the next byte available
            let before = Instant::now();
            let granted = monitor.limit(1_000, rate, true).await;
            let waited = before.elapsed();
            assert!(granted >= 1);
            assert!(waited >= Duration::from_micros(90), "waited only {:?}", waited);
        });
    }

    #[test]
    fn test_non_blocking_returns_zero_when_exhausted() {
        paused_rt().block_on(async {
            let mut monitor = RateMonitor::new();
            let granted = monitor.limit(1_000, 10_000, true).await;
            monitor.update(granted);

            assert_eq!(monitor.limit(1_000, 10_000, false).await, 0);
        });
    }

    #[test]
    fn test_sustained_transfer_takes_at_least_bytes_over_rate() {
        paused_rt().block_on(async {
            let mut monitor = RateMonitor::new();
            let rate: i64 = 10_000;
            let total: usize = 50_000;

            let before = Instant::now();
            let mut sent = 0;
            while sent < total {
                let granted = monitor.limit(total - sent, rate, true).await;
                monitor.update(granted);
                sent += granted;
            }
            let elapsed = before.elapsed();

            // one burst window comes for free at the start
            let expected = Duration::from_secs_f64((total as f64 - 1_000.0) / rate as f64);
            assert!(elapsed >= expected, "took only {:?}, expected at least {:?}", elapsed, expected);
        });
    }

    #[test]
    fn test_overshoot_creates_debt() {
        paused_rt().block_on(async {
            let mut monitor = RateMonitor::new();
            let rate = 10_000;

            monitor.limit(1_000, rate, true).await;
            // a batched worker may write more than it was granted
            monitor.update(5_000);

            // paying back 4_000 bytes of debt takes ~400ms on top of the window
            let before = Instant::now();
            monitor.limit(1_000, rate, true).await;
            let waited = before.elapsed();
            assert!(waited >= Duration::from_millis(390), "waited only {:?}", waited);
        });
    }

    #[test]
    fn test_rate_estimate_converges() {
        paused_rt().block_on(async {
            let mut monitor = RateMonitor::new();
            let rate: i64 = 10_000;

            let mut sent = 0;
            while sent < 100_000 {
                let granted = monitor.limit(100_000 - sent, rate, true).await;
                monitor.update(granted);
                sent += granted;
            }

            let estimate = monitor.rate_estimate();
            assert!(
                estimate > rate as f64 * 0.5 && estimate < rate as f64 * 2.0,
                "estimate {} not in the vicinity of {}",
                estimate,
                rate
            );
            assert_eq!(monitor.total_bytes(), 100_000);
        });
    }
}
