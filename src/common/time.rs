use std::time::Duration;

use tokio::time::Instant;

/// Milliseconds since UNIX_EPOCH.
pub type Timestamp = i64;

/// Returns the time duration since UNIX_EPOCH in milliseconds.
pub fn current_time_millis() -> Timestamp {
    chrono::Utc::now().timestamp_millis()
}

/// Rounds `ts` down to a multiple of `interval`, anchored at the unix epoch.
pub fn truncate(ts: Timestamp, interval: Duration) -> Timestamp {
    let interval = interval.as_millis() as i64;
    if interval <= 0 {
        return ts;
    }
    ts - ts.rem_euclid(interval)
}

/// Interval ticker with the semantics of a Go `time.Ticker`: a tick that came
/// due while the consumer was busy fires immediately, older missed ticks are
/// dropped and the schedule stays aligned to the original phase.
pub struct Ticker {
    next: Instant,
    period: Duration,
}

impl Ticker {
    /// The first tick comes due one `period` from now.
    pub fn new(period: Duration) -> Ticker {
        assert!(!period.is_zero(), "ticker period must be positive");
        Ticker {
            next: Instant::now() + period,
            period,
        }
    }

    /// Waits until the next scheduled tick. Cancel-safe: dropping the future
    /// before completion leaves the schedule untouched.
    pub async fn tick(&mut self) {
        tokio::time::sleep_until(self.next).await;
        let now = Instant::now();
        self.next += self.period;
        while self.next <= now {
            self.next += self.period;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(0, 60_000, 0; "aligned zero")]
    #[test_case(59_999, 60_000, 0; "just before boundary")]
    #[test_case(60_000, 60_000, 60_000; "on boundary")]
    #[test_case(119_999, 60_000, 60_000; "mid second interval")]
    #[test_case(4_100_400_000, 3_600_000, 4_100_400_000; "hour aligned")]
    #[test_case(4_101_600_123, 3_600_000, 4_100_400_000; "hour truncated")]
    fn truncate_to_interval(ts: Timestamp, interval_ms: u64, expected: Timestamp) {
        assert_eq!(truncate(ts, Duration::from_millis(interval_ms)), expected);
    }

    #[test]
    fn truncate_ignores_zero_interval() {
        assert_eq!(truncate(12_345, Duration::ZERO), 12_345);
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_fires_on_the_period() {
        let start = Instant::now();
        let mut ticker = Ticker::new(Duration::from_millis(100));
        ticker.tick().await;
        assert_eq!(start.elapsed(), Duration::from_millis(100));
        ticker.tick().await;
        assert_eq!(start.elapsed(), Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_collapses_missed_ticks() {
        let start = Instant::now();
        let mut ticker = Ticker::new(Duration::from_millis(100));
        ticker.tick().await;

        // the consumer was busy well past several tick deadlines
        tokio::time::advance(Duration::from_millis(350)).await;

        // the overdue tick fires immediately
        ticker.tick().await;
        assert_eq!(start.elapsed(), Duration::from_millis(450));

        // the schedule stays phase-locked at multiples of the period
        ticker.tick().await;
        assert_eq!(start.elapsed(), Duration::from_millis(500));
    }
}
