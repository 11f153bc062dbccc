use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Per-worker counters. Workers record into these lock-free and fold them
/// into the shared aggregator once, on exit.
#[derive(Debug, Default, Clone)]
pub struct LocalStats {
    pub total_bytes: u64,
    pub total_messages: u64,
    pub total_latency: Duration,
}

impl LocalStats {
    pub fn record(&mut self, bytes: usize, latency: Duration) {
        self.total_bytes += bytes as u64;
        self.total_messages += 1;
        self.total_latency += latency;
    }
}

#[derive(Debug, Default)]
struct Totals {
    total_bytes: u64,
    total_messages: u64,
    total_latency: Duration,
}

/// Run-wide accumulator shared by every worker. The mutex is held only for
/// the duration of a fold or the final snapshot.
pub struct StatsAggregator {
    totals: Mutex<Totals>,
    start: Instant,
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self {
            totals: Mutex::new(Totals::default()),
            start: Instant::now(),
        }
    }

    pub fn fold(&self, local: &LocalStats) {
        let mut totals = self.totals.lock();
        totals.total_bytes += local.total_bytes;
        totals.total_messages += local.total_messages;
        totals.total_latency += local.total_latency;
    }

    /// Snapshot the totals and stamp the end time. Meant to be called once at
    /// the end of the run; each call re-stamps the end time and therefore
    /// changes the derived duration.
    pub fn report(&self, label: &str) -> Report {
        let totals = self.totals.lock();
        let duration = self.start.elapsed();
        Report {
            label: label.to_string(),
            duration,
            total_bytes: totals.total_bytes,
            total_messages: totals.total_messages,
            total_latency: totals.total_latency,
        }
    }
}

impl Default for StatsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

/// Derived throughput/latency summary for one run.
#[derive(Debug, Clone)]
pub struct Report {
    pub label: String,
    pub duration: Duration,
    pub total_bytes: u64,
    pub total_messages: u64,
    pub total_latency: Duration,
}

impl Report {
    pub fn throughput_bits_per_sec(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.total_bytes as f64 * 8.0 / secs
    }

    pub fn messages_per_sec(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.total_messages as f64 / secs
    }

    pub fn avg_latency(&self) -> Duration {
        if self.total_messages == 0 {
            return Duration::ZERO;
        }
        self.total_latency.div_f64(self.total_messages as f64)
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== {} Statistics ===", self.label)?;
        writeln!(f, "Duration: {:.2} seconds", self.duration.as_secs_f64())?;
        writeln!(f, "Total Bytes: {}", self.total_bytes)?;
        writeln!(f, "Total Messages: {}", self.total_messages)?;
        writeln!(
            f,
            "Throughput: {:.3} Gbps",
            self.throughput_bits_per_sec() / 1e9
        )?;
        writeln!(
            f,
            "Average Latency: {:.2} us",
            self.avg_latency().as_secs_f64() * 1e6
        )?;
        write!(f, "Messages/sec: {:.2}", self.messages_per_sec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fold_and_derive() {
        let agg = StatsAggregator::new();
        let mut a = LocalStats::default();
        a.record(1000, Duration::from_micros(10));
        a.record(1000, Duration::from_micros(30));
        let mut b = LocalStats::default();
        b.record(500, Duration::from_micros(20));

        agg.fold(&a);
        agg.fold(&b);

        let report = agg.report("test");
        assert_eq!(report.total_bytes, 2500);
        assert_eq!(report.total_messages, 3);
        assert_eq!(report.avg_latency(), Duration::from_micros(20));
        assert!(report.throughput_bits_per_sec() > 0.0);
    }

    #[test]
    fn test_empty_report() {
        let agg = StatsAggregator::new();
        let report = agg.report("empty");
        assert_eq!(report.total_messages, 0);
        assert_eq!(report.avg_latency(), Duration::ZERO);
        assert_eq!(report.messages_per_sec().round() as u64, 0);
    }
}
