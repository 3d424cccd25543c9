//! Running per-phase request timings for the source namespace.

use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

/// Timings observed for a single request. Phases that did not happen
/// (a pooled connection needs no DNS lookup or handshake) stay zero.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PhaseTimings {
    pub dns: Duration,
    /// TCP connect plus TLS handshake.
    pub connect: Duration,
    pub ttfb: Duration,
}

/// Lock-free sums of request phase durations plus a request counter.
#[derive(Debug, Default)]
pub struct LatencyAccumulator {
    dns_nanos: AtomicU64,
    connect_nanos: AtomicU64,
    ttfb_nanos: AtomicU64,
    count: AtomicU64,
}

/// Per-phase averages over every recorded request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LatencyReport {
    pub requests: u64,
    pub dns: Duration,
    pub connect: Duration,
    pub ttfb: Duration,
}

impl LatencyAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, timings: PhaseTimings) {
        self.dns_nanos.fetch_add(nanos(timings.dns), Ordering::Relaxed);
        self.connect_nanos
            .fetch_add(nanos(timings.connect), Ordering::Relaxed);
        self.ttfb_nanos.fetch_add(nanos(timings.ttfb), Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn requests(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Average of each phase. `None` until at least one request was recorded.
    pub fn report(&self) -> Option<LatencyReport> {
        let requests = self.requests();
        if requests == 0 {
            return None;
        }
        let average =
            |sum: &AtomicU64| Duration::from_nanos(sum.load(Ordering::Relaxed) / requests);
        Some(LatencyReport {
            requests,
            dns: average(&self.dns_nanos),
            connect: average(&self.connect_nanos),
            ttfb: average(&self.ttfb_nanos),
        })
    }
}

impl fmt::Display for LatencyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DNS Done: {:?} Connect time (incl. TLS): {:?} TTFB: {:?} over {} requests",
            self.dns, self.connect, self.ttfb, self.requests
        )
    }
}

fn nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn report_is_none_without_requests() {
        assert_eq!(LatencyAccumulator::new().report(), None);
    }

    #[test]
    fn report_averages_each_phase() {
        let acc = LatencyAccumulator::new();
        acc.record(PhaseTimings {
            dns: Duration::from_millis(4),
            connect: Duration::from_millis(2),
            ttfb: Duration::from_millis(30),
        });
        acc.record(PhaseTimings {
            ttfb: Duration::from_millis(10),
            ..PhaseTimings::default()
        });

        let report = acc.report().unwrap();
        assert_eq!(report.requests, 2);
        assert_eq!(report.dns, Duration::from_millis(2));
        assert_eq!(report.connect, Duration::from_millis(1));
        assert_eq!(report.ttfb, Duration::from_millis(20));
    }

    #[test]
    fn report_renders_every_measured_phase() {
        let acc = LatencyAccumulator::new();
        acc.record(PhaseTimings {
            dns: Duration::from_millis(1),
            connect: Duration::from_millis(2),
            ttfb: Duration::from_millis(3),
        });
        assert_eq!(
            acc.report().unwrap().to_string(),
            "DNS Done: 1ms Connect time (incl. TLS): 2ms TTFB: 3ms over 1 requests"
        );
    }

    #[test]
    fn concurrent_records_are_all_counted() {
        let acc = Arc::new(LatencyAccumulator::new());
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let acc = Arc::clone(&acc);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        acc.record(PhaseTimings {
                            ttfb: Duration::from_micros(1),
                            ..PhaseTimings::default()
                        });
                    }
                })
            })
            .collect();
        for handle in threads {
            handle.join().unwrap();
        }
        assert_eq!(acc.requests(), 8000);
        assert_eq!(acc.report().unwrap().ttfb, Duration::from_micros(1));
    }
}
