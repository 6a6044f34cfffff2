//! Rolling-window bandwidth governor.
//!
//! A sliding byte ledger (default one hour) backs every admission decision.
//! A rolling window, rather than a daily bucket, keeps the noise from
//! burning its budget by noon and going silent at night; that silence would
//! itself be a fingerprint.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::trace;

pub const DEFAULT_WINDOW: Duration = Duration::from_secs(3600);

/// Coarse first-guess task sizes, corrected over time by the per-engine EWMA.
pub fn coarse_estimate(engine: &str) -> u64 {
    match engine {
        "browse" | "research" | "tor" => 1_500_000,
        "search" => 300_000,
        "adclick" => 800_000,
        "dns" => 1_024,
        _ => 500_000,
    }
}

struct Ewma {
    alpha: f64,
    current: f64,
}

impl Ewma {
    fn new(alpha: f64, init: f64) -> Self {
        Self {
            alpha,
            current: init,
        }
    }

    fn update(&mut self, sample: f64) -> f64 {
        self.current = self.alpha * sample + (1.0 - self.alpha) * self.current;
        self.current
    }
}

/// Why a task was refused admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetExceeded {
    pub used: u64,
    pub estimated: u64,
    pub cap: u64,
}

pub struct BandwidthGovernor {
    cap_bytes: u64,
    window: Duration,
    ledger: Mutex<VecDeque<(Instant, u64)>>,
    estimates: DashMap<String, Ewma>,
}

impl BandwidthGovernor {
    pub fn new(cap_mb_per_hour: u64) -> Self {
        Self::with_window(cap_mb_per_hour, DEFAULT_WINDOW)
    }

    pub fn with_window(cap_mb_per_hour: u64, window: Duration) -> Self {
        Self {
            cap_bytes: cap_mb_per_hour * 1024 * 1024,
            window,
            ledger: Mutex::new(VecDeque::new()),
            estimates: DashMap::new(),
        }
    }

    /// Bytes consumed inside the current window. Compacts lazily.
    pub fn used(&self) -> u64 {
        let mut ledger = self.ledger.lock();
        if let Some(cutoff) = Instant::now().checked_sub(self.window) {
            while let Some(&(ts, _)) = ledger.front() {
                if ts < cutoff {
                    ledger.pop_front();
                } else {
                    break;
                }
            }
        }
        ledger.iter().map(|&(_, b)| b).sum()
    }

    pub fn cap_bytes(&self) -> u64 {
        self.cap_bytes
    }

    /// Expected size of the next task for `engine`: the observed EWMA when
    /// one exists, the coarse constant otherwise.
    pub fn estimate(&self, engine: &str) -> u64 {
        self.estimates
            .get(engine)
            .map(|e| e.current as u64)
            .unwrap_or_else(|| coarse_estimate(engine))
    }

    /// Admission check. Never blocks; the cap is soft by design (an in-flight
    /// task may overshoot by its own size, nothing more).
    pub fn admit(&self, engine: &str) -> Result<(), BudgetExceeded> {
        let used = self.used();
        let estimated = self.estimate(engine);
        if used.saturating_add(estimated) > self.cap_bytes {
            trace!(engine, used, estimated, cap = self.cap_bytes, "budget reject");
            return Err(BudgetExceeded {
                used,
                estimated,
                cap: self.cap_bytes,
            });
        }
        Ok(())
    }

    /// Record observed bytes on task completion and fold them into the
    /// engine's estimate.
    pub fn record(&self, engine: &str, bytes: u64) {
        if bytes > 0 {
            self.ledger.lock().push_back((Instant::now(), bytes));
        }
        self.estimates
            .entry(engine.to_string())
            .or_insert_with(|| Ewma::new(0.2, coarse_estimate(engine) as f64))
            .update(bytes as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_until_cap() {
        let gov = BandwidthGovernor::new(1); // 1 MiB/h
        assert!(gov.admit("search").is_ok());
        gov.record("search", 900_000);
        // 900 KB used + ~300 KB estimate exceeds 1 MiB.
        let err = gov.admit("search").unwrap_err();
        assert!(err.used >= 900_000);
        assert_eq!(err.cap, 1024 * 1024);
    }

    #[test]
    fn window_total_never_exceeds_cap_plus_one_task() {
        let gov = BandwidthGovernor::new(5);
        let task = 1_000_000u64;
        let mut admitted = 0u64;
        for _ in 0..100 {
            if gov.admit("browse").is_ok() {
                gov.record("browse", task);
                admitted += task;
            }
        }
        assert!(admitted <= gov.cap_bytes() + task);
        assert!(gov.used() <= gov.cap_bytes() + task);
    }

    #[test]
    fn ewma_tracks_observed_sizes() {
        let gov = BandwidthGovernor::new(50);
        assert_eq!(gov.estimate("search"), coarse_estimate("search"));
        for _ in 0..50 {
            gov.record("search", 100_000);
        }
        let est = gov.estimate("search");
        assert!(est < 150_000, "estimate {est} should converge toward 100 KB");
    }

    #[test]
    fn old_samples_fall_out_of_window() {
        let gov = BandwidthGovernor::with_window(5, Duration::from_millis(10));
        gov.record("browse", 4_000_000);
        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(gov.used(), 0);
        assert!(gov.admit("browse").is_ok());
    }

    #[test]
    fn dns_is_effectively_free() {
        let gov = BandwidthGovernor::new(1);
        gov.record("browse", 1_000_000);
        // Browse is over budget but the 1 KB DNS estimate still fits.
        assert!(gov.admit("dns").is_ok());
    }
}
