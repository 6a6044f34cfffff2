//! Inhomogeneous Poisson arrivals via thinning.
//!
//! The rate λ(t) is the product of a base rate (intensity preset), a
//! time-of-day curve, a weekend factor, a slow weekly drift that keeps the
//! schedule from repeating exactly week over week, and small per-minute
//! jitter. Thinning draws candidates from a dominating homogeneous process
//! at λ_max over a lookahead horizon and accepts each with probability
//! λ(t)/λ_max, which yields exact inhomogeneous arrivals with no
//! discretization artifacts and tolerates λ changing mid-day: every
//! candidate re-reads the current profile.

use std::f64::consts::TAU;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, Local, Timelike};
use parking_lot::RwLock;
use rand::rngs::SmallRng;
use rand::Rng;

use crate::config::Intensity;

/// Lookahead horizon for the λ_max scan.
const LOOKAHEAD_SECS: f64 = 900.0;
/// Scan step inside the horizon.
const SCAN_STEP_SECS: f64 = 60.0;
/// Headroom on the scanned maximum so the dominating process really
/// dominates between scan points.
const LAMBDA_MAX_MARGIN: f64 = 1.05;
/// λ never reaches zero while the schedule gate is open: real humans do
/// browse at 3am.
const LAMBDA_FLOOR_PER_SEC: f64 = 5.0e-5;
/// Production gap clamps.
const MIN_GAP_SECS: f64 = 2.0;
const MAX_GAP_SECS: f64 = 7200.0;

/// Hourly activity weights (0-23) for a plausible human day: low overnight,
/// morning ramp, sustained daytime, evening peak, late-night taper.
const DEFAULT_HOURLY_WEIGHTS: [f64; 24] = [
    0.05, 0.03, 0.02, 0.02, 0.03, 0.05, // 00-05
    0.10, 0.25, 0.50, 0.80, 0.90, 0.85, // 06-11
    0.60, 0.70, 0.80, 0.85, 0.75, 0.65, // 12-17
    0.70, 0.80, 0.90, 0.75, 0.40, 0.15, // 18-23
];

const DRIFT_AMPLITUDE: f64 = 0.15;
/// Weeks per drift rotation; deliberately not a divisor of 52.
const DRIFT_PERIOD_WEEKS: f64 = 9.7;
const JITTER_SPAN: f64 = 0.10;

/// Logical stream an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamTag {
    SessionStart,
    DnsTick,
    ObsessionRefresh,
}

/// A single accepted firing, carrying the λ sample that produced it for
/// observability.
#[derive(Debug, Clone, Copy)]
pub struct Event {
    pub tag: StreamTag,
    pub gap: Duration,
    pub lambda_per_hour: f64,
}

/// The shape of λ(t). Everything but the base rate can be switched off,
/// which the statistical tests rely on.
#[derive(Debug, Clone)]
pub struct RateProfile {
    pub events_per_hour: f64,
    pub hourly_weights: Option<[f64; 24]>,
    pub weekend_factor: bool,
    pub weekly_drift: bool,
    pub jitter: bool,
    /// Seeded phase so two deployments drift differently.
    pub drift_phase: f64,
    jitter_seed: u64,
}

impl RateProfile {
    pub fn new(intensity: Intensity, seed: u64) -> Self {
        Self {
            events_per_hour: intensity.events_per_hour(),
            hourly_weights: Some(DEFAULT_HOURLY_WEIGHTS),
            weekend_factor: true,
            weekly_drift: true,
            jitter: true,
            drift_phase: (seed % 10_000) as f64 / 10_000.0 * TAU,
            jitter_seed: seed,
        }
    }

    /// Constant-rate profile with every modulation disabled.
    pub fn flat(events_per_hour: f64) -> Self {
        Self {
            events_per_hour,
            hourly_weights: None,
            weekend_factor: false,
            weekly_drift: false,
            jitter: false,
            drift_phase: 0.0,
            jitter_seed: 0,
        }
    }

    pub fn set_intensity(&mut self, intensity: Intensity) {
        self.events_per_hour = intensity.events_per_hour();
    }

    /// λ at a wall-clock instant, in events per second. Deterministic in `t`:
    /// the jitter term is a hash of the minute index, not an RNG draw, so
    /// the thinning acceptance ratio stays well-defined.
    pub fn lambda_at(&self, t: DateTime<Local>) -> f64 {
        let mut lambda = self.events_per_hour / 3600.0;

        if let Some(weights) = &self.hourly_weights {
            let hour = t.hour() as usize;
            let frac = t.minute() as f64 / 60.0;
            let w0 = weights[hour];
            let w1 = weights[(hour + 1) % 24];
            lambda *= w0 * (1.0 - frac) + w1 * frac;
        }

        if self.weekend_factor {
            let wday = t.weekday().num_days_from_monday();
            if wday >= 5 {
                lambda *= 0.9 + 0.2 * (std::f64::consts::PI * t.hour() as f64 / 12.0).sin();
            }
        }

        if self.weekly_drift {
            let iso = t.iso_week();
            let week_index = iso.year() as f64 * 53.0 + iso.week() as f64;
            let drift =
                DRIFT_AMPLITUDE * (TAU * week_index / DRIFT_PERIOD_WEEKS + self.drift_phase).sin();
            lambda *= 1.0 + drift;
        }

        if self.jitter {
            let minute_index = t.timestamp() / 60;
            let noise = splitmix(minute_index as u64 ^ self.jitter_seed);
            lambda *= 1.0 + JITTER_SPAN * (2.0 * noise - 1.0);
        }

        lambda.max(LAMBDA_FLOOR_PER_SEC)
    }
}

/// Deterministic u64 -> [0,1) hash (splitmix64 finalizer).
fn splitmix(mut x: u64) -> f64 {
    x = x.wrapping_add(0x9e3779b97f4a7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d049bb133111eb);
    x ^= x >> 31;
    (x >> 11) as f64 / (1u64 << 53) as f64
}

/// One thinning draw against an arbitrary rate function `lambda(t)` (seconds
/// since the caller's origin). Returns the gap to the next accepted event.
///
/// λ_max is re-scanned over the lookahead window on every candidate, so a
/// rate function that changes under the caller's feet is picked up at the
/// next candidate, never mid-draw.
pub fn thinning_gap<F: Fn(f64) -> f64>(
    lambda: &F,
    t0: f64,
    lookahead: f64,
    rng: &mut SmallRng,
) -> f64 {
    const HARD_BOUND_SECS: f64 = 30.0 * 86400.0;

    let mut t = t0;
    loop {
        let mut lambda_max = 0.0f64;
        let mut s = 0.0;
        while s <= lookahead {
            lambda_max = lambda_max.max(lambda(t + s));
            s += SCAN_STEP_SECS;
        }
        let lambda_max = (lambda_max * LAMBDA_MAX_MARGIN).max(LAMBDA_FLOOR_PER_SEC);

        let u: f64 = rng.gen::<f64>().max(f64::MIN_POSITIVE);
        t += -u.ln() / lambda_max;
        if t - t0 >= HARD_BOUND_SECS {
            return HARD_BOUND_SECS;
        }
        if rng.gen::<f64>() * lambda_max <= lambda(t) {
            return t - t0;
        }
    }
}

/// Runtime kernel: thinning against the live, shared [`RateProfile`] with
/// wall-clock anchoring and production gap clamps.
pub struct PoissonKernel {
    profile: Arc<RwLock<RateProfile>>,
    rng: SmallRng,
}

impl PoissonKernel {
    pub fn new(profile: Arc<RwLock<RateProfile>>, rng: SmallRng) -> Self {
        Self { profile, rng }
    }

    /// Draw the gap to the next event of `tag`, anchored at now. The caller
    /// owns the sleep so it can race cancellation and the schedule gate.
    pub fn draw(&mut self, tag: StreamTag) -> Event {
        let origin = Local::now();
        let profile = self.profile.read().clone();
        let lambda = |offset: f64| {
            profile.lambda_at(origin + chrono::Duration::milliseconds((offset * 1000.0) as i64))
        };
        let gap = thinning_gap(&lambda, 0.0, LOOKAHEAD_SECS, &mut self.rng);
        let gap = gap.clamp(MIN_GAP_SECS, MAX_GAP_SECS);
        let lambda_here = lambda(gap) * 3600.0;
        Event {
            tag,
            gap: Duration::from_secs_f64(gap),
            lambda_per_hour: lambda_here,
        }
    }
}
