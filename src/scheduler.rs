//! Top-level orchestration.
//!
//! One loop per event stream: session starts from the Poisson kernel, DNS
//! ticks on their own kernel stream, and a slow sweep for obsession expiry
//! and the slot auditor. Events that fire while the schedule gate is closed
//! are discarded, never queued; the kernel suspends while the gate stays
//! shut so no work is drawn at all.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Local, NaiveDate, Timelike};
use parking_lot::{Mutex, RwLock};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, Intensity, ScheduleMode};
use crate::data::DataHub;
use crate::engines::EngineSet;
use crate::personas::PersonaRegistry;
use crate::session::SessionManager;
use crate::timing::{PoissonKernel, RateProfile, StreamTag};
use crate::topics::TopicModel;

const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// Daily counters behind the `/stats` endpoint. "Today" rolls at local
/// midnight; the roll is lazy, checked on every update.
pub struct SchedulerStats {
    started: Instant,
    day: Mutex<NaiveDate>,
    sessions: AtomicU64,
    requests: AtomicU64,
    errors: AtomicU64,
    bytes: AtomicU64,
    next_eta: Mutex<Option<Instant>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub sessions_today: u64,
    pub requests_today: u64,
    pub errors_today: u64,
    pub bandwidth_today_mb: f64,
    pub uptime_seconds: u64,
    pub next_session_in: Option<u64>,
}

impl SchedulerStats {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            day: Mutex::new(Local::now().date_naive()),
            sessions: AtomicU64::new(0),
            requests: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            next_eta: Mutex::new(None),
        }
    }

    fn roll_day(&self) {
        let today = Local::now().date_naive();
        let mut day = self.day.lock();
        if *day != today {
            *day = today;
            self.sessions.store(0, Ordering::Relaxed);
            self.requests.store(0, Ordering::Relaxed);
            self.errors.store(0, Ordering::Relaxed);
            self.bytes.store(0, Ordering::Relaxed);
        }
    }

    pub fn note_session(&self) {
        self.roll_day();
        self.sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_requests(&self, n: u64) {
        self.roll_day();
        self.requests.fetch_add(n, Ordering::Relaxed);
    }

    pub fn note_error(&self) {
        self.roll_day();
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_bytes(&self, n: u64) {
        self.roll_day();
        self.bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn set_next_eta(&self, eta: Instant) {
        *self.next_eta.lock() = Some(eta);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.roll_day();
        let next_eta = *self.next_eta.lock();
        let next_session_in =
            next_eta.map(|eta| eta.saturating_duration_since(Instant::now()).as_secs());
        StatsSnapshot {
            sessions_today: self.sessions.load(Ordering::Relaxed),
            requests_today: self.requests.load(Ordering::Relaxed),
            errors_today: self.errors.load(Ordering::Relaxed),
            bandwidth_today_mb: self.bytes.load(Ordering::Relaxed) as f64 / (1024.0 * 1024.0),
            uptime_seconds: self.started.elapsed().as_secs(),
            next_session_in,
        }
    }
}

impl Default for SchedulerStats {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Scheduler {
    schedule_mode: ScheduleMode,
    custom_hours: Vec<(u8, u8)>,
    profile: Arc<RwLock<RateProfile>>,
    intensity: RwLock<Intensity>,
    presence_home: RwLock<bool>,
    gate_tx: watch::Sender<bool>,
    gate_rx: watch::Receiver<bool>,
    seed: u64,
    pub stats: Arc<SchedulerStats>,
    pub topics: Arc<TopicModel>,
    pub personas: Arc<PersonaRegistry>,
    pub engines: Arc<EngineSet>,
    pub data: Arc<DataHub>,
    pub sessions: Arc<SessionManager>,
    cancel: CancellationToken,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &Config,
        profile: Arc<RwLock<RateProfile>>,
        stats: Arc<SchedulerStats>,
        topics: Arc<TopicModel>,
        personas: Arc<PersonaRegistry>,
        engines: Arc<EngineSet>,
        data: Arc<DataHub>,
        sessions: Arc<SessionManager>,
        cancel: CancellationToken,
        seed: u64,
    ) -> Arc<Self> {
        let (gate_tx, gate_rx) = watch::channel(true);
        let scheduler = Arc::new(Self {
            schedule_mode: config.schedule_mode,
            custom_hours: config.custom_hours.clone(),
            profile,
            intensity: RwLock::new(config.intensity),
            presence_home: RwLock::new(true),
            gate_tx,
            gate_rx,
            seed,
            stats,
            topics,
            personas,
            engines,
            data,
            sessions,
            cancel,
        });
        scheduler.refresh_gate();
        scheduler
    }

    pub fn intensity(&self) -> Intensity {
        *self.intensity.read()
    }

    /// Runtime intensity change; the kernel picks it up on its next
    /// candidate draw.
    pub fn set_intensity(&self, intensity: Intensity) {
        *self.intensity.write() = intensity;
        self.profile.write().set_intensity(intensity);
        info!(%intensity, "intensity changed");
    }

    pub fn presence_home(&self) -> bool {
        *self.presence_home.read()
    }

    pub fn set_presence(&self, home: bool) {
        *self.presence_home.write() = home;
        self.refresh_gate();
        info!(home, "presence updated");
    }

    /// Whether events may fire right now.
    pub fn gate_open(&self) -> bool {
        let home = self.presence_home();
        match self.schedule_mode {
            ScheduleMode::Always => true,
            ScheduleMode::HomeOnly => home,
            ScheduleMode::AwayOnly => !home,
            ScheduleMode::Custom => {
                let hour = Local::now().hour() as u8;
                self.custom_hours
                    .iter()
                    .any(|&(lo, hi)| hour >= lo && hour <= hi)
            }
        }
    }

    /// Recompute and publish the gate; wakes any kernel loop suspended on it.
    pub fn refresh_gate(&self) {
        let open = self.gate_open();
        self.gate_tx.send_if_modified(|current| {
            if *current != open {
                info!(open, "schedule gate changed");
                *current = open;
                true
            } else {
                false
            }
        });
    }

    pub fn status_label(&self) -> &'static str {
        if self.cancel.is_cancelled() {
            "stopped"
        } else if self.sessions.invariant_violations() > 0 {
            "error"
        } else if self.gate_open() {
            "running"
        } else {
            "paused"
        }
    }

    /// Primary loop: session-start events.
    pub async fn run(self: Arc<Self>) {
        let mut kernel = PoissonKernel::new(
            self.profile.clone(),
            SmallRng::seed_from_u64(self.seed ^ 0x5e55_1057),
        );
        let mut rng = SmallRng::seed_from_u64(self.seed.rotate_left(17));
        let mut gate = self.gate_rx.clone();
        info!("scheduler started");

        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            // Suspend while the gate is closed: no draws, no phantom events.
            if !*gate.borrow() {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    res = gate.changed() => {
                        if res.is_err() {
                            break;
                        }
                        continue;
                    }
                }
            }

            let event = kernel.draw(StreamTag::SessionStart);
            self.stats.set_next_eta(Instant::now() + event.gap);
            debug!(
                gap_secs = event.gap.as_secs_f64(),
                lambda_per_hour = event.lambda_per_hour,
                "next session event drawn"
            );
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = sleep(event.gap) => {}
            }
            // The gate may have closed mid-sleep; a closed gate discards
            // the event rather than queueing it.
            if !self.gate_open() {
                debug!("event discarded: schedule gate closed");
                continue;
            }
            self.fire_session_event(&mut rng).await;
        }
        info!("scheduler stopped");
    }

    async fn fire_session_event(&self, rng: &mut SmallRng) {
        let tables = self.data.snapshot();
        let engines = self.engines.clone();
        let topic = self
            .topics
            .next_topic(&tables, &|c| engines.category_allowed(c), rng);
        let Some(persona) = self.personas.select(rng) else {
            warn!("no personas available, event dropped");
            return;
        };
        let browser_slot_free = self.sessions.has_free_slot();
        let Some(task) =
            self.engines
                .dispatch(&topic, &persona, &tables, browser_slot_free, rng)
        else {
            debug!("no engine produced a task for this event");
            return;
        };
        self.sessions.admit(task).await;
    }

    /// Auxiliary stream: independent DNS ticks. Shares the rate profile but
    /// draws from its own kernel substream.
    pub async fn run_dns_ticks(self: Arc<Self>) {
        let mut kernel = PoissonKernel::new(
            self.profile.clone(),
            SmallRng::seed_from_u64(self.seed ^ 0x0d25_71c4),
        );
        let mut rng = SmallRng::seed_from_u64(self.seed.rotate_left(41));
        let mut gate = self.gate_rx.clone();

        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            if !*gate.borrow() {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    res = gate.changed() => {
                        if res.is_err() {
                            break;
                        }
                        continue;
                    }
                }
            }
            let event = kernel.draw(StreamTag::DnsTick);
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = sleep(event.gap) => {}
            }
            if !self.gate_open() {
                continue;
            }
            let Some(handle) = self.engines.get("dns") else {
                continue;
            };
            if !handle.is_enabled() {
                continue;
            }
            let tables = self.data.snapshot();
            let engines = self.engines.clone();
            let topic = self
                .topics
                .next_topic(&tables, &|c| engines.category_allowed(c), &mut rng);
            let Some(persona) = self.personas.select(&mut rng) else {
                continue;
            };
            if let Some(task) =
                handle
                    .engine
                    .produce_task(&topic, &persona, &tables, &mut rng)
            {
                self.sessions.admit(task).await;
            }
        }
    }

    /// Slow sweep: obsession expiry, slot audit, gate re-evaluation for the
    /// custom schedule (whose openness depends on the wall clock).
    pub async fn run_sweep(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = sleep(SWEEP_INTERVAL) => {}
            }
            debug!(tag = ?StreamTag::ObsessionRefresh, "sweep tick");
            self.topics.expire_check();
            self.sessions.audit();
            self.refresh_gate();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_snapshot_reports_counters() {
        let stats = SchedulerStats::new();
        stats.note_session();
        stats.note_requests(3);
        stats.note_error();
        stats.note_bytes(2 * 1024 * 1024);
        let snap = stats.snapshot();
        assert_eq!(snap.sessions_today, 1);
        assert_eq!(snap.requests_today, 3);
        assert_eq!(snap.errors_today, 1);
        assert!((snap.bandwidth_today_mb - 2.0).abs() < 1e-9);
        assert!(snap.next_session_in.is_none());
    }

    #[test]
    fn eta_is_exposed() {
        let stats = SchedulerStats::new();
        stats.set_next_eta(Instant::now() + Duration::from_secs(90));
        let snap = stats.snapshot();
        let eta = snap.next_session_in.unwrap();
        assert!((89..=90).contains(&eta));
    }
}
