//! Session slots, runners, and cancellation.
//!
//! A session is one coherent browsing period: a pinned persona, a topic, a
//! planned duration, and a Markov walk over page states. The manager owns
//! the slot semaphore, admits tasks subject to the bandwidth governor,
//! drives the page driver, and guarantees that slots are released on every
//! exit path, with an auditor counter for the paths that should not exist.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, LogNormal};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::activity::{ActivityEntry, ActivityLog, Outcome};
use crate::driver::DriverFactory;
use crate::engines::{EngineSet, Task, TaskKind};
use crate::governor::BandwidthGovernor;
use crate::scheduler::SchedulerStats;
use crate::timing::{session_seed, BrowseChain, BrowseState};

/// Grace window between a stop request and forced slot release.
pub const STOP_GRACE: Duration = Duration::from_secs(5);
/// Ceiling on any single session regardless of its planned duration.
const SESSION_HARD_CAP: Duration = Duration::from_secs(3 * 3600);
const SESSION_MIN: f64 = 30.0;
const SESSION_MAX: f64 = 7200.0;
const SESSION_SIGMA: f64 = 0.8;
const DNS_LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);
const PAGE_BUDGET_RANGE: (u32, u32) = (6, 24);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Pending,
    Running,
    Stopping,
    Done,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitOutcome {
    Accepted { session_id: u64 },
    Rejected { reason: &'static str },
}

/// Decrements the running-session gauge on every exit path, including task
/// abort during forced shutdown.
struct RunningGuard {
    gauge: Arc<AtomicUsize>,
}

impl RunningGuard {
    fn new(gauge: Arc<AtomicUsize>) -> Self {
        gauge.fetch_add(1, Ordering::SeqCst);
        Self { gauge }
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.gauge.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct SessionManager {
    slots: Arc<Semaphore>,
    max_slots: usize,
    running: Arc<AtomicUsize>,
    seq: AtomicU64,
    governor: Arc<BandwidthGovernor>,
    activity: Arc<ActivityLog>,
    engines: Arc<EngineSet>,
    stats: Arc<SchedulerStats>,
    factory: Arc<dyn DriverFactory>,
    cancel: CancellationToken,
    join: Mutex<JoinSet<()>>,
    session_length_mean_minutes: f64,
    violations: AtomicU64,
}

impl SessionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        max_slots: usize,
        session_length_mean_minutes: f64,
        governor: Arc<BandwidthGovernor>,
        activity: Arc<ActivityLog>,
        engines: Arc<EngineSet>,
        stats: Arc<SchedulerStats>,
        factory: Arc<dyn DriverFactory>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(max_slots)),
            max_slots,
            running: Arc::new(AtomicUsize::new(0)),
            seq: AtomicU64::new(0),
            governor,
            activity,
            engines,
            stats,
            factory,
            cancel,
            join: Mutex::new(JoinSet::new()),
            session_length_mean_minutes,
            violations: AtomicU64::new(0),
        }
    }

    pub fn active(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    pub fn has_free_slot(&self) -> bool {
        self.slots.available_permits() > 0
    }

    /// Auditor counter: zero in any clean run.
    pub fn invariant_violations(&self) -> u64 {
        self.violations.load(Ordering::SeqCst)
    }

    /// Admission: bandwidth governor first, then (for browser tasks) a
    /// session slot reserved before the driver launches.
    pub async fn admit(self: &Arc<Self>, task: Task) -> AdmitOutcome {
        if let Err(reject) = self.governor.admit(task.engine) {
            debug!(
                engine = task.engine,
                used = reject.used,
                cap = reject.cap,
                "task skipped: bandwidth budget"
            );
            self.activity.record(
                ActivityEntry::new(
                    task.engine,
                    format!(
                        "skipped: bandwidth budget ({:.1} of {:.1} MB used)",
                        reject.used as f64 / 1e6,
                        reject.cap as f64 / 1e6
                    ),
                    Outcome::Skipped,
                )
                .with_url(task.url.clone()),
            );
            self.engines.on_complete(&task, Outcome::Skipped, 0);
            return AdmitOutcome::Rejected {
                reason: "bandwidth",
            };
        }

        let session_id = self.seq.fetch_add(1, Ordering::SeqCst) + 1;

        match task.kind {
            TaskKind::Dns => {
                let mgr = self.clone();
                self.spawn(async move {
                    mgr.run_dns(session_id, task).await;
                })
                .await;
                AdmitOutcome::Accepted { session_id }
            }
            TaskKind::Page | TaskKind::Api => {
                let permit = match self.slots.clone().try_acquire_owned() {
                    Ok(p) => p,
                    Err(_) => {
                        debug!(engine = task.engine, "task skipped: no free session slot");
                        self.activity.record(
                            ActivityEntry::new(
                                task.engine,
                                "skipped: all session slots busy",
                                Outcome::Skipped,
                            )
                            .with_url(task.url.clone()),
                        );
                        self.engines.on_complete(&task, Outcome::Skipped, 0);
                        return AdmitOutcome::Rejected { reason: "slots" };
                    }
                };
                self.stats.note_session();
                let mgr = self.clone();
                self.spawn(async move {
                    mgr.run_page_session(session_id, task).await;
                    drop(permit);
                })
                .await;
                AdmitOutcome::Accepted { session_id }
            }
        }
    }

    async fn spawn(&self, fut: impl std::future::Future<Output = ()> + Send + 'static) {
        let mut join = self.join.lock().await;
        // Reap finished runners so the set stays small.
        while join.try_join_next().is_some() {}
        join.spawn(fut);
    }

    /// Stop: cancel everything, wait out the grace window, then force.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let deadline = Instant::now() + STOP_GRACE;
        while self.active() > 0 && Instant::now() < deadline {
            sleep(Duration::from_millis(50)).await;
        }
        let leaked = self.active();
        if leaked > 0 {
            warn!(leaked, "sessions outlived the grace window, force-releasing");
            self.violations.fetch_add(leaked as u64, Ordering::SeqCst);
            self.join.lock().await.abort_all();
        }
        let mut join = self.join.lock().await;
        while join.join_next().await.is_some() {}
        info!("session manager stopped");
    }

    /// Periodic invariant audit: the running gauge can never exceed the
    /// slot count. Recover by counting, not by crashing.
    pub fn audit(&self) {
        let running = self.active();
        if running > self.max_slots {
            error!(running, max = self.max_slots, "slot invariant violated");
            self.violations.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn run_dns(&self, session_id: u64, task: Task) {
        self.engines.begin_task(task.engine);
        let mut rng = SmallRng::seed_from_u64(session_id);
        let mut resolved = 0u32;
        let mut failed = false;

        let hosts = std::iter::once(task.url.clone())
            .chain(task.dns_burst.iter().cloned())
            .collect::<Vec<_>>();
        for (i, host) in hosts.iter().enumerate() {
            if self.cancel.is_cancelled() {
                break;
            }
            match timeout(DNS_LOOKUP_TIMEOUT, tokio::net::lookup_host((host.as_str(), 443))).await {
                Ok(Ok(_)) => resolved += 1,
                _ => {
                    failed = i == 0;
                    debug!(host = %host, "dns lookup failed");
                }
            }
            if i + 1 < hosts.len() {
                let pause = Duration::from_millis(rng.gen_range(100..1000));
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = sleep(pause) => {}
                }
            }
        }

        let bytes = task.expected_bytes * resolved as u64;
        let outcome = if failed { Outcome::Error } else { Outcome::Ok };
        self.governor.record(task.engine, bytes);
        self.engines.on_complete(&task, outcome, bytes);
        self.engines.end_task(task.engine);
        self.stats.note_requests(resolved as u64);
        self.stats.note_bytes(bytes);
        if failed {
            self.stats.note_error();
        }
        let detail = if task.dns_burst.is_empty() {
            format!("resolved {} ({})", task.url, task.category)
        } else {
            format!(
                "resolved {} + burst of {} ({})",
                task.url,
                task.dns_burst.len(),
                task.category
            )
        };
        self.activity.record(
            ActivityEntry::new(task.engine, detail, outcome)
                .with_bytes(bytes)
                .with_session(task.persona.name.clone(), session_id),
        );
    }

    fn draw_planned_duration(&self, rng: &mut SmallRng) -> Duration {
        let median_secs = self.session_length_mean_minutes * 60.0;
        let dist = LogNormal::new(median_secs.ln(), SESSION_SIGMA).expect("valid log-normal");
        Duration::from_secs_f64(dist.sample(rng).clamp(SESSION_MIN, SESSION_MAX))
    }

    /// Per-state ceiling: twice the dwell median, floored so page loads get
    /// a fair chance.
    fn state_cap(state: BrowseState, tor: bool) -> Duration {
        let base = state.dwell_median().mul_f64(2.0).max(Duration::from_secs(15));
        if tor {
            base.mul_f64(2.0)
        } else {
            base
        }
    }

    async fn run_page_session(&self, session_id: u64, task: Task) {
        let _guard = RunningGuard::new(self.running.clone());
        self.engines.begin_task(task.engine);

        let mut state = SessionState::Pending;
        debug!(session_id, ?state, "session admitted");
        let seed = session_seed(&task.persona.name, &task.category, task.query.as_deref());
        let mut chain = BrowseChain::from_seed(seed);
        let mut rng = SmallRng::seed_from_u64(seed ^ session_id);
        let planned = self.draw_planned_duration(&mut rng);
        let hard_cap = planned.mul_f64(1.5).min(SESSION_HARD_CAP);
        let page_budget = rng.gen_range(PAGE_BUDGET_RANGE.0..=PAGE_BUDGET_RANGE.1);
        let is_tor = task.proxy.is_some();

        info!(
            session_id,
            engine = task.engine,
            persona = %task.persona.name,
            category = %task.category,
            planned_secs = planned.as_secs(),
            "session starting"
        );

        let mut driver = match self.factory.create(&task.persona, task.proxy.as_deref()) {
            Ok(d) => d,
            Err(e) => {
                warn!(session_id, error = %e, "driver creation failed");
                self.finish(session_id, &task, SessionState::Failed, 0, 0, "driver unavailable")
                    .await;
                return;
            }
        };

        let started = Instant::now();
        let mut bytes_consumed: u64 = 0;
        let mut pages: u64 = 0;
        let mut followups = task.followups.clone();
        let mut failure: Option<String> = None;
        let mut cancelled = false;
        state = SessionState::Running;
        debug!(session_id, ?state, "driver ready");

        // Landing page.
        let cap = Self::state_cap(BrowseState::Land, is_tor);
        match timeout(cap, driver.open(&task.url, cap)).await {
            Ok(visit) if visit.ok => {
                self.governor.record(task.engine, visit.bytes_read);
                bytes_consumed += visit.bytes_read;
                pages += 1;
            }
            Ok(visit) => failure = visit.error.or_else(|| Some("landing failed".into())),
            Err(_) => failure = Some("landing timed out".into()),
        }

        // Engine-specific settle delay after the landing load.
        if failure.is_none() && task.post_delay_ms > 0 {
            tokio::select! {
                _ = self.cancel.cancelled() => cancelled = true,
                _ = sleep(Duration::from_millis(task.post_delay_ms)) => {}
            }
        }

        while failure.is_none() && !cancelled {
            if self.cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            if started.elapsed() >= planned || started.elapsed() >= hard_cap {
                break;
            }
            if pages >= page_budget as u64 {
                debug!(session_id, pages, "page budget exhausted");
                break;
            }

            let browse_state = chain.step();
            if browse_state == BrowseState::Leave {
                break;
            }
            // The rolling budget is re-checked before every further page so
            // a long session cannot blow past the cap on admission credit.
            if matches!(
                browse_state,
                BrowseState::FollowLink | BrowseState::SearchRefine | BrowseState::AdGlance
            ) && self.governor.admit(task.engine).is_err()
            {
                debug!(session_id, "budget reached mid-session, leaving early");
                break;
            }
            let cap = Self::state_cap(browse_state, is_tor);

            let visit = match browse_state {
                BrowseState::FollowLink if driver.link_count() > 0 => {
                    let idx = rng.gen_range(0..driver.link_count());
                    match timeout(cap, driver.follow(idx, cap)).await {
                        Ok(v) => Some(v),
                        Err(_) => {
                            failure = Some("follow timed out".into());
                            None
                        }
                    }
                }
                BrowseState::SearchRefine => {
                    if let Some(next) = followups.pop() {
                        match timeout(cap, driver.open(&next, cap)).await {
                            Ok(v) => Some(v),
                            Err(_) => {
                                failure = Some("refine timed out".into());
                                None
                            }
                        }
                    } else {
                        None
                    }
                }
                BrowseState::AdGlance if task.click_ads => {
                    match timeout(cap, driver.click_ad(cap)).await {
                        Ok(v) => Some(v),
                        Err(_) => {
                            failure = Some("ad interaction timed out".into());
                            None
                        }
                    }
                }
                _ => None,
            };

            if let Some(visit) = visit {
                if visit.ok {
                    self.governor.record(task.engine, visit.bytes_read);
                    bytes_consumed += visit.bytes_read;
                    pages += 1;
                } else {
                    failure = visit.error.or_else(|| Some("page action failed".into()));
                }
            }
            if failure.is_some() {
                break;
            }

            // Dwell in the state, racing cancellation.
            let dwell = chain.dwell();
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    cancelled = true;
                }
                _ = sleep(dwell) => {}
            }
            if cancelled {
                break;
            }
        }

        driver.close().await;

        self.stats.note_requests(pages);
        self.stats.note_bytes(bytes_consumed);

        state = if failure.is_some() {
            SessionState::Failed
        } else if cancelled {
            SessionState::Stopping
        } else {
            SessionState::Done
        };
        let detail = match &failure {
            Some(reason) => reason.clone(),
            None if cancelled => "cancelled by scheduler stop".to_string(),
            None => format!(
                "{} pages over {}s ({})",
                pages,
                started.elapsed().as_secs(),
                task.category
            ),
        };
        if failure.is_some() {
            self.stats.note_error();
        }
        self.finish(session_id, &task, state, bytes_consumed, pages, &detail)
            .await;
    }

    async fn finish(
        &self,
        session_id: u64,
        task: &Task,
        state: SessionState,
        bytes: u64,
        pages: u64,
        detail: &str,
    ) {
        let outcome = match state {
            SessionState::Failed => Outcome::Error,
            SessionState::Stopping => Outcome::Skipped,
            _ => Outcome::Ok,
        };
        self.engines.on_complete(task, outcome, bytes);
        self.engines.end_task(task.engine);
        let verb = match state {
            SessionState::Failed => "session failed",
            SessionState::Stopping => "session cancelled",
            _ => "session done",
        };
        info!(session_id, engine = task.engine, bytes, pages, "{verb}: {detail}");
        self.activity.record(
            ActivityEntry::new(task.engine, format!("{verb}: {detail}"), outcome)
                .with_url(task.url.clone())
                .with_bytes(bytes)
                .with_session(task.persona.name.clone(), session_id),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::driver::stub::{StubBehavior, StubFactory};
    use crate::engines::tor::TorHealth;
    use crate::engines::EngineSet;

    fn make_manager(
        max_slots: usize,
        behavior: Arc<StubBehavior>,
    ) -> (Arc<SessionManager>, Arc<EngineSet>, Arc<ActivityLog>, Arc<SchedulerStats>) {
        let governor = Arc::new(BandwidthGovernor::new(50));
        let activity = Arc::new(ActivityLog::with_stderr(false));
        let engines = Arc::new(EngineSet::from_config(
            &Config::default(),
            Arc::new(TorHealth::disabled()),
        ));
        let stats = Arc::new(SchedulerStats::new());
        let mgr = Arc::new(SessionManager::new(
            max_slots,
            1.0,
            governor,
            activity.clone(),
            engines.clone(),
            stats.clone(),
            Arc::new(StubFactory { behavior }),
            CancellationToken::new(),
        ));
        (mgr, engines, activity, stats)
    }

    fn page_task(engine: &'static str) -> Task {
        Task {
            engine,
            url: "https://example.com".into(),
            kind: TaskKind::Page,
            expected_bytes: 300_000,
            post_delay_ms: 0,
            category: "tech".into(),
            query: Some("nas build".into()),
            followups: Vec::new(),
            dns_burst: Vec::new(),
            proxy: None,
            click_ads: false,
            persona: crate::engines::tests::test_persona(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sessions_complete_and_release_slots() {
        let behavior = StubBehavior::returning(300_000, Duration::from_secs(2));
        let (mgr, engines, activity, _stats) = make_manager(1, behavior);
        let outcome = mgr.admit(page_task("search")).await;
        assert!(matches!(outcome, AdmitOutcome::Accepted { .. }));

        // Let the session run to completion under the paused clock.
        for _ in 0..2000 {
            tokio::time::sleep(Duration::from_secs(1)).await;
            if mgr.active() == 0 && activity.len() > 0 {
                break;
            }
        }
        assert_eq!(mgr.active(), 0);
        assert!(mgr.has_free_slot());
        assert_eq!(mgr.invariant_violations(), 0);
        let snap = engines.get("search").unwrap().stats.snapshot();
        assert!(snap.requests >= 1);
        assert_eq!(snap.errors, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn slot_exhaustion_rejects_as_skipped() {
        let behavior = StubBehavior::returning(1000, Duration::from_secs(30));
        let (mgr, engines, activity, _stats) = make_manager(1, behavior);
        assert!(matches!(
            mgr.admit(page_task("search")).await,
            AdmitOutcome::Accepted { .. }
        ));
        tokio::task::yield_now().await;
        // Second task cannot get the slot while the first runs.
        let outcome = mgr.admit(page_task("search")).await;
        assert_eq!(outcome, AdmitOutcome::Rejected { reason: "slots" });
        assert!(activity.tail(10).iter().any(|e| e.outcome == Outcome::Skipped));
        let snap = engines.get("search").unwrap().stats.snapshot();
        assert_eq!(snap.skipped, 1);
        assert_eq!(snap.errors, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn bandwidth_rejection_is_skipped_not_error() {
        let governor = Arc::new(BandwidthGovernor::new(1));
        governor.record("search", 2_000_000);
        let activity = Arc::new(ActivityLog::with_stderr(false));
        let engines = Arc::new(EngineSet::from_config(
            &Config::default(),
            Arc::new(TorHealth::disabled()),
        ));
        let stats = Arc::new(SchedulerStats::new());
        let mgr = Arc::new(SessionManager::new(
            2,
            1.0,
            governor,
            activity.clone(),
            engines.clone(),
            stats,
            Arc::new(StubFactory {
                behavior: StubBehavior::returning(1000, Duration::ZERO),
            }),
            CancellationToken::new(),
        ));
        let outcome = mgr.admit(page_task("search")).await;
        assert_eq!(outcome, AdmitOutcome::Rejected { reason: "bandwidth" });
        let snap = engines.get("search").unwrap().stats.snapshot();
        assert_eq!(snap.skipped, 1);
        assert_eq!(snap.errors, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn driver_failures_fail_the_session_cleanly() {
        // Every call fails: landing always errors.
        let behavior = StubBehavior::failing_every(1000, Duration::ZERO, 1);
        let (mgr, engines, activity, stats) = make_manager(2, behavior);
        mgr.admit(page_task("browse")).await;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_secs(1)).await;
            if mgr.active() == 0 && activity.len() > 0 {
                break;
            }
        }
        assert_eq!(mgr.active(), 0);
        assert!(mgr.has_free_slot());
        let snap = engines.get("browse").unwrap().stats.snapshot();
        assert_eq!(snap.errors, 1);
        assert_eq!(stats.snapshot().errors_today, 1);
        assert!(activity.tail(5).iter().any(|e| e.outcome == Outcome::Error));
        assert_eq!(mgr.invariant_violations(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_within_grace_and_logs_cancellation() {
        let behavior = StubBehavior::returning(1000, Duration::from_secs(1));
        let (mgr, _engines, activity, _stats) = make_manager(2, behavior);
        mgr.admit(page_task("browse")).await;
        mgr.admit(page_task("browse")).await;
        tokio::time::sleep(Duration::from_secs(3)).await;
        mgr.stop().await;
        assert_eq!(mgr.active(), 0);
        assert_eq!(mgr.invariant_violations(), 0);
        // In-flight sessions were not silently dropped.
        assert!(activity
            .tail(10)
            .iter()
            .any(|e| e.detail.contains("cancelled") || e.detail.contains("session done")));
    }

    #[tokio::test(start_paused = true)]
    async fn dns_tasks_bypass_slots() {
        let behavior = StubBehavior::returning(1000, Duration::from_secs(60));
        let (mgr, _engines, _activity, _stats) = make_manager(1, behavior);
        // Occupy the only slot.
        mgr.admit(page_task("search")).await;
        tokio::task::yield_now().await;
        assert!(!mgr.has_free_slot());
        let mut dns = page_task("dns");
        dns.kind = TaskKind::Dns;
        dns.url = "localhost".into();
        dns.expected_bytes = 1024;
        // DNS admission succeeds despite zero free slots.
        let outcome = mgr.admit(dns).await;
        assert!(matches!(outcome, AdmitOutcome::Accepted { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_never_exceeds_slots() {
        let behavior = StubBehavior::returning(1000, Duration::from_secs(20));
        let (mgr, _engines, _activity, _stats) = make_manager(3, behavior);
        for _ in 0..10 {
            mgr.admit(page_task("browse")).await;
            tokio::task::yield_now().await;
            assert!(mgr.active() <= 3, "active {} > 3", mgr.active());
        }
        mgr.audit();
        assert_eq!(mgr.invariant_violations(), 0);
    }
}
