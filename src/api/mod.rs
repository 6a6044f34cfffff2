//! Control plane: a small warp surface under `/papi`.
//!
//! The prefix is deliberately not `/api`: the host platform's own service
//! worker intercepts its `/api` namespace, and the dashboard must reach us
//! through an ingress proxy. A single opaque key minted at startup guards
//! every endpoint except the health probe; extension endpoints additionally
//! accept a host-issued bearer token.

pub mod ext;

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::Ipv4Addr;
use std::sync::Arc;

use rand::RngCore;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use crate::activity::ActivityLog;
use crate::api::ext::{constant_time_eq, ExtensionManager};
use crate::engines::tor::TorHealth;
use crate::governor::BandwidthGovernor;
use crate::personas::FingerprintBundle;
use crate::scheduler::Scheduler;

const BODY_LIMIT: u64 = 16 * 1024;

pub struct ApiContext {
    pub scheduler: Arc<Scheduler>,
    pub governor: Arc<BandwidthGovernor>,
    pub activity: Arc<ActivityLog>,
    pub tor: Arc<TorHealth>,
    pub ext: Arc<ExtensionManager>,
    pub api_key: String,
    pub match_fingerprint: bool,
    pub cancel: CancellationToken,
}

/// Opaque per-process key; the dashboard receives it out of band.
pub fn mint_api_key() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[derive(Debug)]
struct Unauthorized;
impl warp::reject::Reject for Unauthorized {}

fn with_ctx(
    ctx: Arc<ApiContext>,
) -> impl Filter<Extract = (Arc<ApiContext>,), Error = Infallible> + Clone {
    warp::any().map(move || ctx.clone())
}

/// `X-Api-Key` check for dashboard endpoints.
fn require_key(
    ctx: Arc<ApiContext>,
) -> impl Filter<Extract = (), Error = Rejection> + Clone {
    warp::header::optional::<String>("x-api-key")
        .and_then(move |key: Option<String>| {
            let ctx = ctx.clone();
            async move {
                match key {
                    Some(k) if constant_time_eq(&k, &ctx.api_key) => Ok(()),
                    _ => Err(warp::reject::custom(Unauthorized)),
                }
            }
        })
        .untuple_one()
}

/// `Authorization: Bearer` check for extension endpoints.
fn require_bearer(
    ctx: Arc<ApiContext>,
) -> impl Filter<Extract = (), Error = Rejection> + Clone {
    warp::header::optional::<String>("authorization")
        .and_then(move |header: Option<String>| {
            let ctx = ctx.clone();
            async move {
                let token = header
                    .as_deref()
                    .and_then(|h| h.strip_prefix("Bearer "))
                    .unwrap_or("");
                if !token.is_empty() && ctx.ext.validate_bearer(token) {
                    Ok(())
                } else {
                    Err(warp::reject::custom(Unauthorized))
                }
            }
        })
        .untuple_one()
}

fn json_body() -> impl Filter<Extract = (serde_json::Value,), Error = Rejection> + Clone {
    warp::body::content_length_limit(BODY_LIMIT).and(warp::body::json())
}

pub fn routes(
    ctx: Arc<ApiContext>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let health = warp::path!("papi" / "health")
        .and(warp::get())
        .map(|| warp::reply::json(&json!({"status": "ok"})));

    let status = warp::path!("papi" / "status")
        .and(warp::get())
        .and(require_key(ctx.clone()))
        .and(with_ctx(ctx.clone()))
        .map(handle_status);

    let stats = warp::path!("papi" / "stats")
        .and(warp::get())
        .and(require_key(ctx.clone()))
        .and(with_ctx(ctx.clone()))
        .map(handle_stats);

    let activity = warp::path!("papi" / "activity")
        .and(warp::get())
        .and(require_key(ctx.clone()))
        .and(warp::query::<HashMap<String, String>>())
        .and(with_ctx(ctx.clone()))
        .map(handle_activity);

    let chart = warp::path!("papi" / "activity" / "chart")
        .and(warp::get())
        .and(require_key(ctx.clone()))
        .and(with_ctx(ctx.clone()))
        .map(handle_chart);

    let engines = warp::path!("papi" / "engines")
        .and(warp::get())
        .and(require_key(ctx.clone()))
        .and(with_ctx(ctx.clone()))
        .map(handle_engines);

    let toggle = warp::path!("papi" / "engines" / String / "toggle")
        .and(warp::post())
        .and(require_key(ctx.clone()))
        .and(with_ctx(ctx.clone()))
        .map(handle_toggle);

    let intensity = warp::path!("papi" / "intensity")
        .and(warp::post())
        .and(require_key(ctx.clone()))
        .and(json_body())
        .and(with_ctx(ctx.clone()))
        .map(handle_intensity);

    let fingerprint = warp::path!("papi" / "fingerprint")
        .and(warp::post())
        .and(require_key(ctx.clone()))
        .and(json_body())
        .and(with_ctx(ctx.clone()))
        .map(handle_fingerprint);

    let presence = warp::path!("papi" / "presence")
        .and(warp::post())
        .and(require_key(ctx.clone()))
        .and(json_body())
        .and(with_ctx(ctx.clone()))
        .map(handle_presence);

    let obsession_clear = warp::path!("papi" / "obsession" / "clear")
        .and(warp::post())
        .and(require_key(ctx.clone()))
        .and(with_ctx(ctx.clone()))
        .map(|ctx: Arc<ApiContext>| {
            ctx.scheduler.topics.clear_obsession();
            warp::reply::json(&json!({"status": "ok"}))
        });

    let ext_register = warp::path!("papi" / "ext" / "register")
        .and(warp::post())
        .and(require_bearer(ctx.clone()))
        .and(json_body())
        .and(with_ctx(ctx.clone()))
        .map(|body: serde_json::Value, ctx: Arc<ApiContext>| {
            let intensity = ctx.scheduler.intensity().to_string();
            warp::reply::json(&ctx.ext.register(&body, &intensity))
        });

    let ext_heartbeat = warp::path!("papi" / "ext" / "heartbeat")
        .and(warp::post())
        .and(require_bearer(ctx.clone()))
        .and(json_body())
        .and(with_ctx(ctx.clone()))
        .map(|body: serde_json::Value, ctx: Arc<ApiContext>| {
            let intensity = ctx.scheduler.intensity().to_string();
            warp::reply::json(&ctx.ext.heartbeat(&body, &intensity))
        });

    let ext_fingerprint = warp::path!("papi" / "ext" / "fingerprint")
        .and(warp::post())
        .and(require_bearer(ctx.clone()))
        .and(json_body())
        .and(with_ctx(ctx.clone()))
        .map(|body: serde_json::Value, ctx: Arc<ApiContext>| {
            warp::reply::json(&ctx.ext.store_fingerprint(&body))
        });

    let ext_next_task = warp::path!("papi" / "ext" / "next-task")
        .and(warp::get())
        .and(require_bearer(ctx.clone()))
        .and(with_ctx(ctx.clone()))
        .map(|ctx: Arc<ApiContext>| warp::reply::json(&ctx.ext.next_task()));

    let ext_status = warp::path!("papi" / "ext" / "status")
        .and(warp::get())
        .and(require_key(ctx.clone()))
        .and(with_ctx(ctx))
        .map(|ctx: Arc<ApiContext>| warp::reply::json(&ctx.ext.status()));

    health
        .or(status)
        .or(stats)
        .or(chart)
        .or(activity)
        .or(engines)
        .or(toggle)
        .or(intensity)
        .or(fingerprint)
        .or(presence)
        .or(obsession_clear)
        .or(ext_register)
        .or(ext_heartbeat)
        .or(ext_fingerprint)
        .or(ext_next_task)
        .or(ext_status)
        .recover(handle_rejection)
}

fn handle_status(ctx: Arc<ApiContext>) -> impl Reply {
    let snap = ctx.scheduler.stats.snapshot();
    let persona = ctx
        .scheduler
        .personas
        .current()
        .map(|p| p.name.clone())
        .unwrap_or_else(|| "none".to_string());
    warp::reply::json(&json!({
        "status": ctx.scheduler.status_label(),
        "uptime_seconds": snap.uptime_seconds,
        "current_persona": persona,
        "intensity": ctx.scheduler.intensity().to_string(),
        "fingerprint_matched": ctx.scheduler.personas.fingerprint_matched(),
        "tor_status": ctx.tor.status(),
    }))
}

fn handle_stats(ctx: Arc<ApiContext>) -> impl Reply {
    let snap = ctx.scheduler.stats.snapshot();
    warp::reply::json(&json!({
        "sessions_today": snap.sessions_today,
        "requests_today": snap.requests_today,
        "errors_today": snap.errors_today,
        "bandwidth_today_mb": snap.bandwidth_today_mb,
        "bandwidth_window_mb": ctx.governor.used() as f64 / (1024.0 * 1024.0),
        "active_sessions": ctx.scheduler.sessions.active(),
        "next_session_in": snap.next_session_in,
        "uptime_seconds": snap.uptime_seconds,
    }))
}

fn handle_activity(params: HashMap<String, String>, ctx: Arc<ApiContext>) -> impl Reply {
    let count = params
        .get("count")
        .and_then(|c| c.parse::<usize>().ok())
        .unwrap_or(50)
        .min(crate::activity::RING_CAPACITY);
    warp::reply::json(&json!({"activity": ctx.activity.tail(count)}))
}

fn handle_chart(ctx: Arc<ApiContext>) -> impl Reply {
    warp::reply::json(&json!({"chart": ctx.activity.hourly_chart()}))
}

fn handle_engines(ctx: Arc<ApiContext>) -> impl Reply {
    let engines: HashMap<&str, serde_json::Value> = ctx
        .scheduler
        .engines
        .handles()
        .iter()
        .map(|h| {
            let spec = h.engine.spec();
            (
                spec.name,
                json!({
                    "enabled": h.is_enabled(),
                    "weight": spec.weight,
                    "requires_browser": spec.requires_browser,
                    "allowed_by_safety_default": spec.allowed_by_safety_default,
                    "stats": h.stats.snapshot(),
                }),
            )
        })
        .collect();
    warp::reply::json(&json!({"engines": engines}))
}

fn handle_toggle(name: String, ctx: Arc<ApiContext>) -> warp::reply::Response {
    match ctx.scheduler.engines.toggle(&name) {
        Some(enabled) => {
            info!(engine = %name, enabled, "engine toggled");
            if enabled {
                if let Some(handle) = ctx.scheduler.engines.get(&name) {
                    if !handle.engine.spec().allowed_by_safety_default {
                        warn!(engine = %name, "opt-in engine enabled via control plane");
                    }
                }
                if name == "tor" {
                    ctx.tor.ensure_probe(ctx.cancel.child_token());
                }
            }
            warp::reply::json(&json!({"name": name, "enabled": enabled})).into_response()
        }
        None => warp::reply::with_status(
            warp::reply::json(&json!({"error": format!("unknown engine: {name}")})),
            StatusCode::NOT_FOUND,
        )
        .into_response(),
    }
}

fn handle_intensity(body: serde_json::Value, ctx: Arc<ApiContext>) -> warp::reply::Response {
    let parsed = body
        .get("intensity")
        .and_then(serde_json::Value::as_str)
        .and_then(|s| s.parse::<crate::config::Intensity>().ok());
    match parsed {
        Some(intensity) => {
            ctx.scheduler.set_intensity(intensity);
            warp::reply::json(&json!({"intensity": intensity.to_string()})).into_response()
        }
        None => warp::reply::with_status(
            warp::reply::json(&json!({"error": "invalid intensity"})),
            StatusCode::BAD_REQUEST,
        )
        .into_response(),
    }
}

fn handle_fingerprint(body: serde_json::Value, ctx: Arc<ApiContext>) -> warp::reply::Response {
    if !ctx.match_fingerprint {
        return warp::reply::json(&json!({"status": "disabled"})).into_response();
    }
    match serde_json::from_value::<FingerprintBundle>(body) {
        Ok(bundle) if bundle.width > 0 && bundle.height > 0 => {
            ctx.scheduler.personas.apply_fingerprint(bundle);
            warp::reply::json(&json!({"status": "ok"})).into_response()
        }
        _ => warp::reply::with_status(
            warp::reply::json(&json!({"status": "error"})),
            StatusCode::BAD_REQUEST,
        )
        .into_response(),
    }
}

fn handle_presence(body: serde_json::Value, ctx: Arc<ApiContext>) -> warp::reply::Response {
    match body.get("home").and_then(serde_json::Value::as_bool) {
        Some(home) => {
            ctx.scheduler.set_presence(home);
            warp::reply::json(&json!({"home": home})).into_response()
        }
        None => warp::reply::with_status(
            warp::reply::json(&json!({"error": "expected {\"home\": bool}"})),
            StatusCode::BAD_REQUEST,
        )
        .into_response(),
    }
}

async fn handle_rejection(err: Rejection) -> Result<impl Reply, Rejection> {
    if err.find::<Unauthorized>().is_some() {
        return Ok(warp::reply::with_status(
            warp::reply::json(&json!({"error": "unauthorized"})),
            StatusCode::UNAUTHORIZED,
        ));
    }
    if err.is_not_found() {
        return Ok(warp::reply::with_status(
            warp::reply::json(&json!({"error": "not found"})),
            StatusCode::NOT_FOUND,
        ));
    }
    Err(err)
}

/// Bind and serve until cancellation; in-flight requests drain on shutdown.
pub async fn serve(ctx: Arc<ApiContext>, port: u16) {
    let cancel = ctx.cancel.clone();
    let (addr, server) = warp::serve(routes(ctx)).bind_with_graceful_shutdown(
        (Ipv4Addr::UNSPECIFIED, port),
        async move { cancel.cancelled().await },
    );
    info!(%addr, "control plane listening");
    server.await;
    info!("control plane stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::data::DataHub;
    use crate::driver::stub::{StubBehavior, StubFactory};
    use crate::engines::EngineSet;
    use crate::personas::PersonaRegistry;
    use crate::scheduler::SchedulerStats;
    use crate::session::SessionManager;
    use crate::timing::RateProfile;
    use crate::topics::TopicModel;
    use parking_lot::RwLock;
    use std::time::Duration;

    fn context() -> Arc<ApiContext> {
        let config = Config::default();
        let (hub, _) = DataHub::load(std::path::Path::new("/nonexistent")).unwrap();
        let data = Arc::new(hub);
        let tor = Arc::new(TorHealth::disabled());
        let engines = Arc::new(EngineSet::from_config(&config, tor.clone()));
        let governor = Arc::new(BandwidthGovernor::new(config.max_bandwidth_mb_per_hour));
        let activity = Arc::new(ActivityLog::with_stderr(false));
        let stats = Arc::new(SchedulerStats::new());
        let personas = Arc::new(PersonaRegistry::new(data.snapshot().personas.clone()));
        let topics = Arc::new(TopicModel::new(config.obsession_probability));
        let cancel = CancellationToken::new();
        let sessions = Arc::new(SessionManager::new(
            config.max_concurrent_sessions,
            config.session_length_mean,
            governor.clone(),
            activity.clone(),
            engines.clone(),
            stats.clone(),
            Arc::new(StubFactory {
                behavior: StubBehavior::returning(1000, Duration::ZERO),
            }),
            cancel.child_token(),
        ));
        let profile = Arc::new(RwLock::new(RateProfile::new(config.intensity, 1)));
        let scheduler = Scheduler::new(
            &config,
            profile,
            stats,
            topics,
            personas.clone(),
            engines,
            data.clone(),
            sessions,
            cancel.child_token(),
            1,
        );
        let ext = Arc::new(ExtensionManager::new(
            Some("host-token".to_string()),
            "ext-key".to_string(),
            true,
            personas,
            data,
            3,
        ));
        Arc::new(ApiContext {
            scheduler,
            governor,
            activity,
            tor,
            ext,
            api_key: "test-key".to_string(),
            match_fingerprint: true,
            cancel,
        })
    }

    #[tokio::test]
    async fn health_is_public() {
        let routes = routes(context());
        let resp = warp::test::request()
            .method("GET")
            .path("/papi/health")
            .reply(&routes)
            .await;
        assert_eq!(resp.status(), 200);
    }

    #[tokio::test]
    async fn endpoints_require_the_key() {
        let routes = routes(context());
        for path in ["/papi/status", "/papi/stats", "/papi/engines", "/papi/activity"] {
            let resp = warp::test::request().method("GET").path(path).reply(&routes).await;
            assert_eq!(resp.status(), 401, "{path} should be locked");
        }
        let resp = warp::test::request()
            .method("GET")
            .path("/papi/status")
            .header("x-api-key", "test-key")
            .reply(&routes)
            .await;
        assert_eq!(resp.status(), 200);
    }

    #[tokio::test]
    async fn status_reports_core_fields() {
        let routes = routes(context());
        let resp = warp::test::request()
            .method("GET")
            .path("/papi/status")
            .header("x-api-key", "test-key")
            .reply(&routes)
            .await;
        let body: serde_json::Value = serde_json::from_slice(resp.body()).unwrap();
        assert_eq!(body["status"], "running");
        assert_eq!(body["intensity"], "medium");
        assert_eq!(body["fingerprint_matched"], false);
        assert_eq!(body["tor_status"], "disabled");
    }

    #[tokio::test]
    async fn toggle_round_trips_within_one_request() {
        let routes = routes(context());
        let resp = warp::test::request()
            .method("POST")
            .path("/papi/engines/tor/toggle")
            .header("x-api-key", "test-key")
            .reply(&routes)
            .await;
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = serde_json::from_slice(resp.body()).unwrap();
        assert_eq!(body["enabled"], true);

        let resp = warp::test::request()
            .method("GET")
            .path("/papi/engines")
            .header("x-api-key", "test-key")
            .reply(&routes)
            .await;
        let body: serde_json::Value = serde_json::from_slice(resp.body()).unwrap();
        assert_eq!(body["engines"]["tor"]["enabled"], true);
    }

    #[tokio::test]
    async fn unknown_engine_is_404() {
        let routes = routes(context());
        let resp = warp::test::request()
            .method("POST")
            .path("/papi/engines/warp_drive/toggle")
            .header("x-api-key", "test-key")
            .reply(&routes)
            .await;
        assert_eq!(resp.status(), 404);
    }

    #[tokio::test]
    async fn intensity_change_is_visible_on_status() {
        let ctx = context();
        let routes = routes(ctx.clone());
        let resp = warp::test::request()
            .method("POST")
            .path("/papi/intensity")
            .header("x-api-key", "test-key")
            .json(&json!({"intensity": "paranoid"}))
            .reply(&routes)
            .await;
        assert_eq!(resp.status(), 200);
        assert_eq!(ctx.scheduler.intensity().to_string(), "paranoid");

        let resp = warp::test::request()
            .method("POST")
            .path("/papi/intensity")
            .header("x-api-key", "test-key")
            .json(&json!({"intensity": "ludicrous"}))
            .reply(&routes)
            .await;
        assert_eq!(resp.status(), 400);
    }

    #[tokio::test]
    async fn fingerprint_post_flips_matched_flag() {
        let ctx = context();
        let routes = routes(ctx.clone());
        let resp = warp::test::request()
            .method("POST")
            .path("/papi/fingerprint")
            .header("x-api-key", "test-key")
            .json(&json!({"width": 2560, "height": 1440}))
            .reply(&routes)
            .await;
        assert_eq!(resp.status(), 200);
        assert!(ctx.scheduler.personas.fingerprint_matched());

        let resp = warp::test::request()
            .method("GET")
            .path("/papi/status")
            .header("x-api-key", "test-key")
            .reply(&routes)
            .await;
        let body: serde_json::Value = serde_json::from_slice(resp.body()).unwrap();
        assert_eq!(body["fingerprint_matched"], true);
    }

    #[tokio::test]
    async fn ext_endpoints_take_bearer_not_key() {
        let routes = routes(context());
        let resp = warp::test::request()
            .method("POST")
            .path("/papi/ext/register")
            .header("x-api-key", "test-key")
            .json(&json!({"version": "1.0"}))
            .reply(&routes)
            .await;
        assert_eq!(resp.status(), 401);

        let resp = warp::test::request()
            .method("POST")
            .path("/papi/ext/register")
            .header("authorization", "Bearer host-token")
            .json(&json!({"version": "1.0"}))
            .reply(&routes)
            .await;
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = serde_json::from_slice(resp.body()).unwrap();
        assert_eq!(body["api_key"], "ext-key");

        let resp = warp::test::request()
            .method("GET")
            .path("/papi/ext/next-task")
            .header("authorization", "Bearer ext-key")
            .reply(&routes)
            .await;
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = serde_json::from_slice(resp.body()).unwrap();
        assert!(body["url"].as_str().unwrap().starts_with("http"));
    }

    #[tokio::test]
    async fn presence_controls_away_only_gate() {
        let mut config = Config::default();
        config.schedule_mode = crate::config::ScheduleMode::AwayOnly;
        // Rebuild a context with away_only mode.
        let ctx = {
            let (hub, _) = DataHub::load(std::path::Path::new("/nonexistent")).unwrap();
            let data = Arc::new(hub);
            let tor = Arc::new(TorHealth::disabled());
            let engines = Arc::new(EngineSet::from_config(&config, tor.clone()));
            let governor = Arc::new(BandwidthGovernor::new(50));
            let activity = Arc::new(ActivityLog::with_stderr(false));
            let stats = Arc::new(SchedulerStats::new());
            let personas = Arc::new(PersonaRegistry::new(data.snapshot().personas.clone()));
            let topics = Arc::new(TopicModel::new(0.0));
            let cancel = CancellationToken::new();
            let sessions = Arc::new(SessionManager::new(
                2,
                1.0,
                governor.clone(),
                activity.clone(),
                engines.clone(),
                stats.clone(),
                Arc::new(StubFactory {
                    behavior: StubBehavior::returning(1000, Duration::ZERO),
                }),
                cancel.child_token(),
            ));
            let profile = Arc::new(RwLock::new(RateProfile::new(config.intensity, 1)));
            let scheduler = Scheduler::new(
                &config, profile, stats, topics, personas.clone(), engines, data.clone(),
                sessions, cancel.child_token(), 1,
            );
            let ext = Arc::new(ExtensionManager::new(
                None, "ext-key".into(), true, personas, data, 3,
            ));
            Arc::new(ApiContext {
                scheduler,
                governor,
                activity,
                tor,
                ext,
                api_key: "test-key".into(),
                match_fingerprint: true,
                cancel,
            })
        };
        // Home by default: away_only gate is closed.
        assert!(!ctx.scheduler.gate_open());
        let routes = routes(ctx.clone());
        let resp = warp::test::request()
            .method("POST")
            .path("/papi/presence")
            .header("x-api-key", "test-key")
            .json(&json!({"home": false}))
            .reply(&routes)
            .await;
        assert_eq!(resp.status(), 200);
        assert!(ctx.scheduler.gate_open());
    }
}
