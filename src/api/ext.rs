//! Companion-extension collaborator.
//!
//! The browser extension is an optional remote engine instance: it polls
//! for small noise tasks, executes them inside the operator's real browser,
//! and reports deep fingerprint data back. It is never on the critical
//! path; if it vanishes the core does not care.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde_json::{json, Map, Value};
use tracing::info;

use crate::data::DataHub;
use crate::personas::{FingerprintBundle, PersonaRegistry};

/// Heartbeat staleness window: past this, the extension counts as gone.
const HEARTBEAT_WINDOW: Duration = Duration::from_secs(300);

// Bounds on stored extension-supplied data.
const MAX_FINGERPRINT_KEYS: usize = 50;
const MAX_STATS_KEYS: usize = 10;
const MAX_STRING_LEN: usize = 500;
const MAX_LIST_LEN: usize = 100;

/// Task-type mix for the extension, with per-type delay ranges (ms).
const TASK_WEIGHTS: &[(&str, f64)] = &[("search", 0.45), ("browse", 0.40), ("ad_click", 0.15)];

fn delay_range(task_type: &str) -> (u64, u64) {
    match task_type {
        "search" => (5_000, 15_000),
        "browse" => (8_000, 25_000),
        "ad_click" => (6_000, 12_000),
        _ => (5_000, 15_000),
    }
}

const SEARCH_HOSTS: &[(&str, &str, f64)] = &[
    ("Google", "https://www.google.com/search?q=", 0.55),
    ("Bing", "https://www.bing.com/search?q=", 0.15),
    ("DuckDuckGo", "https://duckduckgo.com/?q=", 0.20),
    ("Yahoo", "https://search.yahoo.com/search?p=", 0.10),
];

struct ExtState {
    connected: bool,
    last_seen: Option<Instant>,
    registered_at: Option<Instant>,
    version: String,
    fingerprint: Map<String, Value>,
    stats: Map<String, Value>,
    actions_completed: u64,
    rng: SmallRng,
}

pub struct ExtensionManager {
    /// Bearer issued by the host platform's auth provider, when configured.
    host_token: Option<String>,
    /// Key minted fresh each process start and handed out at registration.
    api_key: String,
    match_fingerprint: bool,
    personas: Arc<PersonaRegistry>,
    data: Arc<DataHub>,
    state: Mutex<ExtState>,
}

impl ExtensionManager {
    pub fn new(
        host_token: Option<String>,
        api_key: String,
        match_fingerprint: bool,
        personas: Arc<PersonaRegistry>,
        data: Arc<DataHub>,
        seed: u64,
    ) -> Self {
        Self {
            host_token,
            api_key,
            match_fingerprint,
            personas,
            data,
            state: Mutex::new(ExtState {
                connected: false,
                last_seen: None,
                registered_at: None,
                version: String::new(),
                fingerprint: Map::new(),
                stats: Map::new(),
                actions_completed: 0,
                rng: SmallRng::seed_from_u64(seed),
            }),
        }
    }

    /// Accept either the host-issued bearer or the minted key.
    pub fn validate_bearer(&self, token: &str) -> bool {
        let host_ok = self
            .host_token
            .as_deref()
            .map(|t| constant_time_eq(t, token))
            .unwrap_or(false);
        host_ok || constant_time_eq(&self.api_key, token)
    }

    pub fn connected(&self) -> bool {
        let state = self.state.lock();
        state.connected
            && state
                .last_seen
                .map(|t| t.elapsed() < HEARTBEAT_WINDOW)
                .unwrap_or(false)
    }

    pub fn register(&self, body: &Value, intensity: &str) -> Value {
        let mut state = self.state.lock();
        state.connected = true;
        state.last_seen = Some(Instant::now());
        state.registered_at = Some(Instant::now());
        state.version = body
            .get("version")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .chars()
            .take(20)
            .collect();
        if let Some(fp) = body.get("fingerprint").and_then(Value::as_object) {
            state.fingerprint = sanitize_map(fp, MAX_FINGERPRINT_KEYS);
            let fingerprint = state.fingerprint.clone();
            drop(state);
            self.apply_fingerprint_map(&fingerprint);
            info!("extension registered with fingerprint");
        } else {
            drop(state);
            info!("extension registered");
        }
        json!({
            "status": "ok",
            "intensity": intensity,
            "api_key": self.api_key,
        })
    }

    pub fn heartbeat(&self, body: &Value, intensity: &str) -> Value {
        let mut state = self.state.lock();
        state.connected = true;
        state.last_seen = Some(Instant::now());
        if let Some(stats) = body.get("stats").and_then(Value::as_object) {
            state.stats = sanitize_map(stats, MAX_STATS_KEYS);
        }
        if body.get("last_action").is_some() {
            state.actions_completed += 1;
        }
        json!({
            "status": "ok",
            "intensity": intensity,
            "enabled": true,
        })
    }

    pub fn store_fingerprint(&self, body: &Value) -> Value {
        let Some(fp) = body.as_object() else {
            return json!({"status": "error", "message": "fingerprint must be an object"});
        };
        let sanitized = sanitize_map(fp, MAX_FINGERPRINT_KEYS);
        self.state.lock().fingerprint = sanitized.clone();
        self.apply_fingerprint_map(&sanitized);
        info!(
            canvas = sanitized
                .get("canvas_hash")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("?"),
            fonts = sanitized
                .get("fonts")
                .and_then(serde_json::Value::as_array)
                .map(Vec::len)
                .unwrap_or(0),
            "deep fingerprint stored"
        );
        json!({"status": "ok"})
    }

    /// Small noise task for the extension to run in the real browser.
    pub fn next_task(&self) -> Value {
        let tables = self.data.snapshot();
        let mut state = self.state.lock();
        let rng = &mut state.rng;

        let total: f64 = TASK_WEIGHTS.iter().map(|(_, w)| w).sum();
        let mut roll = rng.gen::<f64>() * total;
        let mut task_type = TASK_WEIGHTS[0].0;
        for (name, w) in TASK_WEIGHTS {
            if roll < *w {
                task_type = name;
                break;
            }
            roll -= w;
        }
        let (lo, hi) = delay_range(task_type);
        let delay_ms = rng.gen_range(lo..=hi);

        match task_type {
            "search" => {
                let query = tables
                    .terms
                    .values()
                    .collect::<Vec<_>>()
                    .choose(rng)
                    .and_then(|terms| terms.choose(rng))
                    .cloned()
                    .unwrap_or_else(|| "weather today".to_string());
                let total: f64 = SEARCH_HOSTS.iter().map(|(_, _, w)| w).sum();
                let mut roll = rng.gen::<f64>() * total;
                let mut host = &SEARCH_HOSTS[0];
                for h in SEARCH_HOSTS {
                    if roll < h.2 {
                        host = h;
                        break;
                    }
                    roll -= h.2;
                }
                let encoded: String =
                    url::form_urlencoded::byte_serialize(query.as_bytes()).collect();
                json!({
                    "type": "search",
                    "url": format!("{}{}", host.1, encoded),
                    "query": query,
                    "engine": host.0,
                    "delay_ms": delay_ms,
                })
            }
            "ad_click" => {
                let url = tables
                    .ad_sites
                    .choose(rng)
                    .map(|s| s.url.clone())
                    .unwrap_or_else(|| "https://www.weather.com".to_string());
                json!({"type": "ad_click", "url": url, "delay_ms": delay_ms})
            }
            _ => {
                let url = tables
                    .sites
                    .values()
                    .collect::<Vec<_>>()
                    .choose(rng)
                    .and_then(|sites| sites.choose(rng))
                    .map(|s| s.url.clone())
                    .unwrap_or_else(|| "https://en.wikipedia.org".to_string());
                json!({"type": "browse", "url": url, "delay_ms": delay_ms})
            }
        }
    }

    pub fn status(&self) -> Value {
        let state = self.state.lock();
        json!({
            "connected": state.connected
                && state.last_seen.map(|t| t.elapsed() < HEARTBEAT_WINDOW).unwrap_or(false),
            "version": state.version,
            "actions_completed": state.actions_completed,
            "has_fingerprint": !state.fingerprint.is_empty(),
            "stats": state.stats.clone(),
        })
    }

    fn apply_fingerprint_map(&self, fp: &Map<String, Value>) {
        if !self.match_fingerprint {
            return;
        }
        let bundle = FingerprintBundle {
            user_agent: fp.get("user_agent").and_then(Value::as_str).map(String::from),
            width: fp
                .get("screen_width")
                .or_else(|| fp.get("width"))
                .and_then(Value::as_u64)
                .unwrap_or(0) as u32,
            height: fp
                .get("screen_height")
                .or_else(|| fp.get("height"))
                .and_then(Value::as_u64)
                .unwrap_or(0) as u32,
            platform: fp.get("platform").and_then(Value::as_str).map(String::from),
            languages: fp
                .get("languages")
                .and_then(Value::as_array)
                .map(|l| {
                    l.iter()
                        .filter_map(Value::as_str)
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
            canvas_hash: fp.get("canvas_hash").and_then(Value::as_str).map(String::from),
            webgl_vendor: fp.get("webgl_vendor").and_then(Value::as_str).map(String::from),
            webgl_renderer: fp
                .get("webgl_renderer")
                .and_then(Value::as_str)
                .map(String::from),
            fonts: fp
                .get("fonts")
                .and_then(Value::as_array)
                .map(|l| {
                    l.iter()
                        .filter_map(Value::as_str)
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
        };
        if bundle.user_agent.is_some() || (bundle.width > 0 && bundle.height > 0) {
            self.personas.apply_fingerprint(bundle);
        }
    }
}

/// Length-independent comparison over the shorter of the two inputs plus a
/// length check, so timing does not leak prefix matches.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    let mut diff = (a.len() ^ b.len()) as u8;
    for i in 0..a.len().min(b.len()) {
        diff |= a[i] ^ b[i];
    }
    diff == 0
}

/// Keep extension-supplied JSON bounded: scalar values only, capped key
/// count, capped string lengths, no nesting.
fn sanitize_map(data: &Map<String, Value>, max_keys: usize) -> Map<String, Value> {
    let mut out = Map::new();
    for (k, v) in data.iter().take(max_keys) {
        let key: String = k.chars().take(MAX_STRING_LEN).collect();
        match v {
            Value::String(s) => {
                out.insert(key, Value::String(s.chars().take(MAX_STRING_LEN).collect()));
            }
            Value::Number(_) | Value::Bool(_) => {
                out.insert(key, v.clone());
            }
            Value::Array(items) => {
                let bounded: Vec<Value> = items
                    .iter()
                    .take(MAX_LIST_LEN)
                    .filter_map(|item| match item {
                        Value::String(s) => {
                            Some(Value::String(s.chars().take(MAX_STRING_LEN).collect()))
                        }
                        Value::Number(_) | Value::Bool(_) => Some(item.clone()),
                        _ => None,
                    })
                    .collect();
                out.insert(key, Value::Array(bounded));
            }
            // Nested objects and nulls are dropped.
            _ => {}
        }
    }
    out
}
