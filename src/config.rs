//! Layered configuration: host options blob > `POISSON_*` environment
//! variables > compiled defaults.
//!
//! The host platform dumps add-on options as JSON to a known path. Some
//! supervisors wrap the blob as `{"result":"ok","data":{...}}`; both shapes
//! are accepted. Every key is validated up front so a bad deployment fails
//! at startup rather than mid-run.

use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::ConfigError;

const OPTIONS_PATHS: &[&str] = &["/tmp/options.json", "/data/options.json"];
const ENV_PREFIX: &str = "POISSON_";

const MIN_CONCURRENT_SESSIONS: usize = 1;
const MAX_CONCURRENT_SESSIONS: usize = 5;
const MIN_BANDWIDTH_MB: u64 = 1;
const MAX_BANDWIDTH_MB: u64 = 10_000;

/// Event-rate preset. The mapping to events/hour lives in
/// [`Intensity::events_per_hour`] and feeds the timing kernel's base λ.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Intensity {
    Low,
    Medium,
    High,
    Paranoid,
}

impl Intensity {
    pub fn events_per_hour(self) -> f64 {
        match self {
            Intensity::Low => 18.0,
            Intensity::Medium => 60.0,
            Intensity::High => 150.0,
            Intensity::Paranoid => 300.0,
        }
    }
}

impl fmt::Display for Intensity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Intensity::Low => "low",
            Intensity::Medium => "medium",
            Intensity::High => "high",
            Intensity::Paranoid => "paranoid",
        };
        f.write_str(s)
    }
}

impl FromStr for Intensity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Intensity::Low),
            "medium" => Ok(Intensity::Medium),
            "high" => Ok(Intensity::High),
            "paranoid" => Ok(Intensity::Paranoid),
            other => Err(format!(
                "unknown intensity `{other}` (expected low|medium|high|paranoid)"
            )),
        }
    }
}

/// When the scheduler is allowed to emit events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleMode {
    Always,
    HomeOnly,
    AwayOnly,
    Custom,
}

impl FromStr for ScheduleMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "always" => Ok(ScheduleMode::Always),
            "home_only" => Ok(ScheduleMode::HomeOnly),
            "away_only" => Ok(ScheduleMode::AwayOnly),
            "custom" => Ok(ScheduleMode::Custom),
            other => Err(format!(
                "unknown schedule_mode `{other}` (expected always|home_only|away_only|custom)"
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub intensity: Intensity,
    pub enable_search_noise: bool,
    pub enable_browse_noise: bool,
    pub enable_dns_noise: bool,
    pub enable_ad_clicks: bool,
    pub enable_tor: bool,
    pub enable_research_noise: bool,
    pub max_bandwidth_mb_per_hour: u64,
    pub max_concurrent_sessions: usize,
    pub match_browser_fingerprint: bool,
    pub schedule_mode: ScheduleMode,
    /// Hour ranges for `schedule_mode = custom`, e.g. `"9-17,20-23"`.
    pub custom_hours: Vec<(u8, u8)>,
    /// Log-normal median session length, in minutes.
    pub session_length_mean: f64,
    pub obsession_probability: f64,
    pub log_level: String,
    pub api_port: u16,
    /// Directory holding the optional YAML data files.
    pub data_dir: PathBuf,
    /// Root seed for all RNG substreams. Random when absent.
    pub rng_seed: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            intensity: Intensity::Medium,
            enable_search_noise: true,
            enable_browse_noise: true,
            enable_dns_noise: true,
            enable_ad_clicks: false,
            enable_tor: false,
            enable_research_noise: false,
            max_bandwidth_mb_per_hour: 50,
            max_concurrent_sessions: 2,
            match_browser_fingerprint: true,
            schedule_mode: ScheduleMode::Always,
            custom_hours: Vec::new(),
            session_length_mean: 15.0,
            obsession_probability: 0.02,
            log_level: "info".to_string(),
            api_port: 8099,
            data_dir: PathBuf::from("/app/data"),
            rng_seed: None,
        }
    }
}

impl Config {
    /// Load and validate, layering the options blob and environment over the
    /// defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let mut cfg = Config::default();

        let override_path = env::var(format!("{ENV_PREFIX}OPTIONS_PATH")).ok();
        let candidates: Vec<PathBuf> = override_path
            .iter()
            .map(PathBuf::from)
            .chain(OPTIONS_PATHS.iter().map(PathBuf::from))
            .collect();

        let mut loaded_from = None;
        for path in &candidates {
            if !path.exists() {
                continue;
            }
            cfg.apply_options_file(path)?;
            loaded_from = Some(path.clone());
            break;
        }
        match &loaded_from {
            Some(p) => info!(path = %p.display(), "loaded host options"),
            None => warn!("no readable options blob found, using defaults"),
        }

        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_options_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::InvalidValue {
            key: "options",
            reason: format!("cannot read {}: {e}", path.display()),
        })?;
        let mut value: serde_json::Value =
            serde_json::from_str(&raw).map_err(|source| ConfigError::MalformedOptions {
                path: path.to_path_buf(),
                source,
            })?;
        // Supervisor API responses wrap the options in a result envelope.
        if let Some(data) = value.get("data").filter(|d| d.is_object()) {
            value = data.clone();
        }
        let obj = match value.as_object() {
            Some(o) => o,
            None => {
                warn!(path = %path.display(), "options blob is not a JSON object, ignoring");
                return Ok(());
            }
        };
        self.apply_json(obj)
    }

    fn apply_json(
        &mut self,
        obj: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), ConfigError> {
        use serde_json::Value;

        fn as_bool(key: &'static str, v: &Value) -> Result<bool, ConfigError> {
            v.as_bool().ok_or_else(|| ConfigError::InvalidValue {
                key,
                reason: format!("expected bool, got {v}"),
            })
        }
        fn as_u64(key: &'static str, v: &Value) -> Result<u64, ConfigError> {
            v.as_u64().ok_or_else(|| ConfigError::InvalidValue {
                key,
                reason: format!("expected non-negative integer, got {v}"),
            })
        }
        fn as_f64(key: &'static str, v: &Value) -> Result<f64, ConfigError> {
            v.as_f64().ok_or_else(|| ConfigError::InvalidValue {
                key,
                reason: format!("expected number, got {v}"),
            })
        }
        fn as_str<'a>(key: &'static str, v: &'a Value) -> Result<&'a str, ConfigError> {
            v.as_str().ok_or_else(|| ConfigError::InvalidValue {
                key,
                reason: format!("expected string, got {v}"),
            })
        }

        // Unknown keys are ignored so the host can carry extra options.
        for (key, v) in obj {
            match key.as_str() {
                "intensity" => {
                    self.intensity = as_str("intensity", v)?.parse().map_err(|reason| {
                        ConfigError::InvalidValue {
                            key: "intensity",
                            reason,
                        }
                    })?;
                }
                "enable_search_noise" => self.enable_search_noise = as_bool("enable_search_noise", v)?,
                "enable_browse_noise" => self.enable_browse_noise = as_bool("enable_browse_noise", v)?,
                "enable_dns_noise" => self.enable_dns_noise = as_bool("enable_dns_noise", v)?,
                "enable_ad_clicks" => self.enable_ad_clicks = as_bool("enable_ad_clicks", v)?,
                "enable_tor" => self.enable_tor = as_bool("enable_tor", v)?,
                "enable_research_noise" => {
                    self.enable_research_noise = as_bool("enable_research_noise", v)?
                }
                "max_bandwidth_mb_per_hour" => {
                    self.max_bandwidth_mb_per_hour = as_u64("max_bandwidth_mb_per_hour", v)?
                }
                "max_concurrent_sessions" => {
                    self.max_concurrent_sessions = as_u64("max_concurrent_sessions", v)? as usize
                }
                "match_browser_fingerprint" => {
                    self.match_browser_fingerprint = as_bool("match_browser_fingerprint", v)?
                }
                "schedule_mode" => {
                    self.schedule_mode = as_str("schedule_mode", v)?.parse().map_err(|reason| {
                        ConfigError::InvalidValue {
                            key: "schedule_mode",
                            reason,
                        }
                    })?;
                }
                "custom_hours" => {
                    self.custom_hours = parse_custom_hours(as_str("custom_hours", v)?)?;
                }
                "session_length_mean" => {
                    self.session_length_mean = as_f64("session_length_mean", v)?
                }
                "obsession_probability" => {
                    self.obsession_probability = as_f64("obsession_probability", v)?
                }
                "log_level" => self.log_level = as_str("log_level", v)?.to_string(),
                "api_port" => self.api_port = as_u64("api_port", v)? as u16,
                "data_dir" => self.data_dir = PathBuf::from(as_str("data_dir", v)?),
                "rng_seed" => self.rng_seed = Some(as_u64("rng_seed", v)?),
                _ => {}
            }
        }
        Ok(())
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        fn env_of(key: &str) -> Option<String> {
            env::var(format!("{ENV_PREFIX}{}", key.to_uppercase())).ok()
        }
        fn parse_bool(raw: &str) -> bool {
            matches!(raw.to_ascii_lowercase().as_str(), "true" | "1" | "yes")
        }

        if let Some(raw) = env_of("intensity") {
            self.intensity = raw.parse().map_err(|reason| ConfigError::InvalidValue {
                key: "intensity",
                reason,
            })?;
        }
        if let Some(raw) = env_of("schedule_mode") {
            self.schedule_mode = raw.parse().map_err(|reason| ConfigError::InvalidValue {
                key: "schedule_mode",
                reason,
            })?;
        }
        if let Some(raw) = env_of("custom_hours") {
            self.custom_hours = parse_custom_hours(&raw)?;
        }
        for (key, slot) in [
            ("enable_search_noise", &mut self.enable_search_noise),
            ("enable_browse_noise", &mut self.enable_browse_noise),
            ("enable_dns_noise", &mut self.enable_dns_noise),
            ("enable_ad_clicks", &mut self.enable_ad_clicks),
            ("enable_tor", &mut self.enable_tor),
            ("enable_research_noise", &mut self.enable_research_noise),
            (
                "match_browser_fingerprint",
                &mut self.match_browser_fingerprint,
            ),
        ] {
            if let Some(raw) = env_of(key) {
                *slot = parse_bool(&raw);
            }
        }
        if let Some(raw) = env_of("max_bandwidth_mb_per_hour") {
            self.max_bandwidth_mb_per_hour =
                raw.parse().map_err(|e| ConfigError::InvalidValue {
                    key: "max_bandwidth_mb_per_hour",
                    reason: format!("{e}"),
                })?;
        }
        if let Some(raw) = env_of("max_concurrent_sessions") {
            self.max_concurrent_sessions =
                raw.parse().map_err(|e| ConfigError::InvalidValue {
                    key: "max_concurrent_sessions",
                    reason: format!("{e}"),
                })?;
        }
        if let Some(raw) = env_of("session_length_mean") {
            self.session_length_mean = raw.parse().map_err(|e| ConfigError::InvalidValue {
                key: "session_length_mean",
                reason: format!("{e}"),
            })?;
        }
        if let Some(raw) = env_of("obsession_probability") {
            self.obsession_probability = raw.parse().map_err(|e| ConfigError::InvalidValue {
                key: "obsession_probability",
                reason: format!("{e}"),
            })?;
        }
        if let Some(raw) = env_of("api_port") {
            self.api_port = raw.parse().map_err(|e| ConfigError::InvalidValue {
                key: "api_port",
                reason: format!("{e}"),
            })?;
        }
        if let Some(raw) = env_of("log_level") {
            self.log_level = raw;
        }
        if let Some(raw) = env_of("data_dir") {
            self.data_dir = PathBuf::from(raw);
        }
        if let Some(raw) = env_of("rng_seed") {
            self.rng_seed = Some(raw.parse().map_err(|e| ConfigError::InvalidValue {
                key: "rng_seed",
                reason: format!("{e}"),
            })?);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_CONCURRENT_SESSIONS..=MAX_CONCURRENT_SESSIONS)
            .contains(&self.max_concurrent_sessions)
        {
            return Err(ConfigError::OutOfRange {
                key: "max_concurrent_sessions",
                value: self.max_concurrent_sessions as i64,
                min: MIN_CONCURRENT_SESSIONS as i64,
                max: MAX_CONCURRENT_SESSIONS as i64,
            });
        }
        if !(MIN_BANDWIDTH_MB..=MAX_BANDWIDTH_MB).contains(&self.max_bandwidth_mb_per_hour) {
            return Err(ConfigError::OutOfRange {
                key: "max_bandwidth_mb_per_hour",
                value: self.max_bandwidth_mb_per_hour as i64,
                min: MIN_BANDWIDTH_MB as i64,
                max: MAX_BANDWIDTH_MB as i64,
            });
        }
        if !(0.0..=1.0).contains(&self.obsession_probability) {
            return Err(ConfigError::InvalidValue {
                key: "obsession_probability",
                reason: format!("{} is not a probability", self.obsession_probability),
            });
        }
        if !self.session_length_mean.is_finite() || self.session_length_mean <= 0.0 {
            return Err(ConfigError::InvalidValue {
                key: "session_length_mean",
                reason: format!("{} must be a positive number of minutes", self.session_length_mean),
            });
        }
        if self.schedule_mode == ScheduleMode::Custom && self.custom_hours.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "custom_hours",
                reason: "schedule_mode=custom requires at least one hour range".to_string(),
            });
        }
        Ok(())
    }

    /// Engine enablement in dispatcher order.
    pub fn engine_enabled(&self, name: &str) -> bool {
        match name {
            "search" => self.enable_search_noise,
            "browse" => self.enable_browse_noise,
            "dns" => self.enable_dns_noise,
            "research" => self.enable_research_noise,
            "tor" => self.enable_tor,
            "adclick" => self.enable_ad_clicks,
            _ => false,
        }
    }
}

fn parse_custom_hours(raw: &str) -> Result<Vec<(u8, u8)>, ConfigError> {
    let mut ranges = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (lo, hi) = part.split_once('-').ok_or_else(|| ConfigError::InvalidValue {
            key: "custom_hours",
            reason: format!("`{part}` is not of the form START-END"),
        })?;
        let lo: u8 = lo.trim().parse().map_err(|e| ConfigError::InvalidValue {
            key: "custom_hours",
            reason: format!("`{part}`: {e}"),
        })?;
        let hi: u8 = hi.trim().parse().map_err(|e| ConfigError::InvalidValue {
            key: "custom_hours",
            reason: format!("`{part}`: {e}"),
        })?;
        if lo > 23 || hi > 23 {
            return Err(ConfigError::InvalidValue {
                key: "custom_hours",
                reason: format!("`{part}`: hours must be 0-23"),
            });
        }
        ranges.push((lo, hi));
    }
    Ok(ranges)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_keep_suspect_engines_off() {
        let cfg = Config::default();
        assert!(cfg.enable_search_noise);
        assert!(cfg.enable_browse_noise);
        assert!(cfg.enable_dns_noise);
        assert!(!cfg.enable_tor);
        assert!(!cfg.enable_research_noise);
        assert!(!cfg.enable_ad_clicks);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn options_blob_overrides_defaults() {
        let mut cfg = Config::default();
        let blob: serde_json::Value = serde_json::json!({
            "intensity": "paranoid",
            "enable_tor": true,
            "max_concurrent_sessions": 3,
            "unknown_key_from_host": 42,
        });
        cfg.apply_json(blob.as_object().unwrap()).unwrap();
        assert_eq!(cfg.intensity, Intensity::Paranoid);
        assert!(cfg.enable_tor);
        assert_eq!(cfg.max_concurrent_sessions, 3);
    }

    #[test]
    fn supervisor_envelope_is_unwrapped() {
        let mut cfg = Config::default();
        let blob: serde_json::Value = serde_json::json!({
            "result": "ok",
            "data": {"intensity": "low"},
        });
        // apply_options_file unwraps; simulate the same logic here.
        let data = blob.get("data").unwrap().as_object().unwrap();
        cfg.apply_json(data).unwrap();
        assert_eq!(cfg.intensity, Intensity::Low);
    }

    #[test]
    fn out_of_range_sessions_rejected() {
        let mut cfg = Config::default();
        cfg.max_concurrent_sessions = 9;
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, ConfigError::OutOfRange { key, .. } if key == "max_concurrent_sessions"));
    }

    #[test]
    fn bad_intensity_names_the_key() {
        let mut cfg = Config::default();
        let blob = serde_json::json!({"intensity": "ludicrous"});
        let err = cfg.apply_json(blob.as_object().unwrap()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key, .. } if key == "intensity"));
    }

    #[test]
    fn custom_hours_parse() {
        let ranges = parse_custom_hours("9-17, 20-23").unwrap();
        assert_eq!(ranges, vec![(9, 17), (20, 23)]);
        assert!(parse_custom_hours("25-3").is_err());
        assert!(parse_custom_hours("nine-five").is_err());
    }
}
