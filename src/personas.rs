//! Browser persona registry.
//!
//! A persona is the coherent bundle of device-identifying attributes pinned
//! to a session: user agent, viewport, platform, languages, and optionally a
//! deep fingerprint reported by the operator's real browser. The registry
//! keeps the emitted mix close to a real household: a soft mobile/desktop
//! ratio, suppression of over-used personas across a rolling window, and a
//! "matched" persona aligned with the operator's own browser so headless
//! noise shares the fingerprint a profiler already sees.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use rand::rngs::SmallRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::info;

const MOBILE_SHARE: f64 = 0.30;
const MATCHED_SHARE: f64 = 0.30;
const OVERUSE_FACTOR: f64 = 1.5;
const OVERUSE_PENALTY: f64 = 0.2;
const USAGE_WINDOW: Duration = Duration::from_secs(2 * 3600);

pub const MATCHED_PERSONA_NAME: &str = "matched_user";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

/// Deep fingerprint signals reported by the dashboard or the companion
/// extension.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FingerprintBundle {
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub languages: Vec<String>,
    #[serde(default)]
    pub canvas_hash: Option<String>,
    #[serde(default)]
    pub webgl_vendor: Option<String>,
    #[serde(default)]
    pub webgl_renderer: Option<String>,
    #[serde(default)]
    pub fonts: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Persona {
    pub name: String,
    pub user_agent: String,
    pub viewport: Viewport,
    pub platform: String,
    pub languages: Vec<String>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default = "default_accept_encoding")]
    pub accept_encoding: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default)]
    pub fingerprint: Option<FingerprintBundle>,
}

fn default_accept_encoding() -> String {
    "gzip, deflate, br".to_string()
}

fn default_weight() -> f64 {
    1.0
}

impl Persona {
    pub fn is_mobile(&self) -> bool {
        self.user_agent.contains("Mobile")
            || self.user_agent.contains("Android")
            || self.user_agent.contains("iPhone")
    }
}

/// Infer a `navigator.platform` value from a user agent, for reported
/// fingerprints that omit it.
pub fn platform_from_user_agent(ua: &str) -> &'static str {
    if ua.contains("Android") {
        "Linux armv81"
    } else if ua.contains("iPhone") {
        "iPhone"
    } else if ua.contains("iPad") {
        "iPad"
    } else if ua.contains("Macintosh") || ua.contains("Mac OS") {
        "MacIntel"
    } else if ua.contains("Linux") {
        "Linux x86_64"
    } else {
        "Win32"
    }
}

struct Inner {
    desktop: Vec<Arc<Persona>>,
    mobile: Vec<Arc<Persona>>,
    matched: Option<Arc<Persona>>,
    current: Option<Arc<Persona>>,
    usage: VecDeque<(Instant, String)>,
}

pub struct PersonaRegistry {
    inner: RwLock<Inner>,
}

impl PersonaRegistry {
    pub fn new(pool: Vec<Persona>) -> Self {
        let reg = Self {
            inner: RwLock::new(Inner {
                desktop: Vec::new(),
                mobile: Vec::new(),
                matched: None,
                current: None,
                usage: VecDeque::new(),
            }),
        };
        reg.replace_pool(pool);
        reg
    }

    /// Swap the persona pool (hot reload). The matched persona, if any,
    /// survives the swap: it mirrors the operator's browser, not a data file.
    pub fn replace_pool(&self, pool: Vec<Persona>) {
        let mut inner = self.inner.write();
        inner.desktop.clear();
        inner.mobile.clear();
        for p in pool {
            let p = Arc::new(p);
            if p.is_mobile() {
                inner.mobile.push(p);
            } else {
                inner.desktop.push(p);
            }
        }
    }

    /// Align one desktop persona with the operator's reported fingerprint.
    /// That persona is then drawn for at least [`MATCHED_SHARE`] of sessions.
    pub fn apply_fingerprint(&self, bundle: FingerprintBundle) {
        let mut inner = self.inner.write();
        let base_ua = bundle
            .user_agent
            .clone()
            .or_else(|| inner.desktop.first().map(|p| p.user_agent.clone()))
            .unwrap_or_else(|| "Mozilla/5.0 (Windows NT 10.0; Win64; x64)".to_string());
        let platform = bundle
            .platform
            .clone()
            .unwrap_or_else(|| platform_from_user_agent(&base_ua).to_string());
        let languages = if bundle.languages.is_empty() {
            vec!["en-US".to_string(), "en".to_string()]
        } else {
            bundle.languages.clone()
        };
        let viewport = if bundle.width > 0 && bundle.height > 0 {
            Viewport {
                width: bundle.width,
                height: bundle.height,
            }
        } else {
            Viewport {
                width: 1920,
                height: 1080,
            }
        };
        let persona = Arc::new(Persona {
            name: MATCHED_PERSONA_NAME.to_string(),
            user_agent: base_ua.clone(),
            viewport,
            platform,
            languages,
            timezone: None,
            accept_encoding: default_accept_encoding(),
            weight: 1.0,
            fingerprint: Some(bundle),
        });
        let ua_prefix: String = base_ua.chars().take(60).collect();
        info!(
            ua = %ua_prefix,
            width = viewport.width,
            height = viewport.height,
            "aligned persona with reported fingerprint"
        );
        inner.matched = Some(persona);
    }

    pub fn fingerprint_matched(&self) -> bool {
        self.inner.read().matched.is_some()
    }

    /// Persona assigned to the most recent session, for `/status`.
    pub fn current(&self) -> Option<Arc<Persona>> {
        self.inner.read().current.clone()
    }

    /// Pick a persona for a new session. Sticky for the session's lifetime;
    /// the caller pins the returned `Arc`.
    pub fn select(&self, rng: &mut SmallRng) -> Option<Arc<Persona>> {
        let mut inner = self.inner.write();
        Self::compact_usage(&mut inner.usage);

        if let Some(matched) = inner.matched.clone() {
            if rng.gen::<f64>() < MATCHED_SHARE {
                Self::note_usage(&mut inner, matched.clone());
                return Some(matched);
            }
        }

        let use_mobile = rng.gen::<f64>() < MOBILE_SHARE && !inner.mobile.is_empty();
        let pool: Vec<Arc<Persona>> = if use_mobile {
            inner.mobile.clone()
        } else if !inner.desktop.is_empty() {
            inner.desktop.clone()
        } else {
            inner.mobile.clone()
        };
        if pool.is_empty() {
            return inner.matched.clone();
        }

        let total_uses = inner.usage.len() as f64;
        let total_weight: f64 = pool.iter().map(|p| p.weight).sum();
        let weights: Vec<f64> = pool
            .iter()
            .map(|p| {
                let mut w = p.weight;
                if total_uses >= 8.0 {
                    let uses = inner
                        .usage
                        .iter()
                        .filter(|(_, name)| name == &p.name)
                        .count() as f64;
                    let share = uses / total_uses;
                    let fair = p.weight / total_weight;
                    if share > OVERUSE_FACTOR * fair {
                        w *= OVERUSE_PENALTY;
                    }
                }
                w
            })
            .collect();

        let sum: f64 = weights.iter().sum();
        let mut roll = rng.gen::<f64>() * sum;
        let mut chosen = pool.len() - 1;
        for (i, w) in weights.iter().enumerate() {
            if roll < *w {
                chosen = i;
                break;
            }
            roll -= w;
        }
        let persona = pool[chosen].clone();
        Self::note_usage(&mut inner, persona.clone());
        Some(persona)
    }

    fn note_usage(inner: &mut Inner, persona: Arc<Persona>) {
        inner.usage.push_back((Instant::now(), persona.name.clone()));
        inner.current = Some(persona);
    }

    fn compact_usage(usage: &mut VecDeque<(Instant, String)>) {
        if let Some(cutoff) = Instant::now().checked_sub(USAGE_WINDOW) {
            while let Some(&(ts, _)) = usage.front() {
                if ts < cutoff {
                    usage.pop_front();
                } else {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn persona(name: &str, ua: &str, w: f64) -> Persona {
        Persona {
            name: name.to_string(),
            user_agent: ua.to_string(),
            viewport: Viewport {
                width: 1920,
                height: 1080,
            },
            platform: platform_from_user_agent(ua).to_string(),
            languages: vec!["en-US".to_string()],
            timezone: None,
            accept_encoding: default_accept_encoding(),
            weight: w,
            fingerprint: None,
        }
    }

    fn pool() -> Vec<Persona> {
        vec![
            persona("chrome_windows", "Mozilla/5.0 (Windows NT 10.0; Win64; x64) Chrome/131.0", 1.0),
            persona("firefox_mac", "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15) Firefox/133.0", 0.8),
            persona("chrome_linux", "Mozilla/5.0 (X11; Linux x86_64) Chrome/131.0", 0.6),
            persona("chrome_android", "Mozilla/5.0 (Linux; Android 14; Pixel 8) Chrome/131.0 Mobile", 1.0),
            persona("safari_iphone", "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0) Mobile/15E148", 0.8),
        ]
    }

    #[test]
    fn pools_split_by_device_class() {
        let reg = PersonaRegistry::new(pool());
        let inner = reg.inner.read();
        assert_eq!(inner.desktop.len(), 3);
        assert_eq!(inner.mobile.len(), 2);
    }

    #[test]
    fn mobile_share_is_soft_thirty_percent() {
        let reg = PersonaRegistry::new(pool());
        let mut rng = SmallRng::seed_from_u64(7);
        let draws = 3000;
        let mobile = (0..draws)
            .filter(|_| reg.select(&mut rng).unwrap().is_mobile())
            .count() as f64;
        let share = mobile / draws as f64;
        assert!((0.22..=0.38).contains(&share), "mobile share {share}");
    }

    #[test]
    fn matched_persona_takes_its_share() {
        let reg = PersonaRegistry::new(pool());
        reg.apply_fingerprint(FingerprintBundle {
            width: 2560,
            height: 1440,
            ..Default::default()
        });
        assert!(reg.fingerprint_matched());
        let mut rng = SmallRng::seed_from_u64(11);
        let draws = 3000;
        let matched = (0..draws)
            .filter(|_| reg.select(&mut rng).unwrap().name == MATCHED_PERSONA_NAME)
            .count() as f64;
        assert!(matched / draws as f64 >= 0.25, "matched share {matched}");
    }

    #[test]
    fn fingerprint_viewport_is_preserved() {
        let reg = PersonaRegistry::new(pool());
        reg.apply_fingerprint(FingerprintBundle {
            width: 2560,
            height: 1440,
            user_agent: Some("Mozilla/5.0 (X11; Linux x86_64) Chrome/132.0".to_string()),
            ..Default::default()
        });
        let inner = reg.inner.read();
        let matched = inner.matched.as_ref().unwrap();
        assert_eq!(matched.viewport.width, 2560);
        assert_eq!(matched.viewport.height, 1440);
        assert_eq!(matched.platform, "Linux x86_64");
    }

    #[test]
    fn reload_keeps_matched_persona() {
        let reg = PersonaRegistry::new(pool());
        reg.apply_fingerprint(FingerprintBundle::default());
        reg.replace_pool(pool());
        assert!(reg.fingerprint_matched());
    }

    #[test]
    fn platform_inference() {
        assert_eq!(platform_from_user_agent("... Android 14 ..."), "Linux armv81");
        assert_eq!(platform_from_user_agent("... Macintosh ..."), "MacIntel");
        assert_eq!(platform_from_user_agent("anything else"), "Win32");
    }
}
