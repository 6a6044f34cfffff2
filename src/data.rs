//! Read-only data tables: site lists, term wordlists, onion directories,
//! personas, DNS pools.
//!
//! Everything ships with compiled-in fallbacks; YAML files in the data
//! directory override them category by category. Reload is snapshot-swap: a
//! fresh [`DataTables`] is built off to the side and the shared pointer is
//! replaced atomically, so in-flight sessions keep whatever snapshot they
//! started under.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Deserialize;
use tracing::{info, warn};

use crate::error::DataError;
use crate::personas::{Persona, Viewport};

#[derive(Debug, Clone, Deserialize)]
pub struct WeightedSite {
    pub url: String,
    #[serde(default = "default_site_weight")]
    pub weight: f64,
}

fn default_site_weight() -> f64 {
    1.0
}

fn site(url: &str, weight: f64) -> WeightedSite {
    WeightedSite {
        url: url.to_string(),
        weight,
    }
}

#[derive(Debug, Clone, Default)]
pub struct DataTables {
    /// Browse categories -> weighted URLs.
    pub sites: HashMap<String, Vec<WeightedSite>>,
    /// Research categories (privacy/legal/government) -> weighted URLs.
    pub research_sites: HashMap<String, Vec<WeightedSite>>,
    /// Tor-adjacent clearnet categories -> weighted URLs.
    pub tor_sites: HashMap<String, Vec<WeightedSite>>,
    /// Public .onion mirrors and directories.
    pub onion_sites: Vec<WeightedSite>,
    /// Ad-heavy pages for the adclick engine.
    pub ad_sites: Vec<WeightedSite>,
    /// Query wordlists per topic category (search + shopping + academic).
    pub terms: HashMap<String, Vec<String>>,
    /// Hostname pools per category for DNS noise.
    pub dns_domains: HashMap<String, Vec<String>>,
    /// Public resolvers rotated through by the DNS engine.
    pub dns_resolvers: Vec<String>,
    pub personas: Vec<Persona>,
}

/// Turn a bare user-agent string into a usable persona with a plausible
/// viewport for its device class.
fn persona_from_user_agent(index: usize, ua: String) -> Persona {
    let mobile = ua.contains("Mobile") || ua.contains("Android") || ua.contains("iPhone");
    let viewport = if mobile {
        Viewport {
            width: 412,
            height: 915,
        }
    } else {
        Viewport {
            width: 1920,
            height: 1080,
        }
    };
    let platform = crate::personas::platform_from_user_agent(&ua).to_string();
    Persona {
        name: format!("ua_pool_{index}"),
        user_agent: ua,
        viewport,
        platform,
        languages: vec!["en-US".to_string(), "en".to_string()],
        timezone: None,
        accept_encoding: "gzip, deflate, br".to_string(),
        weight: 0.4,
        fingerprint: None,
    }
}

/// Shared, hot-swappable handle to the current tables.
pub struct DataHub {
    dir: PathBuf,
    current: RwLock<Arc<DataTables>>,
}

impl DataHub {
    /// Load the tables, failing only when a *present* file for a
    /// default-enabled engine is unreadable. Missing files fall back to the
    /// builtins; broken files for opt-in engines come back in
    /// `disabled_engines`.
    pub fn load(dir: &Path) -> Result<(Self, Vec<&'static str>), DataError> {
        let (tables, disabled) = build_tables(dir)?;
        info!(
            site_categories = tables.sites.len(),
            term_categories = tables.terms.len(),
            personas = tables.personas.len(),
            "data tables loaded"
        );
        Ok((
            Self {
                dir: dir.to_path_buf(),
                current: RwLock::new(Arc::new(tables)),
            },
            disabled,
        ))
    }

    pub fn snapshot(&self) -> Arc<DataTables> {
        self.current.read().clone()
    }

    /// SIGHUP path: rebuild from disk and swap. Failures leave the old
    /// snapshot in place.
    pub fn reload(&self) -> Result<Vec<&'static str>, DataError> {
        let (tables, disabled) = build_tables(&self.dir)?;
        *self.current.write() = Arc::new(tables);
        info!("data tables reloaded");
        Ok(disabled)
    }
}

// --- YAML shapes ---

#[derive(Deserialize)]
struct SitesFile {
    #[serde(default)]
    categories: HashMap<String, Vec<WeightedSite>>,
}

#[derive(Deserialize)]
struct OnionFile {
    #[serde(default)]
    sites: Vec<WeightedSite>,
}

#[derive(Deserialize)]
struct PersonasFile {
    #[serde(default)]
    personas: Vec<PersonaEntry>,
}

#[derive(Deserialize)]
struct UserAgentsFile {
    #[serde(default)]
    agents: Vec<String>,
}

#[derive(Deserialize)]
struct PersonaEntry {
    name: String,
    user_agent: String,
    #[serde(default)]
    viewport: Option<Viewport>,
    #[serde(default)]
    platform: Option<String>,
    #[serde(default)]
    languages: Vec<String>,
    #[serde(default)]
    timezone: Option<String>,
    #[serde(default = "default_site_weight")]
    weight: f64,
}

fn build_tables(dir: &Path) -> Result<(DataTables, Vec<&'static str>), DataError> {
    let mut tables = DataTables {
        sites: builtin_sites(),
        research_sites: builtin_research_sites(),
        tor_sites: builtin_tor_sites(),
        onion_sites: builtin_onion_sites(),
        ad_sites: builtin_ad_sites(),
        terms: builtin_terms(),
        dns_domains: builtin_dns_domains(),
        dns_resolvers: builtin_dns_resolvers(),
        personas: builtin_personas(),
    };
    let mut disabled = Vec::new();

    // sites.yaml backs the default-enabled browse engine: malformed is fatal.
    match read_yaml::<SitesFile>(&dir.join("sites.yaml")) {
        Ok(Some(f)) if !f.categories.is_empty() => tables.sites = f.categories,
        Ok(_) => {}
        Err(e) => return Err(e),
    }

    for (file, target) in [
        ("search_terms.yaml", true),
        ("shopping_terms.yaml", true),
        ("academic_terms.yaml", false),
    ] {
        match read_yaml::<HashMap<String, Vec<String>>>(&dir.join(file)) {
            Ok(Some(map)) => {
                for (cat, mut list) in map {
                    list.retain(|t| !t.trim().is_empty());
                    if !list.is_empty() {
                        tables.terms.entry(cat).or_default().extend(list);
                    }
                }
            }
            Ok(None) => {}
            Err(e) if target => return Err(e),
            Err(e) => {
                warn!(file, error = %e, "ignoring malformed wordlist for opt-in engine");
                disabled.push("research");
            }
        }
    }

    match read_yaml::<OnionFile>(&dir.join("onion_sites.yaml")) {
        Ok(Some(f)) if !f.sites.is_empty() => tables.onion_sites = f.sites,
        Ok(_) => {}
        Err(e) => {
            warn!(error = %e, "onion_sites.yaml unusable, disabling tor engine");
            disabled.push("tor");
        }
    }

    match read_yaml::<PersonasFile>(&dir.join("personas.yaml")) {
        Ok(Some(f)) if !f.personas.is_empty() => {
            tables.personas = f
                .personas
                .into_iter()
                .map(|p| {
                    let platform = p
                        .platform
                        .unwrap_or_else(|| crate::personas::platform_from_user_agent(&p.user_agent).to_string());
                    Persona {
                        name: p.name,
                        user_agent: p.user_agent,
                        viewport: p.viewport.unwrap_or(Viewport {
                            width: 1920,
                            height: 1080,
                        }),
                        platform,
                        languages: if p.languages.is_empty() {
                            vec!["en-US".to_string(), "en".to_string()]
                        } else {
                            p.languages
                        },
                        timezone: p.timezone,
                        accept_encoding: "gzip, deflate, br".to_string(),
                        weight: p.weight,
                        fingerprint: None,
                    }
                })
                .collect();
        }
        Ok(_) => {}
        Err(e) => return Err(e),
    }

    // Extra user agents widen the persona pool at low weight.
    match read_yaml::<UserAgentsFile>(&dir.join("user_agents.yaml")) {
        Ok(Some(f)) => {
            let known: std::collections::HashSet<String> =
                tables.personas.iter().map(|p| p.user_agent.clone()).collect();
            for (i, ua) in f
                .agents
                .into_iter()
                .filter(|ua| !ua.trim().is_empty() && !known.contains(ua))
                .enumerate()
            {
                tables.personas.push(persona_from_user_agent(i, ua));
            }
        }
        Ok(None) => {}
        Err(e) => {
            warn!(error = %e, "user_agents.yaml unusable, keeping base personas");
        }
    }

    if tables.terms.is_empty() {
        return Err(DataError::RequiredEngineData {
            engine: "search",
            missing: vec!["terms".to_string()],
        });
    }
    if tables.sites.is_empty() {
        return Err(DataError::RequiredEngineData {
            engine: "browse",
            missing: vec!["categories".to_string()],
        });
    }

    disabled.sort_unstable();
    disabled.dedup();
    Ok((tables, disabled))
}

/// `Ok(None)` when the file does not exist; `Err` when it exists but cannot
/// be read or parsed.
fn read_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, DataError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path).map_err(|source| DataError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let parsed = serde_yaml::from_str(&raw).map_err(|source| DataError::Yaml {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(Some(parsed))
}

// --- Builtin fallbacks ---

fn builtin_sites() -> HashMap<String, Vec<WeightedSite>> {
    let mut m = HashMap::new();
    m.insert(
        "news_left".to_string(),
        vec![
            site("https://www.cnn.com", 1.0),
            site("https://www.msnbc.com", 0.8),
            site("https://www.nytimes.com", 0.9),
        ],
    );
    m.insert(
        "news_right".to_string(),
        vec![
            site("https://www.foxnews.com", 1.0),
            site("https://www.dailywire.com", 0.7),
        ],
    );
    m.insert(
        "news_international".to_string(),
        vec![
            site("https://www.bbc.co.uk", 1.0),
            site("https://www.aljazeera.com", 0.9),
            site("https://www.reuters.com", 0.9),
            site("https://www.dw.com", 0.7),
        ],
    );
    m.insert(
        "shopping".to_string(),
        vec![
            site("https://www.amazon.com", 1.0),
            site("https://www.walmart.com", 0.8),
            site("https://www.etsy.com", 0.7),
            site("https://www.ebay.com", 0.7),
        ],
    );
    m.insert(
        "tech".to_string(),
        vec![
            site("https://news.ycombinator.com", 0.9),
            site("https://www.theverge.com", 0.8),
            site("https://arstechnica.com", 0.8),
            site("https://www.wired.com", 0.7),
        ],
    );
    m.insert(
        "forums".to_string(),
        vec![
            site("https://www.reddit.com", 1.0),
            site("https://stackoverflow.com", 0.8),
        ],
    );
    m.insert(
        "entertainment".to_string(),
        vec![
            site("https://www.youtube.com", 1.0),
            site("https://www.imdb.com", 0.6),
            site("https://www.spotify.com", 0.5),
        ],
    );
    m.insert(
        "government".to_string(),
        vec![
            site("https://www.usa.gov", 0.5),
            site("https://www.foia.gov", 0.4),
        ],
    );
    m.insert(
        "education".to_string(),
        vec![
            site("https://en.wikipedia.org", 1.0),
            site("https://scholar.google.com", 0.6),
            site("https://www.khanacademy.org", 0.5),
        ],
    );
    m
}

fn builtin_research_sites() -> HashMap<String, Vec<WeightedSite>> {
    let mut m = HashMap::new();
    m.insert(
        "privacy_tools".to_string(),
        vec![
            site("https://www.torproject.org", 1.0),
            site("https://signal.org", 0.9),
            site("https://www.eff.org", 0.9),
            site("https://www.privacyguides.org", 0.8),
            site("https://ssd.eff.org", 0.8),
            site("https://proton.me", 0.8),
            site("https://mullvad.net", 0.7),
            site("https://tails.net", 0.7),
        ],
    );
    m.insert(
        "legal_resources".to_string(),
        vec![
            site("https://www.law.cornell.edu", 0.9),
            site("https://www.aclu.org", 0.8),
            site("https://supreme.justia.com", 0.7),
            site("https://www.findlaw.com", 0.7),
        ],
    );
    m.insert(
        "government_databases".to_string(),
        vec![
            site("https://www.foia.gov", 0.8),
            site("https://www.regulations.gov", 0.7),
            site("https://www.congress.gov", 0.7),
            site("https://www.courtlistener.com", 0.6),
            site("https://www.usaspending.gov", 0.5),
        ],
    );
    m.insert(
        "security_research".to_string(),
        vec![
            site("https://arxiv.org/list/cs.CR/recent", 0.6),
            site("https://www.schneier.com", 0.7),
            site("https://krebsonsecurity.com", 0.7),
            site("https://citizenlab.ca", 0.6),
        ],
    );
    m
}

fn builtin_tor_sites() -> HashMap<String, Vec<WeightedSite>> {
    let mut m = HashMap::new();
    m.insert(
        "tor_project".to_string(),
        vec![
            site("https://www.torproject.org", 1.0),
            site("https://support.torproject.org", 0.8),
            site("https://blog.torproject.org", 0.7),
        ],
    );
    m.insert(
        "privacy_news".to_string(),
        vec![
            site("https://www.eff.org", 1.0),
            site("https://theintercept.com", 0.7),
            site("https://freedom.press", 0.7),
        ],
    );
    m.insert(
        "secure_services".to_string(),
        vec![
            site("https://proton.me", 0.9),
            site("https://mullvad.net", 0.8),
            site("https://keys.openpgp.org", 0.5),
        ],
    );
    m
}

fn builtin_onion_sites() -> Vec<WeightedSite> {
    vec![
        site("https://duckduckgogg42xjoc72x3sjasowoarfbgcmvfimaftt6twagswzczad.onion", 1.0),
        site("https://www.nytimesn7cgmftshazwhfgzm37qxb44r64ytbb2dj3x62d2lljsciiyd.onion", 0.8),
        site("https://p53lf57qovyuvwsc6xnrppyply3vtqm7l6pcobkmyqsiofyeznfu5uqd.onion", 0.8),
    ]
}

fn builtin_ad_sites() -> Vec<WeightedSite> {
    vec![
        site("https://www.weather.com", 1.0),
        site("https://www.allrecipes.com", 0.8),
        site("https://www.investopedia.com", 0.8),
        site("https://www.dictionary.com", 0.7),
        site("https://www.healthline.com", 0.7),
        site("https://www.webmd.com", 0.7),
        site("https://www.cnet.com", 0.7),
        site("https://www.howstuffworks.com", 0.6),
        site("https://www.tomsguide.com", 0.6),
        site("https://www.buzzfeed.com", 0.5),
        site("https://www.msn.com", 0.6),
    ]
}

fn builtin_terms() -> HashMap<String, Vec<String>> {
    let mut m = HashMap::new();
    let mut add = |cat: &str, terms: &[&str]| {
        m.insert(
            cat.to_string(),
            terms.iter().map(|t| t.to_string()).collect(),
        );
    };
    add(
        "technology",
        &[
            "best laptop 2026",
            "python tutorial",
            "kubernetes deployment",
            "raspberry pi projects",
            "home server setup",
            "mechanical keyboard review",
            "self-hosted alternatives",
            "docker compose examples",
        ],
    );
    add(
        "shopping",
        &[
            "best hiking boots",
            "wireless earbuds under 100",
            "standing desk review",
            "coffee grinder recommendations",
            "running shoes for flat feet",
            "air purifier for allergies",
            "cast iron skillet",
            "backpack for travel",
        ],
    );
    add(
        "news",
        &[
            "world news today",
            "climate change report",
            "election results",
            "stock market analysis",
            "space exploration news",
            "cybersecurity breach",
        ],
    );
    add(
        "health",
        &[
            "intermittent fasting benefits",
            "best stretches for back pain",
            "sleep hygiene tips",
            "meditation for beginners",
            "anti-inflammatory diet",
        ],
    );
    add(
        "travel",
        &[
            "cheap flights to europe",
            "best time to visit japan",
            "road trip planner",
            "travel insurance comparison",
            "train travel europe",
        ],
    );
    add(
        "hobbies",
        &[
            "sourdough starter recipe",
            "beginner woodworking projects",
            "indoor plants low light",
            "learn guitar online",
            "board game recommendations",
            "3d printing for beginners",
        ],
    );
    add(
        "finance",
        &[
            "how to budget",
            "index fund vs etf",
            "mortgage rates today",
            "retirement calculator",
            "student loan refinance",
        ],
    );
    add(
        "privacy_tools",
        &[
            "best vpn service",
            "password manager comparison",
            "encrypted email providers",
            "data broker opt out",
            "two factor authentication setup",
            "privacy focused search engine",
        ],
    );
    add(
        "legal",
        &[
            "tenant rights",
            "small claims court process",
            "FOIA request how to",
            "consumer protection laws",
            "public records search",
        ],
    );
    m
}

fn builtin_dns_domains() -> HashMap<String, Vec<String>> {
    let mut m = HashMap::new();
    let mut add = |cat: &str, hosts: &[&str]| {
        m.insert(
            cat.to_string(),
            hosts.iter().map(|h| h.to_string()).collect(),
        );
    };
    add(
        "news",
        &[
            "cnn.com",
            "foxnews.com",
            "bbc.co.uk",
            "reuters.com",
            "apnews.com",
            "theguardian.com",
        ],
    );
    add(
        "shopping",
        &["amazon.com", "ebay.com", "etsy.com", "walmart.com", "target.com"],
    );
    add(
        "privacy",
        &[
            "torproject.org",
            "signal.org",
            "protonmail.com",
            "mullvad.net",
            "tails.net",
        ],
    );
    add(
        "crypto",
        &["blockchain.com", "coinbase.com", "etherscan.io", "coingecko.com"],
    );
    add(
        "government",
        &["foia.gov", "sec.gov", "congress.gov", "regulations.gov"],
    );
    add(
        "tech",
        &["github.com", "stackoverflow.com", "arxiv.org", "medium.com"],
    );
    add(
        "social",
        &["reddit.com", "mastodon.social", "discord.com", "linkedin.com"],
    );
    add(
        "foreign",
        &["yandex.ru", "baidu.com", "naver.com", "vk.com"],
    );
    add(
        "health",
        &["webmd.com", "mayoclinic.org", "nih.gov", "healthline.com"],
    );
    m
}

fn builtin_dns_resolvers() -> Vec<String> {
    ["1.1.1.1", "8.8.8.8", "9.9.9.9", "208.67.222.222", "94.140.14.14"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn builtin_personas() -> Vec<Persona> {
    fn p(name: &str, ua: &str, w: u32, h: u32, platform: &str, weight: f64) -> Persona {
        Persona {
            name: name.to_string(),
            user_agent: ua.to_string(),
            viewport: Viewport {
                width: w,
                height: h,
            },
            platform: platform.to_string(),
            languages: vec!["en-US".to_string(), "en".to_string()],
            timezone: None,
            accept_encoding: "gzip, deflate, br".to_string(),
            weight,
            fingerprint: None,
        }
    }
    vec![
        p(
            "chrome_windows",
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
            1920, 1080, "Win32", 1.0,
        ),
        p(
            "edge_windows",
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36 Edg/131.0.0.0",
            1536, 864, "Win32", 0.7,
        ),
        p(
            "firefox_mac",
            "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:133.0) Gecko/20100101 Firefox/133.0",
            1440, 900, "MacIntel", 0.8,
        ),
        p(
            "safari_mac",
            "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_0) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.0 Safari/605.1.15",
            1512, 982, "MacIntel", 0.7,
        ),
        p(
            "chrome_linux",
            "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
            1366, 768, "Linux x86_64", 0.5,
        ),
        p(
            "chrome_android",
            "Mozilla/5.0 (Linux; Android 14; Pixel 8) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Mobile Safari/537.36",
            412, 915, "Linux armv81", 1.0,
        ),
        p(
            "safari_iphone",
            "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.0 Mobile/15E148 Safari/604.1",
            390, 844, "iPhone", 0.9,
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_cover_required_engines() {
        let tables = DataTables {
            sites: builtin_sites(),
            research_sites: builtin_research_sites(),
            tor_sites: builtin_tor_sites(),
            onion_sites: builtin_onion_sites(),
            ad_sites: builtin_ad_sites(),
            terms: builtin_terms(),
            dns_domains: builtin_dns_domains(),
            dns_resolvers: builtin_dns_resolvers(),
            personas: builtin_personas(),
        };
        assert!(tables.sites.len() >= 5);
        assert!(tables.terms.len() >= 5);
        assert!(tables.dns_domains.len() >= 5);
        assert!(tables.personas.len() >= 5);
        assert!(tables.personas.iter().any(|p| p.is_mobile()));
        assert!(tables.personas.iter().any(|p| !p.is_mobile()));
    }

    #[test]
    fn missing_dir_falls_back_to_builtins() {
        let (hub, disabled) = DataHub::load(Path::new("/nonexistent/poisson-data")).unwrap();
        assert!(disabled.is_empty());
        let snap = hub.snapshot();
        assert!(!snap.sites.is_empty());
        assert!(!snap.terms.is_empty());
    }

    #[test]
    fn snapshot_survives_failed_reload() {
        let dir = std::env::temp_dir().join(format!("poisson-data-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let (hub, _) = DataHub::load(&dir).unwrap();
        let before = hub.snapshot();
        std::fs::write(dir.join("sites.yaml"), "categories: [not, a, map").unwrap();
        assert!(hub.reload().is_err());
        assert!(Arc::ptr_eq(&before, &hub.snapshot()));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn user_agent_pool_extends_personas() {
        let dir = std::env::temp_dir().join(format!("poisson-uas-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("user_agents.yaml"),
            "agents:\n  - \"Mozilla/5.0 (X11; Linux x86_64) Chrome/140.0\"\n  - \"Mozilla/5.0 (Linux; Android 15) Chrome/140.0 Mobile\"\n",
        )
        .unwrap();
        let (hub, _) = DataHub::load(&dir).unwrap();
        let snap = hub.snapshot();
        let pooled: Vec<&Persona> = snap
            .personas
            .iter()
            .filter(|p| p.name.starts_with("ua_pool_"))
            .collect();
        assert_eq!(pooled.len(), 2);
        assert!(pooled.iter().any(|p| p.is_mobile()));
        assert!(pooled.iter().all(|p| p.weight < 1.0));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn site_yaml_overrides_builtins() {
        let dir = std::env::temp_dir().join(format!("poisson-sites-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("sites.yaml"),
            "categories:\n  only_cat:\n    - url: https://example.org\n      weight: 1.0\n",
        )
        .unwrap();
        let (hub, _) = DataHub::load(&dir).unwrap();
        let snap = hub.snapshot();
        assert_eq!(snap.sites.len(), 1);
        assert_eq!(snap.sites["only_cat"][0].url, "https://example.org");
        let _ = std::fs::remove_dir_all(&dir);
    }
}
