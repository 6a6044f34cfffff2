//! Page driver contract.
//!
//! The headless browser is an external collaborator; the core only needs a
//! driver that takes a URL and a persona and comes back with a byte count.
//! [`HttpDriver`] is the built-in default: a plain HTTP fetcher that sends
//! the persona's headers, follows discovered links, and counts response
//! bytes. Deployments with a real browser plug their own [`DriverFactory`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::debug;

use crate::personas::Persona;

const MAX_TRACKED_LINKS: usize = 200;
const AD_LINK_MARKERS: &[&str] = &["doubleclick", "adsystem", "sponsor", "/ads/", "adserver"];

/// Result of one driver operation.
#[derive(Debug, Clone)]
pub struct PageVisit {
    pub bytes_read: u64,
    pub final_url: String,
    pub ok: bool,
    pub error: Option<String>,
}

impl PageVisit {
    pub fn failed(url: &str, error: impl Into<String>) -> Self {
        Self {
            bytes_read: 0,
            final_url: url.to_string(),
            ok: false,
            error: Some(error.into()),
        }
    }
}

#[async_trait]
pub trait PageDriver: Send {
    async fn open(&mut self, url: &str, timeout: Duration) -> PageVisit;
    /// Follow the n-th link discovered on the current page.
    async fn follow(&mut self, link_index: usize, timeout: Duration) -> PageVisit;
    /// Interact with an ad element on the current page, when one exists.
    async fn click_ad(&mut self, timeout: Duration) -> PageVisit;
    async fn close(&mut self);
    /// Number of followable links on the current page.
    fn link_count(&self) -> usize;
}

/// Creates one driver per session, bound to that session's persona. The
/// session manager never holds more drivers than it has slots.
pub trait DriverFactory: Send + Sync {
    fn create(&self, persona: &Arc<Persona>, proxy: Option<&str>) -> Result<Box<dyn PageDriver>>;
}

/// Default driver: persona-shaped HTTP fetches via reqwest.
pub struct HttpDriver {
    client: reqwest::Client,
    current_url: Option<String>,
    links: Vec<String>,
    rng: SmallRng,
}

impl HttpDriver {
    fn new(persona: &Arc<Persona>, proxy: Option<&str>) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::ACCEPT_LANGUAGE,
            persona.languages.join(", ").parse()?,
        );
        headers.insert(
            reqwest::header::ACCEPT_ENCODING,
            persona.accept_encoding.parse()?,
        );
        let mut builder = reqwest::Client::builder()
            .user_agent(persona.user_agent.clone())
            .default_headers(headers)
            .redirect(reqwest::redirect::Policy::limited(5));
        if let Some(proxy) = proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }
        Ok(Self {
            client: builder.build()?,
            current_url: None,
            links: Vec::new(),
            rng: SmallRng::from_entropy(),
        })
    }

    async fn fetch(&mut self, url: &str, timeout: Duration) -> PageVisit {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return PageVisit::failed(url, "non-http url rejected");
        }
        let response = match self.client.get(url).timeout(timeout).send().await {
            Ok(r) => r,
            Err(e) => return PageVisit::failed(url, e.to_string()),
        };
        let final_url = response.url().to_string();
        let status = response.status();
        let body = match response.bytes().await {
            Ok(b) => b,
            Err(e) => return PageVisit::failed(&final_url, e.to_string()),
        };
        self.links = extract_links(&final_url, &String::from_utf8_lossy(&body));
        self.current_url = Some(final_url.clone());
        debug!(url = %final_url, bytes = body.len(), links = self.links.len(), "page fetched");
        PageVisit {
            bytes_read: body.len() as u64,
            final_url,
            ok: status.is_success(),
            error: (!status.is_success()).then(|| format!("http status {status}")),
        }
    }
}

#[async_trait]
impl PageDriver for HttpDriver {
    async fn open(&mut self, url: &str, timeout: Duration) -> PageVisit {
        self.fetch(url, timeout).await
    }

    async fn follow(&mut self, link_index: usize, timeout: Duration) -> PageVisit {
        let target = match self.links.get(link_index % self.links.len().max(1)) {
            Some(t) => t.clone(),
            None => {
                let current = self.current_url.clone().unwrap_or_default();
                return PageVisit::failed(&current, "no links on page");
            }
        };
        self.fetch(&target, timeout).await
    }

    async fn click_ad(&mut self, timeout: Duration) -> PageVisit {
        let candidates: Vec<String> = self
            .links
            .iter()
            .filter(|l| {
                let lower = l.to_ascii_lowercase();
                AD_LINK_MARKERS.iter().any(|m| lower.contains(m))
            })
            .cloned()
            .collect();
        match candidates.choose(&mut self.rng) {
            Some(target) => {
                let target = target.clone();
                self.fetch(&target, timeout).await
            }
            // No ad element found: a no-op, not a failure.
            None => PageVisit {
                bytes_read: 0,
                final_url: self.current_url.clone().unwrap_or_default(),
                ok: true,
                error: None,
            },
        }
    }

    async fn close(&mut self) {
        self.links.clear();
        self.current_url = None;
    }

    fn link_count(&self) -> usize {
        self.links.len()
    }
}

pub struct HttpDriverFactory;

impl DriverFactory for HttpDriverFactory {
    fn create(&self, persona: &Arc<Persona>, proxy: Option<&str>) -> Result<Box<dyn PageDriver>> {
        Ok(Box::new(HttpDriver::new(persona, proxy)?))
    }
}

/// Pull same-host absolute links out of an HTML body without a parser:
/// enough to feed link-following, nothing more.
fn extract_links(base: &str, body: &str) -> Vec<String> {
    let host = url::Url::parse(base).ok().and_then(|u| u.host_str().map(String::from));
    let mut links = Vec::new();
    for chunk in body.split("href=\"").skip(1) {
        if links.len() >= MAX_TRACKED_LINKS {
            break;
        }
        let Some(end) = chunk.find('"') else { continue };
        let candidate = &chunk[..end];
        if candidate.starts_with("https://") || candidate.starts_with("http://") {
            let same_host = match (&host, url::Url::parse(candidate)) {
                (Some(h), Ok(u)) => u.host_str() == Some(h.as_str()),
                _ => false,
            };
            if same_host && !candidate.contains('#') {
                links.push(candidate.to_string());
            }
        } else if candidate.starts_with('/') && !candidate.starts_with("//") {
            if let Ok(u) = url::Url::parse(base).and_then(|b| b.join(candidate)) {
                links.push(u.to_string());
            }
        }
    }
    links
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_extraction_keeps_same_host_absolute_and_relative() {
        let body = r##"
            <a href="https://example.com/a">a</a>
            <a href="https://other.com/b">b</a>
            <a href="/local/page">c</a>
            <a href="https://example.com/frag#sec">d</a>
            <a href="mailto:x@example.com">e</a>
        "##;
        let links = extract_links("https://example.com/start", body);
        assert_eq!(
            links,
            vec![
                "https://example.com/a".to_string(),
                "https://example.com/local/page".to_string(),
            ]
        );
    }

    #[test]
    fn link_extraction_is_bounded() {
        let mut body = String::new();
        for i in 0..500 {
            body.push_str(&format!("<a href=\"https://example.com/p{i}\">x</a>"));
        }
        let links = extract_links("https://example.com", &body);
        assert_eq!(links.len(), MAX_TRACKED_LINKS);
    }

    #[tokio::test]
    async fn stub_driver_scripts_failures() {
        use super::stub::*;
        let behavior = StubBehavior::failing_every(1000, Duration::ZERO, 3);
        let factory = StubFactory {
            behavior: behavior.clone(),
        };
        let persona = Arc::new(crate::personas::Persona {
            name: "t".into(),
            user_agent: "ua".into(),
            viewport: crate::personas::Viewport {
                width: 800,
                height: 600,
            },
            platform: "Win32".into(),
            languages: vec!["en".into()],
            timezone: None,
            accept_encoding: "gzip".into(),
            weight: 1.0,
            fingerprint: None,
        });
        let mut driver = factory.create(&persona, None).unwrap();
        let timeout = Duration::from_secs(1);
        assert!(driver.open("https://a", timeout).await.ok);
        assert!(driver.open("https://b", timeout).await.ok);
        assert!(!driver.open("https://c", timeout).await.ok);
        assert!(driver.open("https://d", timeout).await.ok);
    }
}
