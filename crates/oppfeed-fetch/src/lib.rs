//! HTTP fetch client for the crawl target: rotating browser identity,
//! retry with exponential backoff, polite pacing, and an optional
//! headless-render fallback.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use rand::seq::{IndexedRandom, SliceRandom};
use rand::Rng;
use reqwest::cookie::{CookieStore, Jar};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn, Instrument};

#[cfg(feature = "headless")]
mod chromium;
#[cfg(feature = "headless")]
pub use chromium::ChromiumRenderer;

pub const CRATE_NAME: &str = "oppfeed-fetch";

pub const DEFAULT_BASE_URL: &str = "https://opportunitydesk.org";

const DEFAULT_USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 13_4) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 13.4; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36 Edg/124.0.0.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 13_4) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (iPhone; CPU iPhone OS 17_4 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Mobile/15E148 Safari/604.1",
    "Mozilla/5.0 (Linux; Android 14; SM-G991B) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Mobile Safari/537.36",
];

const DEFAULT_ACCEPT: &[&str] = &[
    "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8",
    "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
];

const DEFAULT_ACCEPT_LANGUAGE: &[&str] = &["en-US,en;q=0.9", "en-GB,en;q=0.8", "en;q=0.7"];

const DEFAULT_BLOCK_MARKERS: &[&str] = &[
    "cf-browser-verification",
    "cf_chl_opt",
    "/cdn-cgi/challenge-platform/",
    "<title>just a moment...</title>",
    "<title>attention required! | cloudflare</title>",
    "captcha-delivery.com",
    "px-captcha",
];

/// Uniform random delay between two bounds, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DelayRange {
    pub min_secs: f64,
    pub max_secs: f64,
}

impl DelayRange {
    pub const ZERO: Self = Self {
        min_secs: 0.0,
        max_secs: 0.0,
    };

    pub const fn new(min_secs: f64, max_secs: f64) -> Self {
        Self { min_secs, max_secs }
    }

    pub fn sample(&self) -> Duration {
        let lo = self.min_secs.max(0.0);
        let hi = self.max_secs.max(lo);
        let secs = if hi > lo {
            rand::rng().random_range(lo..=hi)
        } else {
            lo
        };
        Duration::from_secs_f64(secs)
    }

    pub async fn sleep(&self) {
        let delay = self.sample();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

/// `unit * 2^attempt` plus uniform jitter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    pub unit_secs: f64,
    pub max_exponent: u32,
    pub jitter: DelayRange,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            unit_secs: 1.0,
            max_exponent: 10,
            jitter: DelayRange::new(2.0, 6.0),
        }
    }
}

impl BackoffPolicy {
    pub fn base_delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let exponent = u32::try_from(attempt_index)
            .unwrap_or(u32::MAX)
            .min(self.max_exponent)
            .min(30);
        Duration::from_secs_f64(self.unit_secs.max(0.0) * f64::from(1u32 << exponent))
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        self.base_delay_for_attempt(attempt_index) + self.jitter.sample()
    }
}

/// Pools from which each request draws a fresh browser identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityPool {
    pub user_agents: Vec<String>,
    pub referers: Vec<String>,
    pub accept: Vec<String>,
    pub accept_language: Vec<String>,
    pub cookie_header_probability: f64,
}

impl Default for IdentityPool {
    fn default() -> Self {
        Self::for_base_url(DEFAULT_BASE_URL)
    }
}

impl IdentityPool {
    pub fn for_base_url(base_url: &str) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            user_agents: to_strings(DEFAULT_USER_AGENTS),
            referers: vec![
                format!("{base}/"),
                format!("{base}/about/"),
                "https://www.google.com/".to_string(),
                "https://www.bing.com/".to_string(),
                "https://duckduckgo.com/".to_string(),
            ],
            accept: to_strings(DEFAULT_ACCEPT),
            accept_language: to_strings(DEFAULT_ACCEPT_LANGUAGE),
            cookie_header_probability: 0.5,
        }
    }

    /// Draw one identity as an ordered header list. Client-hint headers are
    /// only sent for Chromium-family agents and always match the agent's
    /// platform. Header order is shuffled per draw.
    pub fn draw<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<(String, String)> {
        let mut headers: Vec<(String, String)> = Vec::with_capacity(20);
        let user_agent = self.user_agents.choose(rng).cloned();

        if let Some(ua) = &user_agent {
            headers.push(("User-Agent".into(), ua.clone()));
        }
        if let Some(accept) = self.accept.choose(rng) {
            headers.push(("Accept".into(), accept.clone()));
        }
        if let Some(lang) = self.accept_language.choose(rng) {
            headers.push(("Accept-Language".into(), lang.clone()));
        }
        if let Some(referer) = self.referers.choose(rng) {
            headers.push(("Referer".into(), referer.clone()));
        }
        for (name, value) in [
            ("DNT", "1"),
            ("Upgrade-Insecure-Requests", "1"),
            ("Pragma", "no-cache"),
            ("Cache-Control", "no-cache"),
            ("Sec-Fetch-Dest", "document"),
            ("Sec-Fetch-Mode", "navigate"),
            ("Sec-Fetch-Site", "none"),
            ("Sec-Fetch-User", "?1"),
        ] {
            headers.push((name.into(), value.into()));
        }

        if let Some(ua) = &user_agent {
            if let Some(major) = chromium_major_version(ua) {
                let brand = if ua.contains("Edg/") {
                    "Microsoft Edge"
                } else {
                    "Google Chrome"
                };
                headers.push((
                    "sec-ch-ua".into(),
                    format!(r#""Chromium";v="{major}", "{brand}";v="{major}", "Not.A/Brand";v="99""#),
                ));
                let mobile = if ua.contains("Mobile") { "?1" } else { "?0" };
                headers.push(("sec-ch-ua-mobile".into(), mobile.into()));
                headers.push((
                    "sec-ch-ua-platform".into(),
                    format!("\"{}\"", platform_for_user_agent(ua)),
                ));
            }
        }

        if rng.random_bool(self.cookie_header_probability.clamp(0.0, 1.0)) {
            headers.push(("Cookie".into(), synthetic_cookie(rng)));
        }

        headers.shuffle(rng);
        headers
    }
}

fn to_strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|s| s.to_string()).collect()
}

pub fn platform_for_user_agent(user_agent: &str) -> &'static str {
    if user_agent.contains("Android") {
        "Android"
    } else if user_agent.contains("iPhone") || user_agent.contains("iPad") {
        "iOS"
    } else if user_agent.contains("Windows") {
        "Windows"
    } else if user_agent.contains("Macintosh") {
        "macOS"
    } else if user_agent.contains("Linux") || user_agent.contains("X11") {
        "Linux"
    } else {
        "Unknown"
    }
}

fn chromium_major_version(user_agent: &str) -> Option<&str> {
    if user_agent.contains("Firefox/") {
        return None;
    }
    let start = user_agent.find("Chrome/")? + "Chrome/".len();
    let rest = &user_agent[start..];
    let end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    (end > 0).then(|| &rest[..end])
}

fn synthetic_cookie<R: Rng + ?Sized>(rng: &mut R) -> String {
    let ga = format!(
        "_ga=GA1.1.{}.{}",
        rng.random_range(10_000_000u64..100_000_000),
        rng.random_range(1_000_000_000u64..10_000_000_000)
    );
    let gid = format!(
        "_gid=GA1.1.{}.{}",
        rng.random_range(10_000_000u64..100_000_000),
        rng.random_range(1_000_000_000u64..10_000_000_000)
    );
    format!("cookieconsent_status=allow; {ga}; {gid}")
}

/// Session cookies first, then synthetic pairs whose names the session does
/// not already carry.
fn merge_cookie_header(session: Option<&str>, synthetic: &str) -> String {
    let mut pairs: Vec<&str> = session
        .into_iter()
        .flat_map(|s| s.split(';'))
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();
    let cookie_name = |pair: &str| pair.split('=').next().unwrap_or("").trim().to_string();
    let taken: Vec<String> = pairs.iter().map(|p| cookie_name(p)).collect();
    for pair in synthetic.split(';').map(str::trim).filter(|p| !p.is_empty()) {
        if !taken.contains(&cookie_name(pair)) {
            pairs.push(pair);
        }
    }
    pairs.join("; ")
}

fn header_map(headers: &[(String, String)]) -> HeaderMap {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                map.insert(name, value);
            }
            _ => debug!(header = %name, "skipping invalid identity header"),
        }
    }
    map
}

/// True when a response is an anti-bot challenge rather than real content.
pub fn is_block_page(status: StatusCode, body: &str, markers: &[String]) -> bool {
    let lower = body.to_ascii_lowercase();
    if matches!(status.as_u16(), 403 | 429 | 503) && lower.contains("captcha") {
        return true;
    }
    markers
        .iter()
        .any(|marker| lower.contains(&marker.to_ascii_lowercase()))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub base_url: String,
    pub timeout_secs: u64,
    pub max_attempts: usize,
    pub backoff: BackoffPolicy,
    pub polite_delay: DelayRange,
    pub identity: IdentityPool,
    pub block_markers: Vec<String>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self::for_base_url(DEFAULT_BASE_URL)
    }
}

impl FetchConfig {
    pub fn for_base_url(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout_secs: 30,
            max_attempts: 5,
            backoff: BackoffPolicy::default(),
            polite_delay: DelayRange::new(1.5, 3.5),
            identity: IdentityPool::for_base_url(base_url),
            block_markers: to_strings(DEFAULT_BLOCK_MARKERS),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    pub enabled: bool,
    pub settle: DelayRange,
    pub window_width: u32,
    pub window_height: u32,
    pub no_sandbox: bool,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            settle: DelayRange::new(3.0, 6.0),
            window_width: 1920,
            window_height: 1080,
            no_sandbox: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedPage {
    pub url: String,
    pub status: u16,
    pub body: String,
    pub rendered: bool,
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("render backend unavailable: {0}")]
    Unavailable(String),
    #[error("render failed: {0}")]
    Failed(String),
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transport error for {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("block page returned for {url} (status {status})")]
    Blocked { status: u16, url: String },
    #[error("all {attempts} attempts failed for {url}: {last}")]
    Exhausted {
        url: String,
        attempts: usize,
        last: Box<FetchError>,
    },
    #[error("render fallback failed for {url} after {attempts} attempts: {source}")]
    RenderFailed {
        url: String,
        attempts: usize,
        #[source]
        source: RenderError,
    },
}

impl FetchError {
    /// Transport, status and block errors are worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FetchError::Transport { .. } | FetchError::HttpStatus { .. } | FetchError::Blocked { .. }
        )
    }
}

#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError>;
}

/// Optional headless browser used once direct attempts are exhausted.
#[async_trait]
pub trait RenderBackend: Send + Sync {
    fn name(&self) -> &'static str;
    async fn render(&self, url: &str) -> Result<String, RenderError>;
}

/// One crawl run's HTTP session. Cookies persist across calls made through
/// the same fetcher and nowhere else.
pub struct HttpFetcher {
    client: reqwest::Client,
    jar: Arc<Jar>,
    config: FetchConfig,
    renderer: Option<Arc<dyn RenderBackend>>,
}

impl std::fmt::Debug for HttpFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpFetcher")
            .field("base_url", &self.config.base_url)
            .field("max_attempts", &self.config.max_attempts)
            .field("renderer", &self.renderer.as_ref().map(|r| r.name()))
            .finish()
    }
}

impl HttpFetcher {
    pub fn new(config: FetchConfig, renderer: Option<Arc<dyn RenderBackend>>) -> anyhow::Result<Self> {
        let jar = Arc::new(Jar::default());
        match Url::parse(&config.base_url) {
            Ok(base) => jar.add_cookie_str("cookieconsent_status=allow", &base),
            Err(err) => warn!(base_url = %config.base_url, error = %err, "base url is not a valid URL; session cookie not seeded"),
        }

        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .cookie_provider(jar.clone())
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("building reqwest client")?;

        Ok(Self {
            client,
            jar,
            config,
            renderer,
        })
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    pub fn has_renderer(&self) -> bool {
        self.renderer.is_some()
    }

    /// Identity headers for one attempt. reqwest skips its cookie jar when a
    /// `Cookie` header is present, so a drawn synthetic cookie is merged with
    /// the session cookies for `url`.
    fn identity_headers(&self, url: &str) -> HeaderMap {
        let mut drawn = {
            let mut rng = rand::rng();
            self.config.identity.draw(&mut rng)
        };
        if let Some((_, synthetic)) = drawn.iter_mut().find(|(name, _)| name.eq_ignore_ascii_case("cookie")) {
            let session = Url::parse(url)
                .ok()
                .and_then(|u| self.jar.cookies(&u))
                .and_then(|v| v.to_str().ok().map(str::to_string));
            *synthetic = merge_cookie_header(session.as_deref(), synthetic);
        }
        header_map(&drawn)
    }

    async fn attempt(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let headers = self.identity_headers(url);

        let resp = self
            .client
            .get(url)
            .headers(headers)
            .send()
            .await
            .map_err(|source| FetchError::Transport {
                url: url.to_string(),
                source,
            })?;

        let status = resp.status();
        let final_url = resp.url().to_string();
        let body = resp.text().await.map_err(|source| FetchError::Transport {
            url: url.to_string(),
            source,
        })?;

        if is_block_page(status, &body, &self.config.block_markers) {
            return Err(FetchError::Blocked {
                status: status.as_u16(),
                url: final_url,
            });
        }
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }

        Ok(FetchedPage {
            url: final_url,
            status: status.as_u16(),
            body,
            rendered: false,
        })
    }

    async fn fetch_inner(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let attempts = self.config.max_attempts.max(1);
        let mut attempt = 0usize;

        let last = loop {
            match self.attempt(url).await {
                Ok(page) => {
                    self.config.polite_delay.sleep().await;
                    return Ok(page);
                }
                Err(err) => {
                    warn!(attempt = attempt + 1, max_attempts = attempts, error = %err, "fetch attempt failed");
                    if attempt + 1 >= attempts {
                        break err;
                    }
                    tokio::time::sleep(self.config.backoff.delay_for_attempt(attempt)).await;
                    attempt += 1;
                }
            }
        };

        let Some(renderer) = &self.renderer else {
            error!(attempts, "all fetch attempts failed and no render backend is configured");
            return Err(FetchError::Exhausted {
                url: url.to_string(),
                attempts,
                last: Box::new(last),
            });
        };

        info!(backend = renderer.name(), "all fetch attempts failed; trying headless render");
        match renderer.render(url).await {
            Ok(body) => Ok(FetchedPage {
                url: url.to_string(),
                status: 200,
                body,
                rendered: true,
            }),
            Err(source) => {
                error!(backend = renderer.name(), error = %source, "headless render failed");
                Err(FetchError::RenderFailed {
                    url: url.to_string(),
                    attempts,
                    source,
                })
            }
        }
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let span = info_span!("http_fetch", url);
        self.fetch_inner(url).instrument(span).await
    }
}

/// Build the render fallback when enabled. Returns `None` (and logs why)
/// when rendering is disabled or this build carries no browser backend.
pub fn render_backend(config: &RenderConfig, identity: &IdentityPool) -> Option<Arc<dyn RenderBackend>> {
    if !config.enabled {
        return None;
    }
    #[cfg(feature = "headless")]
    {
        Some(Arc::new(ChromiumRenderer::new(
            config.clone(),
            identity.user_agents.clone(),
        )))
    }
    #[cfg(not(feature = "headless"))]
    {
        let _ = identity;
        warn!("render fallback requested but this build lacks the `headless` feature");
        None
    }
}
