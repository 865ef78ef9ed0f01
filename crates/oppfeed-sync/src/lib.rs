//! Crawl orchestration: per-article ingest, the date-driven pipeline, and
//! the scheduled daily task bundle.

use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Days, Local, NaiveDate, Utc};
use futures::FutureExt;
use oppfeed_adapters::{extract_detail, normalize_deadline, parse_listing, ExtractionRules};
use oppfeed_core::{ArticleStub, OpportunityRecord};
use oppfeed_fetch::{render_backend, DelayRange, FetchConfig, HttpFetcher, PageFetcher, RenderConfig};
use oppfeed_publish::{PublishStats, TelegramConfig, TelegramPublisher};
use oppfeed_store::{RecordStore, StoreError};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "oppfeed-sync";

pub const DEFAULT_SYNC_CRONS: [&str; 3] = ["0 0 8 * * *", "0 0 14 * * *", "0 0 20 * * *"];

/// Everything a single crawl needs, loadable from YAML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlConfig {
    pub fetch: FetchConfig,
    pub render: RenderConfig,
    /// Pause after each detail page fetch.
    pub item_delay: DelayRange,
    pub rules: ExtractionRules,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            fetch: FetchConfig::default(),
            render: RenderConfig::default(),
            item_delay: DelayRange::new(3.0, 6.0),
            rules: ExtractionRules::default(),
        }
    }
}

impl CrawlConfig {
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(raw).context("parsing crawl config yaml")?;
        config.rules.validate().context("validating extraction rules")?;
        Ok(config)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&raw).with_context(|| format!("loading {}", path.display()))
    }

    /// Point the crawl at another site, keeping every other setting.
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        let fresh = FetchConfig::for_base_url(base_url);
        self.fetch.base_url = fresh.base_url;
        self.fetch.identity.referers = fresh.identity.referers;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.fetch.base_url
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub crawl_config_path: Option<PathBuf>,
    pub base_url: Option<String>,
    pub scheduler_enabled: bool,
    pub sync_crons: Vec<String>,
    pub purge_days: i64,
    pub web_port: u16,
    pub headless: bool,
    pub telegram: TelegramConfig,
}

fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false)
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let sync_crons = DEFAULT_SYNC_CRONS
            .iter()
            .enumerate()
            .map(|(idx, default)| {
                std::env::var(format!("SYNC_CRON_{}", idx + 1)).unwrap_or_else(|_| default.to_string())
            })
            .collect();
        Self {
            database_url: env_non_empty("DATABASE_URL"),
            crawl_config_path: env_non_empty("OPPFEED_CRAWL_CONFIG").map(PathBuf::from),
            base_url: env_non_empty("OPPFEED_BASE_URL"),
            scheduler_enabled: env_flag("OPPFEED_SCHEDULER_ENABLED"),
            sync_crons,
            purge_days: std::env::var("OPPFEED_PURGE_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            web_port: std::env::var("OPPFEED_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
            headless: env_flag("OPPFEED_HEADLESS"),
            telegram: TelegramConfig::from_env(),
        }
    }

    /// Crawl settings from the configured YAML file (or defaults), with the
    /// environment's base URL and headless overrides applied.
    pub async fn crawl_config(&self) -> Result<CrawlConfig> {
        let mut config = match &self.crawl_config_path {
            Some(path) => CrawlConfig::load(path).await?,
            None => CrawlConfig::default(),
        };
        if let Some(base_url) = &self.base_url {
            config = config.with_base_url(base_url);
        }
        if self.headless {
            config.render.enabled = true;
        }
        Ok(config)
    }
}

/// The target date when none is given: yesterday on the local calendar.
pub fn default_target_date() -> NaiveDate {
    let today = Local::now().date_naive();
    today.checked_sub_days(Days::new(1)).unwrap_or(today)
}

pub fn listing_url(base_url: &str, date: NaiveDate) -> String {
    format!("{}/{}/", base_url.trim_end_matches('/'), date.format("%Y/%m/%d"))
}

/// Accepts `YYYY/MM/DD` or `YYYY-MM-DD`.
pub fn parse_target_date(raw: &str) -> Result<NaiveDate> {
    let raw = raw.trim();
    NaiveDate::parse_from_str(raw, "%Y/%m/%d")
        .or_else(|_| NaiveDate::parse_from_str(raw, "%Y-%m-%d"))
        .with_context(|| format!("invalid date {raw:?}; expected YYYY/MM/DD or YYYY-MM-DD"))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestStats {
    pub stubs: usize,
    pub created: usize,
    pub duplicates: usize,
    pub invalid_links: usize,
    pub fetch_failures: usize,
    pub store_failures: usize,
    pub crashed: usize,
}

#[derive(Debug)]
enum StubOutcome {
    Created(Box<OpportunityRecord>),
    Duplicate,
    InvalidLink,
    FetchFailed,
    StoreFailed,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestReport {
    pub records: Vec<OpportunityRecord>,
    pub stats: IngestStats,
}

/// Turns a listing page into newly stored records, one article at a time.
/// Each article's failure (error or panic) is contained to that article.
pub struct IngestController<'a> {
    fetcher: &'a dyn PageFetcher,
    store: &'a dyn RecordStore,
    config: &'a CrawlConfig,
}

impl<'a> IngestController<'a> {
    pub fn new(fetcher: &'a dyn PageFetcher, store: &'a dyn RecordStore, config: &'a CrawlConfig) -> Self {
        Self {
            fetcher,
            store,
            config,
        }
    }

    pub async fn ingest(&self, listing_body: &str, listing_url: &str) -> IngestReport {
        let mut report = IngestReport::default();
        let stubs = match parse_listing(listing_body, listing_url, &self.config.rules) {
            Ok(stubs) => stubs,
            Err(err) => {
                error!(url = listing_url, error = %err, "listing rules are unusable");
                return report;
            }
        };
        report.stats.stubs = stubs.len();
        info!(count = stubs.len(), url = listing_url, "articles found on listing");

        for stub in &stubs {
            let span = info_span!("article", position = stub.position, title = %stub.title);
            let outcome = AssertUnwindSafe(self.process_stub(stub).instrument(span))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(StubOutcome::Created(record))) => {
                    report.stats.created += 1;
                    report.records.push(*record);
                }
                Ok(Ok(StubOutcome::Duplicate)) => report.stats.duplicates += 1,
                Ok(Ok(StubOutcome::InvalidLink)) => report.stats.invalid_links += 1,
                Ok(Ok(StubOutcome::FetchFailed)) => report.stats.fetch_failures += 1,
                Ok(Ok(StubOutcome::StoreFailed)) => report.stats.store_failures += 1,
                Ok(Err(err)) => {
                    report.stats.store_failures += 1;
                    warn!(title = %stub.title, error = %err, "article skipped");
                }
                Err(_) => {
                    report.stats.crashed += 1;
                    error!(title = %stub.title, "article processing panicked; skipped");
                }
            }
        }
        report
    }

    async fn process_stub(&self, stub: &ArticleStub) -> Result<StubOutcome> {
        let page = match self.fetcher.fetch(&stub.detail_url).await {
            Ok(page) => page,
            Err(err) => {
                warn!(url = %stub.detail_url, error = %err, "detail fetch failed; skipping article");
                return Ok(StubOutcome::FetchFailed);
            }
        };
        self.config.item_delay.sleep().await;

        let detail = extract_detail(&page.body, &stub.detail_url, &self.config.rules);
        let deadline = normalize_deadline(detail.deadline_raw.as_deref());
        let link_is_fallback = detail.apply_link_is_fallback;
        let record = OpportunityRecord::from_parts(stub, detail, deadline);

        if !record.has_external_link(self.config.base_url()) {
            if link_is_fallback {
                warn!(apply_link = %record.apply_link, "no apply link found; skipping article");
            } else {
                warn!(apply_link = %record.apply_link, "apply link points at the crawled site; skipping article");
            }
            return Ok(StubOutcome::InvalidLink);
        }

        if self
            .store
            .exists(&record.title, &record.apply_link)
            .await
            .context("checking for existing opportunity")?
        {
            debug!("already stored; skipping article");
            return Ok(StubOutcome::Duplicate);
        }

        match self.store.create(&record).await {
            Ok(stored) => {
                info!(id = %stored.id, apply_link = %record.apply_link, "opportunity saved");
                Ok(StubOutcome::Created(Box::new(record)))
            }
            Err(StoreError::Duplicate { .. }) => {
                debug!("stored concurrently; skipping article");
                Ok(StubOutcome::Duplicate)
            }
            Err(err) => {
                warn!(error = %err, "could not save opportunity");
                Ok(StubOutcome::StoreFailed)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub target_date: NaiveDate,
    pub listing_url: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub listing_fetched: bool,
    pub stats: IngestStats,
    pub records: Vec<OpportunityRecord>,
}

/// One date-indexed crawl over a listing page and its detail pages.
pub struct Pipeline {
    config: CrawlConfig,
    fetcher: Arc<dyn PageFetcher>,
    store: Arc<dyn RecordStore>,
}

impl Pipeline {
    pub fn new(config: CrawlConfig, fetcher: Arc<dyn PageFetcher>, store: Arc<dyn RecordStore>) -> Self {
        Self {
            config,
            fetcher,
            store,
        }
    }

    /// Pipeline with a fresh HTTP session and, when enabled and compiled in,
    /// the headless render fallback.
    pub fn from_config(config: CrawlConfig, store: Arc<dyn RecordStore>) -> Result<Self> {
        let renderer = render_backend(&config.render, &config.fetch.identity);
        let fetcher = HttpFetcher::new(config.fetch.clone(), renderer).context("building http fetcher")?;
        info!(
            base_url = %fetcher.config().base_url,
            render_fallback = fetcher.has_renderer(),
            "http fetcher ready"
        );
        Ok(Self::new(config, Arc::new(fetcher), store))
    }

    pub fn config(&self) -> &CrawlConfig {
        &self.config
    }

    /// Newly created records for `target_date` (yesterday when `None`).
    pub async fn run(&self, target_date: Option<NaiveDate>) -> Vec<OpportunityRecord> {
        self.run_with_report(target_date).await.records
    }

    pub async fn run_with_report(&self, target_date: Option<NaiveDate>) -> SyncRunSummary {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let target_date = target_date.unwrap_or_else(default_target_date);
        let url = listing_url(self.config.base_url(), target_date);
        let span = info_span!("sync_run", %run_id, %target_date);

        async move {
            info!(url = %url, "fetching listing");
            let (listing_fetched, report) = match self.fetcher.fetch(&url).await {
                Ok(page) => {
                    let controller = IngestController::new(self.fetcher.as_ref(), self.store.as_ref(), &self.config);
                    (true, controller.ingest(&page.body, &url).await)
                }
                Err(err) => {
                    error!(url = %url, error = %err, "listing fetch failed; nothing ingested");
                    (false, IngestReport::default())
                }
            };

            let stats = report.stats;
            info!(
                stubs = stats.stubs,
                created = stats.created,
                duplicates = stats.duplicates,
                invalid_links = stats.invalid_links,
                fetch_failures = stats.fetch_failures,
                store_failures = stats.store_failures,
                crashed = stats.crashed,
                "sync run finished"
            );

            SyncRunSummary {
                run_id,
                target_date,
                listing_url: url,
                started_at,
                finished_at: Utc::now(),
                listing_fetched,
                stats,
                records: report.records,
            }
        }
        .instrument(span)
        .await
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DailyRunReport {
    pub created: Option<usize>,
    pub published: Option<PublishStats>,
    pub purged: Option<u64>,
}

/// Crawl, publish, then purge. Steps run in order and a failing step does
/// not stop the ones after it. Runs never overlap.
pub struct DailyTasks {
    crawl: CrawlConfig,
    purge_days: i64,
    store: Arc<dyn RecordStore>,
    publisher: TelegramPublisher,
    run_lock: Mutex<()>,
}

impl DailyTasks {
    pub fn new(crawl: CrawlConfig, purge_days: i64, store: Arc<dyn RecordStore>, telegram: TelegramConfig) -> Result<Self> {
        Ok(Self {
            crawl,
            purge_days,
            store,
            publisher: TelegramPublisher::new(telegram)?,
            run_lock: Mutex::new(()),
        })
    }

    /// `None` when a previous run still holds the lock.
    pub async fn run(&self) -> Option<DailyRunReport> {
        let Ok(_guard) = self.run_lock.try_lock() else {
            warn!("previous daily run still in progress; skipping this trigger");
            return None;
        };

        let mut report = DailyRunReport::default();

        match Pipeline::from_config(self.crawl.clone(), self.store.clone()) {
            Ok(pipeline) => report.created = Some(pipeline.run(None).await.len()),
            Err(err) => error!(error = %err, "could not start crawl"),
        }

        match self.publisher.publish_unposted(self.store.as_ref()).await {
            Ok(stats) => report.published = Some(stats),
            Err(err) => error!(error = %err, "publishing failed"),
        }

        match self.store.purge_older_than(self.purge_days).await {
            Ok(deleted) => report.purged = Some(deleted),
            Err(err) => error!(error = %err, "purge failed"),
        }

        Some(report)
    }
}

pub async fn build_scheduler(tasks: Arc<DailyTasks>, crons: &[String]) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for cron in crons {
        let tasks = tasks.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let tasks = tasks.clone();
            Box::pin(async move {
                info!("scheduled daily run triggered");
                tasks.run().await;
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
    }
    Ok(sched)
}

/// Scheduler for the configured crons, or `None` when scheduling is off.
pub async fn maybe_build_scheduler(config: &SyncConfig, tasks: Arc<DailyTasks>) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }
    build_scheduler(tasks, &config.sync_crons).await.map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use oppfeed_core::StoredOpportunity;
    use oppfeed_fetch::{BackoffPolicy, FetchError, FetchedPage};
    use oppfeed_store::MemoryRecordStore;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const BASE: &str = "https://opportunitydesk.org";

    enum Scripted {
        Page(String),
        Exhausted,
        Panic,
    }

    #[derive(Default)]
    struct ScriptedFetcher {
        pages: HashMap<String, Scripted>,
        calls: StdMutex<Vec<String>>,
    }

    impl ScriptedFetcher {
        fn page(mut self, url: &str, body: String) -> Self {
            self.pages.insert(url.to_string(), Scripted::Page(body));
            self
        }

        fn failing(mut self, url: &str) -> Self {
            self.pages.insert(url.to_string(), Scripted::Exhausted);
            self
        }

        fn panicking(mut self, url: &str) -> Self {
            self.pages.insert(url.to_string(), Scripted::Panic);
            self
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PageFetcher for ScriptedFetcher {
        async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError> {
            self.calls.lock().unwrap().push(url.to_string());
            match self.pages.get(url) {
                Some(Scripted::Page(body)) => Ok(FetchedPage {
                    url: url.to_string(),
                    status: 200,
                    body: body.clone(),
                    rendered: false,
                }),
                Some(Scripted::Panic) => panic!("scripted panic for {url}"),
                Some(Scripted::Exhausted) | None => Err(FetchError::Exhausted {
                    url: url.to_string(),
                    attempts: 5,
                    last: Box::new(FetchError::HttpStatus {
                        status: 503,
                        url: url.to_string(),
                    }),
                }),
            }
        }
    }

    /// Memory store whose writes fail for chosen titles.
    #[derive(Default)]
    struct FailingStore {
        inner: MemoryRecordStore,
        fail_create: Vec<String>,
        fail_exists: Vec<String>,
    }

    #[async_trait]
    impl RecordStore for FailingStore {
        async fn exists(&self, title: &str, apply_link: &str) -> Result<bool, StoreError> {
            if self.fail_exists.iter().any(|t| t == title) {
                return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
            }
            self.inner.exists(title, apply_link).await
        }

        async fn create(&self, record: &OpportunityRecord) -> Result<StoredOpportunity, StoreError> {
            if self.fail_create.contains(&record.title) {
                return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
            }
            self.inner.create(record).await
        }

        async fn list_unposted(&self) -> Result<Vec<StoredOpportunity>, StoreError> {
            self.inner.list_unposted().await
        }

        async fn list_all(&self) -> Result<Vec<StoredOpportunity>, StoreError> {
            self.inner.list_all().await
        }

        async fn mark_posted(&self, id: Uuid) -> Result<(), StoreError> {
            self.inner.mark_posted(id).await
        }

        async fn purge_older_than(&self, days: i64) -> Result<u64, StoreError> {
            self.inner.purge_older_than(days).await
        }
    }

    fn fast_config() -> CrawlConfig {
        CrawlConfig {
            item_delay: DelayRange::ZERO,
            ..CrawlConfig::default()
        }
    }

    fn detail_url(slug: &str) -> String {
        format!("{BASE}/2025/01/14/{slug}/")
    }

    fn listing(slugs: &[&str]) -> String {
        let articles: String = slugs
            .iter()
            .map(|slug| {
                format!(
                    r#"<article class="post"><h3 class="entry-title"><a href="{}">{} Fellowship</a></h3></article>"#,
                    detail_url(slug),
                    slug.to_uppercase()
                )
            })
            .collect();
        format!("<html><body>{articles}</body></html>")
    }

    fn detail(apply_href: &str, description: &str) -> String {
        format!(
            r#"<html><body>
            <figure class="image-link"><img src="/wp-content/uploads/thumb.jpg"></figure>
            <div class="entry-content">
              <p><strong>Deadline:</strong> 15th September, 2025 for all applicants</p>
              <p>{description}</p>
              <p>For more information, visit the <a href="{apply_href}">official page</a>.</p>
            </div>
            <a rel="category tag" href="/category/grants/">Grants</a>
            </body></html>"#
        )
    }

    fn five_article_fetcher() -> ScriptedFetcher {
        let slugs = ["a", "b", "c", "d", "e"];
        let mut fetcher = ScriptedFetcher::default();
        for slug in slugs {
            fetcher = fetcher.page(
                &detail_url(slug),
                detail(&format!("https://apply.example/{slug}"), "Fully funded."),
            );
        }
        fetcher
    }

    #[tokio::test]
    async fn ingest_builds_records_from_detail_pages() {
        let fetcher = five_article_fetcher();
        let store = MemoryRecordStore::new();
        let config = fast_config();
        let controller = IngestController::new(&fetcher, &store, &config);

        let report = controller.ingest(&listing(&["a"]), &format!("{BASE}/2025/01/14/")).await;
        assert_eq!(report.records.len(), 1);
        let record = &report.records[0];
        assert_eq!(record.title, "A Fellowship");
        assert_eq!(record.detail_url, detail_url("a"));
        assert_eq!(record.apply_link, "https://apply.example/a");
        assert_eq!(record.deadline.as_deref(), Some("15th September, 2025"));
        assert_eq!(
            record.thumbnail_url.as_deref(),
            Some("https://opportunitydesk.org/wp-content/uploads/thumb.jpg")
        );
        assert_eq!(record.tags, vec!["Grants".to_string()]);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn second_ingest_of_same_listing_creates_nothing() {
        let fetcher = five_article_fetcher();
        let store = MemoryRecordStore::new();
        let config = fast_config();
        let controller = IngestController::new(&fetcher, &store, &config);
        let body = listing(&["a", "b", "c"]);
        let url = format!("{BASE}/2025/01/14/");

        let first = controller.ingest(&body, &url).await;
        assert_eq!(first.records.len(), 3);

        let second = controller.ingest(&body, &url).await;
        assert!(second.records.is_empty());
        assert_eq!(second.stats.duplicates, 3);
        assert_eq!(store.len().await, 3);
    }

    #[tokio::test]
    async fn duplicate_detection_uses_title_and_link_only() {
        let store = MemoryRecordStore::new();
        let config = fast_config();
        let url = format!("{BASE}/2025/01/14/");

        let first = five_article_fetcher();
        IngestController::new(&first, &store, &config)
            .ingest(&listing(&["a"]), &url)
            .await;

        // same key, different description and thumbnail
        let changed = ScriptedFetcher::default().page(
            &detail_url("a"),
            detail("https://apply.example/a", "Rewritten summary.").replace("thumb.jpg", "other.jpg"),
        );
        let report = IngestController::new(&changed, &store, &config)
            .ingest(&listing(&["a"]), &url)
            .await;
        assert!(report.records.is_empty());
        assert_eq!(report.stats.duplicates, 1);

        // same title, new link
        let relinked = ScriptedFetcher::default().page(&detail_url("a"), detail("https://apply.example/a-2", "x"));
        let report = IngestController::new(&relinked, &store, &config)
            .ingest(&listing(&["a"]), &url)
            .await;
        assert_eq!(report.records.len(), 1);

        let stored: Vec<StoredOpportunity> = store.list_all().await.unwrap();
        assert_eq!(stored.len(), 2);
    }

    #[tokio::test]
    async fn on_domain_or_missing_links_are_rejected() {
        let fetcher = ScriptedFetcher::default()
            .page(&detail_url("a"), detail(&format!("{BASE}/apply/"), "Internal link."))
            .page(
                &detail_url("b"),
                "<html><body><div class=\"entry-content\"><p>No links at all.</p></div></body></html>".to_string(),
            );
        let store = MemoryRecordStore::new();
        let config = fast_config();
        let report = IngestController::new(&fetcher, &store, &config)
            .ingest(&listing(&["a", "b"]), &format!("{BASE}/2025/01/14/"))
            .await;

        assert!(report.records.is_empty());
        assert_eq!(report.stats.invalid_links, 2);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn one_failed_detail_fetch_does_not_stop_the_batch() {
        let fetcher = five_article_fetcher().failing(&detail_url("c"));
        let store = MemoryRecordStore::new();
        let config = fast_config();
        let report = IngestController::new(&fetcher, &store, &config)
            .ingest(&listing(&["a", "b", "c", "d", "e"]), &format!("{BASE}/2025/01/14/"))
            .await;

        assert_eq!(report.records.len(), 4);
        assert_eq!(report.stats.fetch_failures, 1);
        assert!(report.records.iter().all(|r| r.apply_link != "https://apply.example/c"));
        assert_eq!(fetcher.calls().len(), 5);
    }

    #[tokio::test]
    async fn panicking_article_is_contained() {
        let fetcher = five_article_fetcher().panicking(&detail_url("b"));
        let store = MemoryRecordStore::new();
        let config = fast_config();
        let report = IngestController::new(&fetcher, &store, &config)
            .ingest(&listing(&["a", "b", "c"]), &format!("{BASE}/2025/01/14/"))
            .await;

        assert_eq!(report.records.len(), 2);
        assert_eq!(report.stats.crashed, 1);
    }

    #[tokio::test]
    async fn failed_store_write_skips_only_that_article() {
        let fetcher = five_article_fetcher();
        let store = FailingStore {
            fail_create: vec!["C Fellowship".into()],
            ..FailingStore::default()
        };
        let config = fast_config();
        let report = IngestController::new(&fetcher, &store, &config)
            .ingest(&listing(&["a", "b", "c", "d", "e"]), &format!("{BASE}/2025/01/14/"))
            .await;

        assert_eq!(report.records.len(), 4);
        assert_eq!(report.stats.created, 4);
        assert_eq!(report.stats.store_failures, 1);
        assert!(report.records.iter().all(|r| r.title != "C Fellowship"));
        assert_eq!(store.inner.len().await, 4);
    }

    #[tokio::test]
    async fn failed_existence_check_counts_as_store_failure() {
        let fetcher = five_article_fetcher();
        let store = FailingStore {
            fail_exists: vec!["A Fellowship".into()],
            fail_create: vec!["B Fellowship".into()],
            ..FailingStore::default()
        };
        let config = fast_config();
        let report = IngestController::new(&fetcher, &store, &config)
            .ingest(&listing(&["a", "b", "c"]), &format!("{BASE}/2025/01/14/"))
            .await;

        assert_eq!(report.records.len(), 1);
        assert_eq!(report.records[0].title, "C Fellowship");
        assert_eq!(report.stats.store_failures, 2);
        assert_eq!(store.inner.len().await, 1);
    }

    #[tokio::test]
    async fn pipeline_fetches_dated_listing() {
        let date = NaiveDate::from_ymd_opt(2025, 1, 14).unwrap();
        let fetcher = Arc::new(five_article_fetcher().page(&format!("{BASE}/2025/01/14/"), listing(&["a", "b"])));
        let store = Arc::new(MemoryRecordStore::new());
        let pipeline = Pipeline::new(fast_config(), fetcher.clone(), store.clone());

        let records = pipeline.run(Some(date)).await;
        assert_eq!(records.len(), 2);
        assert_eq!(fetcher.calls()[0], "https://opportunitydesk.org/2025/01/14/");
    }

    #[tokio::test]
    async fn listing_failure_returns_empty() {
        let fetcher = Arc::new(ScriptedFetcher::default());
        let store = Arc::new(MemoryRecordStore::new());
        let pipeline = Pipeline::new(fast_config(), fetcher.clone(), store);

        let summary = pipeline
            .run_with_report(Some(NaiveDate::from_ymd_opt(2025, 3, 2).unwrap()))
            .await;
        assert!(!summary.listing_fetched);
        assert!(summary.records.is_empty());
        assert_eq!(fetcher.calls().len(), 1);
    }

    #[test]
    fn listing_url_uses_date_path() {
        let date = NaiveDate::from_ymd_opt(2025, 9, 5).unwrap();
        assert_eq!(listing_url("https://opportunitydesk.org/", date), "https://opportunitydesk.org/2025/09/05/");
    }

    #[test]
    fn target_date_formats() {
        let expected = NaiveDate::from_ymd_opt(2025, 9, 5).unwrap();
        assert_eq!(parse_target_date("2025/09/05").unwrap(), expected);
        assert_eq!(parse_target_date("2025-09-05").unwrap(), expected);
        assert!(parse_target_date("05.09.2025").is_err());
    }

    #[test]
    fn default_target_is_yesterday() {
        let today = Local::now().date_naive();
        assert_eq!(default_target_date().succ_opt(), Some(today));
    }

    #[test]
    fn crawl_config_yaml_overrides() {
        let config = CrawlConfig::from_yaml_str(
            r#"
fetch:
  base_url: https://mirror.example
  max_attempts: 3
item_delay:
  min_secs: 0.0
  max_secs: 0.0
rules:
  tag_selectors: ["a.tag"]
"#,
        )
        .unwrap();
        assert_eq!(config.fetch.max_attempts, 3);
        assert_eq!(config.base_url(), "https://mirror.example");
        assert_eq!(config.item_delay, DelayRange::ZERO);
        assert_eq!(config.rules.tag_selectors, vec!["a.tag".to_string()]);
        assert_eq!(config.rules.article_container, "article");
    }

    #[tokio::test]
    async fn example_config_matches_defaults() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../config/crawl.example.yaml");
        let config = CrawlConfig::load(&path).await.unwrap();
        assert_eq!(config, CrawlConfig::default());
    }

    #[test]
    fn crawl_config_rejects_bad_selector() {
        let err = CrawlConfig::from_yaml_str("rules:\n  article_container: \"a[[\"\n").unwrap_err();
        assert!(format!("{err:#}").contains("validating extraction rules"));
    }

    #[test]
    fn base_url_override_updates_referers() {
        let config = CrawlConfig::default().with_base_url("https://mirror.example/");
        assert_eq!(config.base_url(), "https://mirror.example");
        assert!(config
            .fetch
            .identity
            .referers
            .iter()
            .any(|r| r == "https://mirror.example/"));
    }

    fn wiremock_crawl(base: &str) -> CrawlConfig {
        let mut config = fast_config().with_base_url(base);
        config.fetch.max_attempts = 1;
        config.fetch.timeout_secs = 5;
        config.fetch.polite_delay = DelayRange::ZERO;
        config.fetch.backoff = BackoffPolicy {
            unit_secs: 0.0,
            max_exponent: 0,
            jitter: DelayRange::ZERO,
        };
        config
    }

    #[tokio::test]
    async fn daily_run_crawls_then_purges() {
        let server = MockServer::start().await;
        let date = default_target_date();
        let listing_path = format!("/{}/", date.format("%Y/%m/%d"));
        let detail_path = "/2025/01/14/grant/";
        Mock::given(method("GET"))
            .and(path(listing_path.as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_string(format!(
                r#"<article><a href="{}{detail_path}">Grant</a></article>"#,
                server.uri()
            )))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(detail_path))
            .respond_with(ResponseTemplate::new(200).set_body_string(detail("https://apply.example/g", "Grant.")))
            .mount(&server)
            .await;

        let store = Arc::new(MemoryRecordStore::new());
        let tasks = DailyTasks::new(wiremock_crawl(&server.uri()), 30, store.clone(), TelegramConfig::default()).unwrap();
        let report = tasks.run().await.unwrap();

        assert_eq!(report.created, Some(1));
        assert_eq!(report.published.map(|p| p.posted), Some(0));
        assert_eq!(report.purged, Some(0));
        assert_eq!(store.list_unposted().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn overlapping_daily_run_is_skipped() {
        let store = Arc::new(MemoryRecordStore::new());
        let tasks = DailyTasks::new(fast_config(), 30, store, TelegramConfig::default()).unwrap();
        let _held = tasks.run_lock.lock().await;
        assert!(tasks.run().await.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn scheduler_only_built_when_enabled() {
        let store = Arc::new(MemoryRecordStore::new());
        let tasks = Arc::new(DailyTasks::new(fast_config(), 30, store, TelegramConfig::default()).unwrap());
        let mut config = SyncConfig {
            database_url: None,
            crawl_config_path: None,
            base_url: None,
            scheduler_enabled: false,
            sync_crons: DEFAULT_SYNC_CRONS.iter().map(|c| c.to_string()).collect(),
            purge_days: 30,
            web_port: 8000,
            headless: false,
            telegram: TelegramConfig::default(),
        };
        assert!(maybe_build_scheduler(&config, tasks.clone()).await.unwrap().is_none());

        config.scheduler_enabled = true;
        assert!(maybe_build_scheduler(&config, tasks).await.unwrap().is_some());
    }
}
