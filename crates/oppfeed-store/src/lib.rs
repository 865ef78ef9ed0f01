//! Keyed opportunity record store: Postgres for production, in-memory for
//! dry runs and tests.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use oppfeed_core::{OpportunityRecord, StoredOpportunity};
use sqlx::postgres::{PgPool, PgPoolOptions};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

pub const CRATE_NAME: &str = "oppfeed-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("opportunity already stored: {title} ({apply_link})")]
    Duplicate { title: String, apply_link: String },
    #[error("opportunity {0} not found")]
    NotFound(Uuid),
    #[error("retention of {0} days is out of range")]
    InvalidRetention(i64),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Exact, case-sensitive match on `(title, apply_link)`.
    async fn exists(&self, title: &str, apply_link: &str) -> Result<bool, StoreError>;

    /// Either fully creates the row or reports failure.
    async fn create(&self, record: &OpportunityRecord) -> Result<StoredOpportunity, StoreError>;

    /// Oldest first.
    async fn list_unposted(&self) -> Result<Vec<StoredOpportunity>, StoreError>;

    /// Newest first.
    async fn list_all(&self) -> Result<Vec<StoredOpportunity>, StoreError>;

    async fn mark_posted(&self, id: Uuid) -> Result<(), StoreError>;

    /// Deletes rows created more than `days` days ago and returns how many.
    async fn purge_older_than(&self, days: i64) -> Result<u64, StoreError>;
}

fn purge_cutoff(days: i64) -> Result<DateTime<Utc>, StoreError> {
    TimeDelta::try_days(days.max(0))
        .and_then(|window| Utc::now().checked_sub_signed(window))
        .ok_or(StoreError::InvalidRetention(days))
}

#[derive(Debug, sqlx::FromRow)]
struct OpportunityRow {
    id: Uuid,
    title: String,
    link: String,
    description: Option<String>,
    deadline: Option<String>,
    thumbnail: Option<String>,
    tags: Vec<String>,
    created_at: DateTime<Utc>,
    posted: bool,
}

impl From<OpportunityRow> for StoredOpportunity {
    fn from(row: OpportunityRow) -> Self {
        Self {
            id: row.id,
            title: row.title,
            apply_link: row.link,
            description: row.description,
            deadline: row.deadline,
            thumbnail_url: row.thumbnail,
            tags: row.tags,
            created_at: row.created_at,
            posted: row.posted,
        }
    }
}

const SELECT_COLUMNS: &str =
    "id, title, link, description, deadline, thumbnail, tags, created_at, posted";

#[derive(Debug, Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running database migrations")?;
        info!("database migrations applied");
        Ok(())
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn exists(&self, title: &str, apply_link: &str) -> Result<bool, StoreError> {
        let found: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM opportunities WHERE title = $1 AND link = $2)",
        )
        .bind(title)
        .bind(apply_link)
        .fetch_one(&self.pool)
        .await?;
        Ok(found)
    }

    async fn create(&self, record: &OpportunityRecord) -> Result<StoredOpportunity, StoreError> {
        let row = sqlx::query_as::<_, OpportunityRow>(&format!(
            r#"
            INSERT INTO opportunities (id, title, link, description, deadline, thumbnail, tags, created_at, posted)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, FALSE)
            RETURNING {SELECT_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(&record.title)
        .bind(&record.apply_link)
        .bind(&record.description)
        .bind(&record.deadline)
        .bind(&record.thumbnail_url)
        .bind(&record.tags)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await;

        match row {
            Ok(row) => Ok(row.into()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Err(StoreError::Duplicate {
                title: record.title.clone(),
                apply_link: record.apply_link.clone(),
            }),
            Err(err) => Err(err.into()),
        }
    }

    async fn list_unposted(&self) -> Result<Vec<StoredOpportunity>, StoreError> {
        let rows = sqlx::query_as::<_, OpportunityRow>(&format!(
            "SELECT {SELECT_COLUMNS} FROM opportunities WHERE posted = FALSE ORDER BY created_at ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn list_all(&self) -> Result<Vec<StoredOpportunity>, StoreError> {
        let rows = sqlx::query_as::<_, OpportunityRow>(&format!(
            "SELECT {SELECT_COLUMNS} FROM opportunities ORDER BY created_at DESC"
        ))
        .fetch_all(&self.pool)
        .await?;
        info!(count = rows.len(), "fetched opportunities");
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn mark_posted(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE opportunities SET posted = TRUE WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn purge_older_than(&self, days: i64) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM opportunities WHERE created_at < $1")
            .bind(purge_cutoff(days)?)
            .execute(&self.pool)
            .await?;
        info!(deleted = result.rows_affected(), days, "purged old opportunities");
        Ok(result.rows_affected())
    }
}

/// Process-local store with the same semantics as the Postgres one,
/// including the `(title, apply_link)` uniqueness constraint.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    rows: Mutex<Vec<StoredOpportunity>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert with an explicit creation time.
    pub async fn create_at(
        &self,
        record: &OpportunityRecord,
        created_at: DateTime<Utc>,
    ) -> Result<StoredOpportunity, StoreError> {
        let mut rows = self.rows.lock().await;
        if rows.iter().any(|row| row.dedup_key() == record.dedup_key()) {
            return Err(StoreError::Duplicate {
                title: record.title.clone(),
                apply_link: record.apply_link.clone(),
            });
        }
        let stored = StoredOpportunity::from_record(record, created_at);
        rows.push(stored.clone());
        Ok(stored)
    }

    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.lock().await.is_empty()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn exists(&self, title: &str, apply_link: &str) -> Result<bool, StoreError> {
        Ok(self
            .rows
            .lock()
            .await
            .iter()
            .any(|row| row.title == title && row.apply_link == apply_link))
    }

    async fn create(&self, record: &OpportunityRecord) -> Result<StoredOpportunity, StoreError> {
        self.create_at(record, Utc::now()).await
    }

    async fn list_unposted(&self) -> Result<Vec<StoredOpportunity>, StoreError> {
        let mut rows: Vec<_> = self
            .rows
            .lock()
            .await
            .iter()
            .filter(|row| !row.posted)
            .cloned()
            .collect();
        rows.sort_by_key(|row| row.created_at);
        Ok(rows)
    }

    async fn list_all(&self) -> Result<Vec<StoredOpportunity>, StoreError> {
        let mut rows = self.rows.lock().await.clone();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }

    async fn mark_posted(&self, id: Uuid) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().await;
        let row = rows
            .iter_mut()
            .find(|row| row.id == id)
            .ok_or(StoreError::NotFound(id))?;
        row.posted = true;
        Ok(())
    }

    async fn purge_older_than(&self, days: i64) -> Result<u64, StoreError> {
        let cutoff = purge_cutoff(days)?;
        let mut rows = self.rows.lock().await;
        let before = rows.len();
        rows.retain(|row| row.created_at >= cutoff);
        Ok((before - rows.len()) as u64)
    }
}
