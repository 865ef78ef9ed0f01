//! Core domain model for the opportunity feed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "oppfeed-core";

/// Listing-page reference to an article, before its detail page is read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArticleStub {
    /// 1-based position of the article container on the listing page.
    pub position: usize,
    pub title: String,
    pub detail_url: String,
}

/// Fields pulled from a detail page. Every field is best-effort except
/// `apply_link`, which falls back to the detail page URL itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DetailFields {
    pub apply_link: String,
    pub apply_link_is_fallback: bool,
    pub deadline_raw: Option<String>,
    pub thumbnail_url: Option<String>,
    pub description: Option<String>,
    pub tags: Vec<String>,
}

/// Identity used for duplicate detection: exact, case-sensitive match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DedupKey<'a> {
    pub title: &'a str,
    pub apply_link: &'a str,
}

/// Transient record built for one article during one crawl run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpportunityRecord {
    pub title: String,
    pub detail_url: String,
    pub apply_link: String,
    pub deadline_raw: Option<String>,
    pub deadline: Option<String>,
    pub thumbnail_url: Option<String>,
    pub description: Option<String>,
    pub tags: Vec<String>,
}

impl OpportunityRecord {
    pub fn from_parts(stub: &ArticleStub, detail: DetailFields, deadline: Option<String>) -> Self {
        Self {
            title: stub.title.clone(),
            detail_url: stub.detail_url.clone(),
            apply_link: detail.apply_link,
            deadline_raw: detail.deadline_raw,
            deadline,
            thumbnail_url: detail.thumbnail_url,
            description: detail.description,
            tags: detail.tags,
        }
    }

    pub fn dedup_key(&self) -> DedupKey<'_> {
        DedupKey {
            title: &self.title,
            apply_link: &self.apply_link,
        }
    }

    /// True when `apply_link` is present and does not start with `base_url`.
    ///
    /// This is a plain prefix comparison, so an off-site URL that happens to
    /// share the prefix is rejected as well.
    pub fn has_external_link(&self, base_url: &str) -> bool {
        let link = self.apply_link.trim();
        !link.is_empty() && !link.starts_with(base_url)
    }
}

/// Durable row owned by the record store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredOpportunity {
    pub id: Uuid,
    pub title: String,
    pub apply_link: String,
    pub description: Option<String>,
    pub deadline: Option<String>,
    pub thumbnail_url: Option<String>,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub posted: bool,
}

impl StoredOpportunity {
    pub fn from_record(record: &OpportunityRecord, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: record.title.clone(),
            apply_link: record.apply_link.clone(),
            description: record.description.clone(),
            deadline: record.deadline.clone(),
            thumbnail_url: record.thumbnail_url.clone(),
            tags: record.tags.clone(),
            created_at,
            posted: false,
        }
    }

    pub fn dedup_key(&self) -> DedupKey<'_> {
        DedupKey {
            title: &self.title,
            apply_link: &self.apply_link,
        }
    }
}
