//! Telegram channel publisher for stored opportunities.

use std::time::Duration;

use anyhow::Context;
use oppfeed_core::StoredOpportunity;
use oppfeed_store::RecordStore;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "oppfeed-publish";

pub const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

/// Telegram rejects photo captions longer than this many characters.
pub const CAPTION_LIMIT: usize = 1024;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("telegram bot token or channel id is not configured")]
    MissingCredentials,
    #[error("telegram request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("telegram api returned {status}: {body}")]
    Api { status: u16, body: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    pub bot_token: Option<String>,
    pub channel_id: Option<String>,
    pub api_base: String,
    pub join_url: String,
    pub hashtags: String,
    pub timeout_secs: u64,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: None,
            channel_id: None,
            api_base: TELEGRAM_API_BASE.to_string(),
            join_url: "https://t.me/ScholarshipSpot".to_string(),
            hashtags: "#Opportunities #Scholarships #Grants #Education #Career @ScholarshipSpot".to_string(),
            timeout_secs: 30,
        }
    }
}

impl TelegramConfig {
    pub fn from_env() -> Self {
        let non_empty = |key: &str| std::env::var(key).ok().filter(|v| !v.trim().is_empty());
        Self {
            bot_token: non_empty("TELEGRAM_BOT_TOKEN"),
            channel_id: non_empty("TELEGRAM_CHANNEL_ID"),
            ..Self::default()
        }
    }

    pub fn has_credentials(&self) -> bool {
        self.bot_token.is_some() && self.channel_id.is_some()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PublishStats {
    pub attempted: usize,
    pub posted: usize,
    pub failed: usize,
}

pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(ch),
        }
    }
    out
}

fn render_message(title: &str, description: &str, deadline: Option<&str>, config: &TelegramConfig) -> String {
    let title = if title.is_empty() {
        String::new()
    } else {
        format!("<b>{}</b>", escape_html(title))
    };
    let description = escape_html(description);
    let deadline = deadline
        .filter(|d| !d.is_empty())
        .map(|d| format!("\n\n<b>Deadline:</b> {}", escape_html(d)))
        .unwrap_or_default();
    let join_us = format!(
        "\n\n✅ <a href=\"{}\"><b>Join Us</b></a>",
        escape_html(&config.join_url)
    );
    let tags = if config.hashtags.is_empty() {
        String::new()
    } else {
        format!("\n\n{}", config.hashtags)
    };

    format!("{title}\n\n{description}{deadline}{join_us}{tags}")
}

/// Channel post body in Telegram HTML parse mode.
pub fn format_message(opportunity: &StoredOpportunity, config: &TelegramConfig) -> String {
    render_message(
        &opportunity.title,
        opportunity.description.as_deref().unwrap_or_default(),
        opportunity.deadline.as_deref(),
        config,
    )
}

/// Longest prefix of `text` (ellipsized when cut) whose rendering fits the
/// caption limit. Plain text is shortened before escaping, so markup and
/// entities are never split.
fn shorten_to_fit(text: &str, render: impl Fn(&str) -> String) -> Option<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut keep = chars.len();
    loop {
        let candidate = if keep == chars.len() {
            text.to_string()
        } else {
            let mut cut: String = chars[..keep].iter().collect::<String>().trim_end().to_string();
            cut.push('…');
            cut
        };
        let rendered = render(&candidate);
        let len = rendered.chars().count();
        if len <= CAPTION_LIMIT {
            return Some(rendered);
        }
        if keep == 0 {
            return None;
        }
        keep = keep.saturating_sub(len - CAPTION_LIMIT);
    }
}

/// Photo caption within [`CAPTION_LIMIT`]: the description is shortened
/// first, then the title, then the deadline.
pub fn format_caption(opportunity: &StoredOpportunity, config: &TelegramConfig) -> String {
    let title = opportunity.title.as_str();
    let description = opportunity.description.as_deref().unwrap_or_default();
    let deadline = opportunity.deadline.as_deref();

    shorten_to_fit(description, |d| render_message(title, d, deadline, config))
        .or_else(|| shorten_to_fit(title, |t| render_message(t, "", deadline, config)))
        .or_else(|| {
            shorten_to_fit(deadline.unwrap_or_default(), |d| {
                render_message("", "", Some(d), config)
            })
        })
        .unwrap_or_else(|| render_message("", "", None, config))
}

#[derive(Debug, Clone)]
pub struct TelegramPublisher {
    client: reqwest::Client,
    config: TelegramConfig,
}

impl TelegramPublisher {
    pub fn new(config: TelegramConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("building telegram client")?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &TelegramConfig {
        &self.config
    }

    fn credentials(&self) -> Result<(&str, &str), PublishError> {
        match (&self.config.bot_token, &self.config.channel_id) {
            (Some(token), Some(channel)) => Ok((token.as_str(), channel.as_str())),
            _ => Err(PublishError::MissingCredentials),
        }
    }

    /// Send one opportunity: a photo with caption when it has a thumbnail,
    /// otherwise a text message.
    pub async fn send(&self, opportunity: &StoredOpportunity) -> Result<(), PublishError> {
        let (token, channel) = self.credentials()?;
        let api_base = self.config.api_base.trim_end_matches('/');

        let (endpoint, payload) = match opportunity.thumbnail_url.as_deref() {
            Some(photo) if !photo.is_empty() => (
                format!("{api_base}/bot{token}/sendPhoto"),
                json!({
                    "chat_id": channel,
                    "photo": photo,
                    "caption": format_caption(opportunity, &self.config),
                    "parse_mode": "HTML",
                }),
            ),
            _ => (
                format!("{api_base}/bot{token}/sendMessage"),
                json!({
                    "chat_id": channel,
                    "text": format_message(opportunity, &self.config),
                    "parse_mode": "HTML",
                    "disable_web_page_preview": false,
                }),
            ),
        };

        let resp = self.client.post(&endpoint).json(&payload).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(PublishError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }

    /// Post every unposted record, oldest first, marking each posted on
    /// success. Failed posts stay unposted for the next run.
    pub async fn publish_unposted(&self, store: &dyn RecordStore) -> anyhow::Result<PublishStats> {
        let mut stats = PublishStats::default();
        if !self.config.has_credentials() {
            warn!("telegram credentials missing; nothing will be posted");
            return Ok(stats);
        }

        let pending = store
            .list_unposted()
            .await
            .context("listing unposted opportunities")?;

        for opportunity in &pending {
            stats.attempted += 1;
            match self.send(opportunity).await {
                Ok(()) => match store.mark_posted(opportunity.id).await {
                    Ok(()) => {
                        stats.posted += 1;
                        info!(title = %opportunity.title, id = %opportunity.id, "posted to telegram");
                    }
                    Err(err) => {
                        stats.failed += 1;
                        error!(title = %opportunity.title, error = %err, "posted but could not mark as posted");
                    }
                },
                Err(err) => {
                    stats.failed += 1;
                    warn!(title = %opportunity.title, error = %err, "telegram post failed");
                }
            }
        }

        info!(
            attempted = stats.attempted,
            posted = stats.posted,
            failed = stats.failed,
            "publish run finished"
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use oppfeed_core::OpportunityRecord;
    use oppfeed_store::MemoryRecordStore;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn record(title: &str, thumbnail: Option<&str>) -> OpportunityRecord {
        OpportunityRecord {
            title: title.to_string(),
            detail_url: "https://opportunitydesk.org/2025/01/01/x/".into(),
            apply_link: format!("https://apply.example/{}", title.len()),
            deadline_raw: Some("Deadline: March 3, 2025".into()),
            deadline: Some("March 3, 2025".into()),
            thumbnail_url: thumbnail.map(str::to_string),
            description: Some("Funding for researchers.".into()),
            tags: vec!["Grants".into()],
        }
    }

    fn config_for(server: &MockServer) -> TelegramConfig {
        TelegramConfig {
            bot_token: Some("TOKEN".into()),
            channel_id: Some("@channel".into()),
            api_base: server.uri(),
            timeout_secs: 5,
            ..TelegramConfig::default()
        }
    }

    #[test]
    fn message_layout_and_escaping() {
        let stored = StoredOpportunity::from_record(&record("R&D <Fellowship>", None), Utc::now());
        let msg = format_message(&stored, &TelegramConfig::default());
        assert!(msg.starts_with("<b>R&amp;D &lt;Fellowship&gt;</b>\n\nFunding for researchers."));
        assert!(msg.contains("\n\n<b>Deadline:</b> March 3, 2025"));
        assert!(msg.contains("<a href=\"https://t.me/ScholarshipSpot\"><b>Join Us</b></a>"));
        assert!(msg.ends_with("@ScholarshipSpot"));
    }

    #[test]
    fn deadline_line_omitted_when_absent() {
        let mut stored = StoredOpportunity::from_record(&record("A", None), Utc::now());
        stored.deadline = None;
        assert!(!format_message(&stored, &TelegramConfig::default()).contains("Deadline:"));
    }

    fn assert_well_formed(caption: &str) {
        assert!(caption.chars().count() <= CAPTION_LIMIT, "caption too long");
        assert_eq!(caption.matches("<b>").count(), caption.matches("</b>").count());
        assert_eq!(caption.matches("<a ").count(), caption.matches("</a>").count());
        for (idx, _) in caption.match_indices('&') {
            let rest = &caption[idx..];
            assert!(
                ["&amp;", "&lt;", "&gt;", "&quot;"].iter().any(|e| rest.starts_with(e)),
                "broken entity at {idx}"
            );
        }
        assert!(caption.ends_with("@ScholarshipSpot"));
    }

    #[test]
    fn short_caption_is_the_full_message() {
        let stored = StoredOpportunity::from_record(&record("A", Some("https://img.example/a.jpg")), Utc::now());
        let config = TelegramConfig::default();
        assert_eq!(format_caption(&stored, &config), format_message(&stored, &config));
    }

    #[test]
    fn long_description_is_shortened_before_escaping() {
        let mut stored = StoredOpportunity::from_record(&record("Grant", Some("https://img.example/a.jpg")), Utc::now());
        stored.description = Some(format!("{} R&D", "x".repeat(996)));
        let caption = format_caption(&stored, &TelegramConfig::default());
        assert_well_formed(&caption);
        assert!(caption.contains("<b>Deadline:</b> March 3, 2025"));
        assert!(caption.contains('…'));
        assert!(caption.starts_with("<b>Grant</b>"));
    }

    #[test]
    fn oversized_title_is_shortened_when_description_is_not_enough() {
        let mut stored = StoredOpportunity::from_record(&record("T", Some("https://img.example/a.jpg")), Utc::now());
        stored.title = "<&>".repeat(500);
        let caption = format_caption(&stored, &TelegramConfig::default());
        assert_well_formed(&caption);
        assert!(caption.contains("Join Us"));
    }

    #[tokio::test]
    async fn posts_and_marks_posted() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/botTOKEN/sendMessage"))
            .and(body_partial_json(json!({"chat_id": "@channel", "parse_mode": "HTML"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/botTOKEN/sendPhoto"))
            .and(body_partial_json(json!({"photo": "https://img.example/a.jpg"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        let store = MemoryRecordStore::new();
        store.create(&record("Text only", None)).await.unwrap();
        store
            .create(&record("With image", Some("https://img.example/a.jpg")))
            .await
            .unwrap();

        let publisher = TelegramPublisher::new(config_for(&server)).unwrap();
        let stats = publisher.publish_unposted(&store).await.unwrap();
        assert_eq!(stats.posted, 2);
        assert!(store.list_unposted().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn api_error_leaves_record_unposted() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/botTOKEN/sendMessage"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "ok": false,
                "description": "Bad Request: chat not found"
            })))
            .mount(&server)
            .await;

        let store = MemoryRecordStore::new();
        store.create(&record("Stays", None)).await.unwrap();

        let publisher = TelegramPublisher::new(config_for(&server)).unwrap();
        let stats = publisher.publish_unposted(&store).await.unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(store.list_unposted().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_credentials_posts_nothing() {
        let store = MemoryRecordStore::new();
        store.create(&record("Waiting", None)).await.unwrap();
        let publisher = TelegramPublisher::new(TelegramConfig::default()).unwrap();
        let stats = publisher.publish_unposted(&store).await.unwrap();
        assert_eq!(stats, PublishStats::default());

        let pending = store.list_unposted().await.unwrap();
        assert!(matches!(
            publisher.send(&pending[0]).await,
            Err(PublishError::MissingCredentials)
        ));
    }
}
