//! Listing/detail page extraction and deadline normalization.
//!
//! Each detail field is resolved by an ordered list of [`ScalarRule`]s; the
//! first rule producing a value wins. Rules are plain data so they can be
//! loaded from configuration and tested one at a time.

use once_cell::sync::Lazy;
use oppfeed_core::{ArticleStub, DetailFields};
use regex::{Regex, RegexBuilder};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

pub const CRATE_NAME: &str = "oppfeed-adapters";

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("invalid selector `{selector}`: {message}")]
    Selector { selector: String, message: String },
    #[error("invalid pattern `{pattern}`: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScalarRule {
    /// First link inside a paragraph whose text contains one of `phrases`.
    LinkInPhraseParagraph { phrases: Vec<String> },
    /// First link inside a paragraph whose bold text contains `label`.
    LinkInLabelledParagraph { label: String },
    /// Paragraph text following a bold `label`.
    LabelledText { label: String },
    /// Attribute of the first element matching `selector`, resolved as a URL.
    FirstAttr { selector: String, attr: String },
    /// The first `count` direct `<p>` children of `container`, joined by a
    /// space, with `strip_pattern` removed.
    LeadingParagraphs {
        container: String,
        count: usize,
        #[serde(default)]
        strip_pattern: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionRules {
    pub article_container: String,
    pub title_link: String,
    pub apply_link: Vec<ScalarRule>,
    pub deadline: Vec<ScalarRule>,
    pub thumbnail: Vec<ScalarRule>,
    pub description: Vec<ScalarRule>,
    pub tag_selectors: Vec<String>,
}

impl Default for ExtractionRules {
    fn default() -> Self {
        Self {
            article_container: "article".to_string(),
            title_link: "a[href]".to_string(),
            apply_link: vec![
                ScalarRule::LinkInPhraseParagraph {
                    phrases: vec![
                        "for more information".to_string(),
                        "apply here".to_string(),
                        "apply now".to_string(),
                    ],
                },
                ScalarRule::LinkInLabelledParagraph {
                    label: "deadline:".to_string(),
                },
            ],
            deadline: vec![ScalarRule::LabelledText {
                label: "deadline:".to_string(),
            }],
            thumbnail: vec![ScalarRule::FirstAttr {
                selector: "figure.image-link img[src]".to_string(),
                attr: "src".to_string(),
            }],
            description: vec![ScalarRule::LeadingParagraphs {
                container: "div.entry-content".to_string(),
                count: 2,
                strip_pattern: Some(r"(?i)^deadline:\s*[^.]*\.?\s*".to_string()),
            }],
            tag_selectors: vec![r#"a[rel~="category"][rel~="tag"]"#.to_string()],
        }
    }
}

impl ExtractionRules {
    /// Compile every selector and pattern once so bad configuration fails at
    /// start-up rather than silently on each page.
    pub fn validate(&self) -> Result<(), ExtractError> {
        selector(&self.article_container)?;
        selector(&self.title_link)?;
        for tag in &self.tag_selectors {
            selector(tag)?;
        }
        for rule in self
            .apply_link
            .iter()
            .chain(&self.deadline)
            .chain(&self.thumbnail)
            .chain(&self.description)
        {
            match rule {
                ScalarRule::FirstAttr { selector: s, .. } => {
                    selector(s)?;
                }
                ScalarRule::LeadingParagraphs {
                    container,
                    strip_pattern,
                    ..
                } => {
                    selector(container)?;
                    if let Some(p) = strip_pattern {
                        pattern(p)?;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}

fn selector(css: &str) -> Result<Selector, ExtractError> {
    Selector::parse(css).map_err(|e| ExtractError::Selector {
        selector: css.to_string(),
        message: e.to_string(),
    })
}

fn pattern(source: &str) -> Result<Regex, ExtractError> {
    Regex::new(source).map_err(|source_err| ExtractError::Pattern {
        pattern: source.to_string(),
        source: source_err,
    })
}

static PARAGRAPH: Lazy<Selector> = Lazy::new(|| Selector::parse("p").expect("static selector"));
static LINK: Lazy<Selector> = Lazy::new(|| Selector::parse("a[href]").expect("static selector"));
static BOLD: Lazy<Selector> = Lazy::new(|| Selector::parse("strong, b").expect("static selector"));

/// Concatenated text of an element with whitespace runs collapsed.
fn element_text(el: ElementRef<'_>) -> String {
    el.text()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Absolute hrefs are returned verbatim; only relative ones are joined.
pub fn resolve_url(page_url: &str, href: &str) -> String {
    if Url::parse(href).is_ok() {
        return href.to_string();
    }
    Url::parse(page_url)
        .and_then(|base| base.join(href))
        .map(|u| u.to_string())
        .unwrap_or_else(|_| href.to_string())
}

fn first_href(el: ElementRef<'_>, page_url: &str) -> Option<String> {
    el.select(&LINK)
        .filter_map(|a| a.value().attr("href"))
        .find_map(|href| non_empty(href.to_string()))
        .map(|href| resolve_url(page_url, &href))
}

fn has_bold_label(paragraph: ElementRef<'_>, label: &str) -> bool {
    paragraph
        .select(&BOLD)
        .any(|b| element_text(b).to_lowercase().contains(label))
}

impl ScalarRule {
    pub fn apply(&self, document: &Html, page_url: &str) -> Result<Option<String>, ExtractError> {
        match self {
            ScalarRule::LinkInPhraseParagraph { phrases } => {
                let phrases: Vec<String> = phrases.iter().map(|p| p.to_lowercase()).collect();
                Ok(document
                    .select(&PARAGRAPH)
                    .filter(|p| {
                        let text = element_text(*p).to_lowercase();
                        phrases.iter().any(|phrase| text.contains(phrase))
                    })
                    .find_map(|p| first_href(p, page_url)))
            }
            ScalarRule::LinkInLabelledParagraph { label } => {
                let label = label.to_lowercase();
                Ok(document
                    .select(&PARAGRAPH)
                    .filter(|p| has_bold_label(*p, &label))
                    .find_map(|p| first_href(p, page_url)))
            }
            ScalarRule::LabelledText { label } => {
                let label = label.to_lowercase();
                Ok(document
                    .select(&PARAGRAPH)
                    .filter(|p| has_bold_label(*p, &label))
                    .find_map(|p| text_after_label(&element_text(p), &label)))
            }
            ScalarRule::FirstAttr { selector: css, attr } => {
                let sel = selector(css)?;
                Ok(document
                    .select(&sel)
                    .filter_map(|el| el.value().attr(attr))
                    .find_map(|v| non_empty(v.to_string()))
                    .map(|v| resolve_url(page_url, &v)))
            }
            ScalarRule::LeadingParagraphs {
                container,
                count,
                strip_pattern,
            } => {
                let sel = selector(container)?;
                let Some(root) = document.select(&sel).next() else {
                    return Ok(None);
                };
                let joined = root
                    .children()
                    .filter_map(ElementRef::wrap)
                    .filter(|el| el.value().name() == "p")
                    .take(*count)
                    .map(element_text)
                    .collect::<Vec<_>>()
                    .join(" ");
                let stripped = match strip_pattern {
                    Some(p) => pattern(p)?.replace(&joined, "").into_owned(),
                    None => joined,
                };
                Ok(non_empty(stripped))
            }
        }
    }
}

/// Text after the first case-insensitive occurrence of `label`.
fn text_after_label(text: &str, label: &str) -> Option<String> {
    let lower = text.to_lowercase();
    let idx = lower.find(label)?;
    // lowercasing can shift byte offsets for some scripts; bail out instead of
    // slicing mid-character
    let rest = text.get(idx + label.len()..)?;
    non_empty(rest.to_string())
}

fn first_match(
    field: &'static str,
    rules: &[ScalarRule],
    document: &Html,
    page_url: &str,
) -> Option<String> {
    for (idx, rule) in rules.iter().enumerate() {
        match rule.apply(document, page_url) {
            Ok(Some(value)) => {
                debug!(field, rule = idx, "field extracted");
                return Some(value);
            }
            Ok(None) => {}
            Err(err) => warn!(field, rule = idx, error = %err, "extraction rule failed"),
        }
    }
    None
}

/// Article stubs in page order. Containers without a usable title link are
/// logged and skipped.
pub fn parse_listing(body: &str, page_url: &str, rules: &ExtractionRules) -> Result<Vec<ArticleStub>, ExtractError> {
    let document = Html::parse_document(body);
    let container = selector(&rules.article_container)?;
    let title_link = selector(&rules.title_link)?;

    let mut stubs = Vec::new();
    for (idx, article) in document.select(&container).enumerate() {
        let position = idx + 1;
        let found = article.select(&title_link).find_map(|a| {
            let title = non_empty(element_text(a))?;
            let href = non_empty(a.value().attr("href")?.to_string())?;
            Some((title, href))
        });
        match found {
            Some((title, href)) => stubs.push(ArticleStub {
                position,
                title,
                detail_url: resolve_url(page_url, &href),
            }),
            None => warn!(position, "no title link in article; skipping"),
        }
    }
    Ok(stubs)
}

/// Best-effort detail extraction. A missing field never blocks the others;
/// without any apply link the page's own URL is used.
pub fn extract_detail(body: &str, page_url: &str, rules: &ExtractionRules) -> DetailFields {
    let document = Html::parse_document(body);

    let apply_link = first_match("apply_link", &rules.apply_link, &document, page_url);
    let deadline_raw = first_match("deadline", &rules.deadline, &document, page_url);
    let thumbnail_url = first_match("thumbnail", &rules.thumbnail, &document, page_url);
    let description = first_match("description", &rules.description, &document, page_url);

    let mut tags = Vec::new();
    for css in &rules.tag_selectors {
        match selector(css) {
            Ok(sel) => tags.extend(document.select(&sel).filter_map(|a| non_empty(element_text(a)))),
            Err(err) => warn!(field = "tags", error = %err, "extraction rule failed"),
        }
    }

    DetailFields {
        apply_link_is_fallback: apply_link.is_none(),
        apply_link: apply_link.unwrap_or_else(|| page_url.to_string()),
        deadline_raw,
        thumbnail_url,
        description,
        tags,
    }
}

const MONTHS: &str = "January|February|March|April|May|June|July|August|September|October|November|December";

static DEADLINE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        format!(r"\d{{1,2}}(?:st|nd|rd|th)?\s+(?:{MONTHS}),?\s+\d{{4}}"),
        format!(r"(?:{MONTHS})\s+\d{{1,2}}(?:st|nd|rd|th)?,?\s+\d{{4}}"),
        r"\d{1,2}/\d{1,2}/\d{4}".to_string(),
        r"\d{4}-\d{2}-\d{2}".to_string(),
    ]
    .iter()
    .map(|p| {
        RegexBuilder::new(p)
            .case_insensitive(true)
            .build()
            .expect("static deadline pattern")
    })
    .collect()
});

/// First date-shaped substring of `raw`, tried pattern by pattern in order;
/// the raw text unchanged when nothing matches.
pub fn normalize_deadline(raw: Option<&str>) -> Option<String> {
    let raw = raw?;
    for re in DEADLINE_PATTERNS.iter() {
        if let Some(m) = re.find(raw) {
            return Some(m.as_str().to_string());
        }
    }
    Some(raw.to_string())
}
