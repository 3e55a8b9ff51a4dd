//! Note detail extraction.
//!
//! Every field is resolved through a chain of sources (DOM, social-preview
//! metadata, the embedded `window.__INITIAL_STATE__`); a missing source only
//! leaves its field empty.

use std::collections::HashSet;
use std::sync::LazyLock;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::browser::{BrowserError, BrowserResult, PageDriver};
use crate::comments::{parse_count, Comment, CommentCollector};
use crate::config::CommentSection;
use crate::credentials::CredentialStore;
use crate::dom::{first_attr, first_text, select_all_in, select_first_in, text_of, DomSnapshot};
use crate::login::detect_risk;
use crate::pacing::PacedPage;
use crate::retry::RetryPolicy;

const CONTAINER_SELECTORS: [&str; 4] = [".note-container", ".main-container", "#detail-container", "body"];
// Scoped to the note body; comment blocks inside the container carry
// `.note-text` and `.date` too.
const TITLE_SELECTORS: [&str; 4] = ["#detail-title", ".note-content .title", ".note-detail-title", "h1"];
const DESC_SELECTORS: [&str; 3] = ["#detail-desc", ".note-content .desc", ".note-content .note-text"];
const MEDIA_SELECTORS: [&str; 3] = [".media-container", ".note-slider-img", ".image-container"];
const DATE_SELECTORS: [&str; 4] = [
    ".bottom-container .date",
    ".note-content .date",
    ".publish-date",
    ".bottom-container .time",
];
const AUTHOR_SELECTORS: [&str; 4] = [".author-wrapper .name", ".author-container .name", ".username", ".author-name"];
const AUTHOR_LINK_SELECTORS: [&str; 3] = [
    ".author-container a[href*='/user/profile/']",
    ".author-wrapper a[href*='/user/profile/']",
    "a.name[href*='/user/profile/']",
];
const INTERACT_SELECTORS: [&str; 2] = [".interact-container", ".interaction-container"];
const IMAGE_HOSTS: [&str; 3] = ["xhscdn.com", "sns-img", "sns-web-img"];
const UNAVAILABLE_TEXT: &str = "当前笔记暂时无法浏览";
const TITLE_SUFFIX: &str = " - 小红书";
const STATE_PREFIX: &str = "window.__INITIAL_STATE__=";

static BACKGROUND_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"url\(\s*["']?([^"')]+)["']?\s*\)"#).expect("valid regex"));

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NoteStats {
    pub likes: Option<u64>,
    pub collects: Option<u64>,
    pub comments: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NoteDetail {
    pub note_id: String,
    pub title: Option<String>,
    pub description: Option<String>,
    /// Normalized, deduplicated, in first-seen order.
    pub images: Vec<String>,
    pub comments: Vec<Comment>,
    pub published_at: Option<String>,
    /// Canonical note URL, never carrying the access token.
    pub share_url: String,
    pub author: Option<String>,
    pub author_id: Option<String>,
    pub stats: NoteStats,
    /// The site reports the note as temporarily unavailable.
    #[serde(default)]
    pub unavailable: bool,
}

fn origin(base_url: &str) -> String {
    base_url.trim_end_matches('/').to_string()
}

pub fn share_url(base_url: &str, note_id: &str) -> String {
    format!("{}/explore/{note_id}", origin(base_url))
}

pub fn note_url(base_url: &str, note_id: &str, token: Option<&str>) -> String {
    let base = share_url(base_url, note_id);
    match token.filter(|token| !token.is_empty()) {
        Some(token) => {
            let query = url::form_urlencoded::Serializer::new(String::new())
                .append_pair("xsec_token", token)
                .append_pair("xsec_source", "pc_search")
                .finish();
            format!("{base}?{query}")
        }
        None => base,
    }
}

/// The site bounced us to the explore feed instead of the requested note.
pub fn is_login_wall(url: &str, note_id: &str) -> bool {
    let path = url.split(['?', '#']).next().unwrap_or(url).trim_end_matches('/');
    (path.contains("/explore") && !path.contains(note_id)) || path.contains("/login")
}

/// Structured title element, then `og:title`, then the document title.
pub fn resolve_title(dom: &DomSnapshot, document_title: Option<&str>) -> Option<String> {
    note_container(dom)
        .and_then(|container| first_text(container, &TITLE_SELECTORS))
        .or_else(|| dom.meta_content("og:title"))
        .or_else(|| {
            document_title
                .map(|title| title.replace(TITLE_SUFFIX, "").trim().to_string())
                .filter(|title| !title.is_empty())
        })
}

fn note_container(dom: &DomSnapshot) -> Option<scraper::ElementRef<'_>> {
    dom.select_first(&CONTAINER_SELECTORS)
}

/// `//host/x` becomes `https://host/x`; whitespace is trimmed.
pub fn normalize_image_url(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() || raw.starts_with("data:") {
        return None;
    }
    if let Some(rest) = raw.strip_prefix("//") {
        return Some(format!("https://{rest}"));
    }
    Some(raw.replace("http://", "https://"))
}

fn is_content_image(src: &str, class: &str) -> bool {
    IMAGE_HOSTS.iter().any(|host| src.contains(host))
        && !src.contains("avatar")
        && !src.contains("/head/")
        && !class.contains("logo")
}

/// Keeps the first occurrence of every URL.
pub fn dedup_in_order(urls: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    urls.into_iter().filter(|url| seen.insert(url.clone())).collect()
}

pub fn extract_images(dom: &DomSnapshot) -> Vec<String> {
    let Some(container) = note_container(dom) else {
        return Vec::new();
    };
    let media = select_first_in(container, &MEDIA_SELECTORS).unwrap_or(container);
    let mut found: Vec<String> = select_all_in(media, "img")
        .into_iter()
        .filter_map(|img| {
            let value = img.value();
            let src = ["src", "data-src", "data-original"]
                .iter()
                .find_map(|attr| value.attr(attr).filter(|src| !src.trim().is_empty()))?;
            is_content_image(src, value.attr("class").unwrap_or_default())
                .then(|| normalize_image_url(src))
                .flatten()
        })
        .collect();

    if found.is_empty() {
        found = select_all_in(container, ".swiper-slide")
            .into_iter()
            .filter_map(|slide| slide.value().attr("style"))
            .filter_map(|style| BACKGROUND_URL.captures(style))
            .filter_map(|captures| captures.get(1).and_then(|url| normalize_image_url(url.as_str())))
            .collect();
    }
    dedup_in_order(found)
}

/// Strips the "发布于" / "编辑于" prefixes from a date label.
pub fn clean_date(text: &str) -> Option<String> {
    let cleaned = text.replace("发布于", "").replace("编辑于", "");
    let cleaned = cleaned.trim();
    (!cleaned.is_empty()).then(|| cleaned.to_string())
}

/// Parses `window.__INITIAL_STATE__` out of the page's inline scripts.
pub fn parse_initial_state(dom: &DomSnapshot) -> Option<Value> {
    dom.script_bodies().iter().find_map(|script| {
        let start = script.find(STATE_PREFIX)? + STATE_PREFIX.len();
        let raw = script[start..].trim().trim_end_matches(';');
        let json = raw.replace(":undefined", ":null");
        match serde_json::from_str(&json) {
            Ok(value) => Some(value),
            Err(err) => {
                debug!(error = %err, "initial state is not valid json");
                None
            }
        }
    })
}

/// The note record inside the initial state, keyed by id when possible.
pub fn state_note<'v>(state: &'v Value, note_id: &str) -> Option<&'v Value> {
    let map = state.pointer("/note/noteDetailMap")?.as_object()?;
    map.get(note_id)
        .or_else(|| map.values().next())
        .and_then(|entry| entry.get("note"))
}

fn state_str(note: &Value, pointer: &str) -> Option<String> {
    note.pointer(pointer)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn state_count(note: &Value, pointer: &str) -> Option<u64> {
    match note.pointer(pointer)? {
        Value::Number(number) => number.as_u64(),
        Value::String(text) => parse_count(text),
        _ => None,
    }
}

fn state_images(note: &Value) -> Vec<String> {
    note.get("imageList")
        .and_then(Value::as_array)
        .map(|images| {
            images
                .iter()
                .filter_map(|image| {
                    ["urlDefault", "url", "urlPre"]
                        .iter()
                        .find_map(|key| image.get(key).and_then(Value::as_str))
                        .and_then(normalize_image_url)
                })
                .collect()
        })
        .unwrap_or_default()
}

fn profile_id(href: &str) -> Option<String> {
    href.split("/user/profile/")
        .nth(1)?
        .split(['?', '/', '#'])
        .next()
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

fn interaction_stats(dom: &DomSnapshot) -> NoteStats {
    let mut stats = NoteStats::default();
    if let Some(bar) = dom.select_first(&INTERACT_SELECTORS) {
        stats.likes = first_text(bar, &[".like-wrapper .count"]).and_then(|text| parse_count(&text));
        stats.collects = first_text(bar, &[".collect-wrapper .count"]).and_then(|text| parse_count(&text));
        stats.comments = first_text(bar, &[".chat-wrapper .count"]).and_then(|text| parse_count(&text));
        if stats.likes.is_none() && stats.collects.is_none() {
            let counts: Vec<Option<u64>> = select_all_in(bar, ".interact-item")
                .into_iter()
                .map(|item| first_text(item, &[".count", ".text"]).or_else(|| Some(text_of(item))))
                .map(|text| text.and_then(|text| parse_count(&text)))
                .collect();
            stats.likes = counts.first().copied().flatten();
            stats.collects = counts.get(1).copied().flatten();
        }
    }
    if stats.likes.is_none() {
        stats.likes = dom
            .select_first(&[".like-wrapper .count"])
            .and_then(|element| parse_count(&text_of(element)));
    }
    stats
}

/// Every field of the detail record that the current page can answer,
/// comments excluded.
pub fn extract_fields(
    note_id: &str,
    base_url: &str,
    dom: &DomSnapshot,
    document_title: Option<&str>,
) -> NoteDetail {
    let state = parse_initial_state(dom);
    let note_state = state.as_ref().and_then(|state| state_note(state, note_id));
    let container = note_container(dom);

    let title = resolve_title(dom, document_title)
        .or_else(|| note_state.and_then(|note| state_str(note, "/title")));
    let description = container
        .and_then(|container| first_text(container, &DESC_SELECTORS))
        .or_else(|| note_state.and_then(|note| state_str(note, "/desc")))
        .or_else(|| dom.meta_content("og:description"));

    let mut images = extract_images(dom);
    if images.is_empty() {
        if let Some(note) = note_state {
            images = dedup_in_order(state_images(note));
        }
    }

    let published_at = container
        .and_then(|container| first_text(container, &DATE_SELECTORS))
        .and_then(|text| clean_date(&text))
        .or_else(|| {
            note_state
                .and_then(|note| note.get("time"))
                .and_then(Value::as_i64)
                .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
                .map(|time| time.to_rfc3339())
        });

    let author = container
        .and_then(|container| first_text(container, &AUTHOR_SELECTORS))
        .or_else(|| note_state.and_then(|note| state_str(note, "/user/nickname")));
    let author_id = container
        .and_then(|container| first_attr(container, &AUTHOR_LINK_SELECTORS, "href"))
        .and_then(|href| profile_id(&href))
        .or_else(|| note_state.and_then(|note| state_str(note, "/user/userId")));

    let mut stats = interaction_stats(dom);
    if let Some(note) = note_state {
        stats.likes = stats.likes.or_else(|| state_count(note, "/interactInfo/likedCount"));
        stats.collects = stats.collects.or_else(|| state_count(note, "/interactInfo/collectedCount"));
        stats.comments = stats.comments.or_else(|| state_count(note, "/interactInfo/commentCount"));
    }

    NoteDetail {
        note_id: note_id.to_string(),
        title,
        description,
        images,
        comments: Vec::new(),
        published_at,
        share_url: share_url(base_url, note_id),
        author,
        author_id,
        stats,
        unavailable: false,
    }
}

/// Navigates to one note and assembles its [`NoteDetail`].
pub struct DetailExtractor<'a, D> {
    page: &'a mut PacedPage<D>,
    base_url: &'a str,
    config: &'a CommentSection,
}

impl<'a, D: PageDriver> DetailExtractor<'a, D> {
    pub fn new(page: &'a mut PacedPage<D>, base_url: &'a str, config: &'a CommentSection) -> Self {
        Self {
            page,
            base_url,
            config,
        }
    }

    /// Fails only when the note page cannot be reached or the session is
    /// restricted; partial pages produce partial records.
    pub async fn fetch(
        &mut self,
        store: &CredentialStore,
        note_id: &str,
        token: Option<&str>,
        max_scrolls: Option<usize>,
    ) -> BrowserResult<NoteDetail> {
        let url = note_url(self.base_url, note_id, token);
        info!(note_id, "fetching note detail");
        self.navigate(&url).await?;

        let current = self.page.current_url().await?;
        if is_login_wall(&current, note_id) {
            warn!(note_id, url = %current, "redirected away from note; re-applying credentials");
            if let Some(set) = store.load().await {
                self.page.set_cookies(&set.cookies).await?;
            }
            self.navigate(&url).await?;
            let current = self.page.current_url().await?;
            if is_login_wall(&current, note_id) {
                return Err(BrowserError::LoginRequired(format!(
                    "note {note_id} redirected to {current}"
                )));
            }
        }

        let title = self.page.title().await.ok();
        let mut detail = {
            let dom = self.page.snapshot().await?;
            if dom.body_text().contains(UNAVAILABLE_TEXT) {
                warn!(note_id, "note is temporarily unavailable");
                self.page.metrics_mut().record_note(0);
                return Ok(NoteDetail {
                    note_id: note_id.to_string(),
                    share_url: share_url(self.base_url, note_id),
                    unavailable: true,
                    ..NoteDetail::default()
                });
            }
            extract_fields(note_id, self.base_url, &dom, title.as_deref())
        };

        let mut collector = CommentCollector::new(self.page, self.config);
        match collector.collect(max_scrolls).await {
            Ok(comments) => detail.comments = comments,
            Err(err) if err.is_access_fault() => return Err(err),
            Err(err) => warn!(note_id, error = %err, "comment collection failed; returning note without comments"),
        }

        self.page.metrics_mut().record_note(detail.comments.len());
        info!(
            note_id,
            images = detail.images.len(),
            comments = detail.comments.len(),
            "note detail extracted"
        );
        Ok(detail)
    }

    async fn navigate(&mut self, url: &str) -> BrowserResult<()> {
        let policy = RetryPolicy::fixed(
            self.config.detail_attempts,
            Duration::from_millis(self.config.detail_retry_delay_ms),
        );
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.open(url).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    if !policy.backoff(attempts, &err, "note detail").await {
                        return Err(err);
                    }
                    self.page.metrics_mut().record_retry();
                }
            }
        }
    }

    async fn open(&mut self, url: &str) -> BrowserResult<()> {
        self.page.goto(url).await?;
        let current = self.page.current_url().await?;
        let dom = self.page.snapshot().await?;
        if let Some(risk) = detect_risk(&current, &dom) {
            self.page.metrics_mut().record_risk_detection();
            return Err(risk.into_error());
        }
        Ok(())
    }
}
