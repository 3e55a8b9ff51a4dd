use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::browser::{BrowserError, BrowserResult, PageDriver, ScrollTarget};
use crate::config::SearchSection;
use crate::dom::{css_path, DomSnapshot};
use crate::login::{detect_risk, LoginGate};
use crate::pacing::PacedPage;
use crate::retry::RetryPolicy;

const FILTER_MENU_SELECTORS: [&str; 4] = [".graphic-filter", ".filter-btn", ".filter-box", ".filter"];
const FILTER_MENU_TEXT: &str = "筛选";
const END_MARKER_SELECTORS: [&str; 1] = [".end-container"];
const END_MARKER_TEXTS: [&str; 4] = ["THE END", "没有更多内容", "没有更多了", "到底了"];
const NEXT_BUTTON_TEXT: &str = "下一页";
const NEXT_BUTTON_SELECTORS: [&str; 3] = [".btn-next", ".pagination-next", "[aria-label=\"下一页\"]"];
/// Scroll height growth at or below this means nothing new was loaded.
const MIN_SCROLL_GROWTH_PX: f64 = 120.0;
/// Consecutive lost pages after which the run is treated as exhausted.
const MAX_CONSECUTIVE_SKIPS: u32 = 2;
/// Manual resolutions allowed before a page is loaded again.
const MAX_RECOVERIES_PER_PAGE: u32 = 2;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortMode {
    #[default]
    General,
    Popularity,
    Recency,
}

impl SortMode {
    fn url_value(self) -> Option<&'static str> {
        match self {
            SortMode::General => None,
            SortMode::Popularity => Some("popularity_desc"),
            SortMode::Recency => Some("time_desc"),
        }
    }
}

impl fmt::Display for SortMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SortMode::General => "general",
            SortMode::Popularity => "popularity",
            SortMode::Recency => "recency",
        };
        f.write_str(label)
    }
}

impl std::str::FromStr for SortMode {
    type Err = BrowserError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_lowercase().as_str() {
            "general" | "" => Ok(SortMode::General),
            "popularity" | "popularity_desc" | "hot" => Ok(SortMode::Popularity),
            "recency" | "time_desc" | "latest" => Ok(SortMode::Recency),
            other => Err(BrowserError::Configuration(format!("invalid sort mode: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeRange {
    #[default]
    All,
    Day,
    Week,
    HalfYear,
}

impl TimeRange {
    fn publish_time_type(self) -> Option<u8> {
        match self {
            TimeRange::All => None,
            TimeRange::Day => Some(1),
            TimeRange::Week => Some(2),
            TimeRange::HalfYear => Some(4),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchScope {
    #[default]
    All,
    Viewed,
    Unviewed,
    Followed,
}

impl SearchScope {
    fn labels(self) -> &'static [&'static str] {
        match self {
            SearchScope::All => &[],
            SearchScope::Viewed => &["已看过"],
            SearchScope::Unviewed => &["未看过"],
            SearchScope::Followed => &["已关注"],
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Distance {
    #[default]
    All,
    SameCity,
    Nearby,
}

impl Distance {
    fn labels(self) -> &'static [&'static str] {
        match self {
            Distance::All => &[],
            Distance::SameCity => &["同城"],
            Distance::Nearby => &["附近"],
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoteTypeFilter {
    #[default]
    All,
    Video,
    Image,
}

impl NoteTypeFilter {
    fn note_type(self) -> Option<u8> {
        match self {
            NoteTypeFilter::All => None,
            NoteTypeFilter::Video => Some(1),
            NoteTypeFilter::Image => Some(2),
        }
    }

    /// Client-side check against `note_card.type`; cards without a type pass.
    pub fn accepts(self, card_type: Option<&str>) -> bool {
        match (self, card_type) {
            (NoteTypeFilter::All, _) | (_, None) => true,
            (NoteTypeFilter::Video, Some(kind)) => kind == "video",
            (NoteTypeFilter::Image, Some(kind)) => kind != "video",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub keyword: String,
    #[serde(default = "first_page")]
    pub start_page: u32,
    #[serde(default)]
    pub sort: SortMode,
    #[serde(default)]
    pub time_range: TimeRange,
    #[serde(default)]
    pub scope: SearchScope,
    #[serde(default)]
    pub distance: Distance,
    #[serde(default)]
    pub note_type: NoteTypeFilter,
}

fn first_page() -> u32 {
    1
}

impl SearchQuery {
    pub fn new(keyword: impl Into<String>) -> Self {
        Self {
            keyword: keyword.into(),
            start_page: 1,
            sort: SortMode::default(),
            time_range: TimeRange::default(),
            scope: SearchScope::default(),
            distance: Distance::default(),
            note_type: NoteTypeFilter::default(),
        }
    }

    pub fn start_page(mut self, page: u32) -> Self {
        self.start_page = page.max(1);
        self
    }

    pub fn sort(mut self, sort: SortMode) -> Self {
        self.sort = sort;
        self
    }

    pub fn time_range(mut self, range: TimeRange) -> Self {
        self.time_range = range;
        self
    }

    pub fn scope(mut self, scope: SearchScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn distance(mut self, distance: Distance) -> Self {
        self.distance = distance;
        self
    }

    pub fn note_type(mut self, note_type: NoteTypeFilter) -> Self {
        self.note_type = note_type;
        self
    }

    /// Filters the search URL cannot carry; sort and time range travel in the URL.
    fn ui_filters(&self) -> Vec<(&'static str, &'static [&'static str])> {
        [
            ("scope", self.scope.labels()),
            ("distance", self.distance.labels()),
        ]
        .into_iter()
        .filter(|(_, labels)| !labels.is_empty())
        .collect()
    }
}

pub fn build_search_url(base_url: &str, query: &SearchQuery) -> String {
    let keyword: String = url::form_urlencoded::byte_serialize(query.keyword.trim().as_bytes()).collect();
    let mut url = format!(
        "{}/search_result?keyword={keyword}&source=web_search_result_notes",
        base_url.trim_end_matches('/')
    );
    if let Some(sort) = query.sort.url_value() {
        url.push_str(&format!("&sort={sort}"));
    }
    if let Some(kind) = query.time_range.publish_time_type() {
        url.push_str(&format!("&publishTimeType={kind}"));
    }
    if let Some(kind) = query.note_type.note_type() {
        url.push_str(&format!("&noteType={kind}"));
    }
    url
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    /// The notes search API; its responses define a page.
    Primary,
    /// Proto proxy responses that sometimes carry the same list.
    Auxiliary,
}

pub fn classify_endpoint(url: &str) -> Option<EndpointKind> {
    if url.contains("search/notes") {
        return Some(EndpointKind::Primary);
    }
    if url.contains("json-to-proto") {
        return Some(EndpointKind::Auxiliary);
    }
    let unrelated = ["search/recommend", "search/hot", "search/trending", "search/onebox", "search/filter"];
    if url.contains("api/sns/web") && url.contains("search") && !unrelated.iter().any(|part| url.contains(part)) {
        return Some(EndpointKind::Primary);
    }
    None
}

pub fn is_search_endpoint(url: &str) -> bool {
    classify_endpoint(url).is_some()
}

/// One intercepted search response.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchPage {
    pub items: Vec<Value>,
    pub has_more: Option<bool>,
}

pub fn parse_search_response(body: &str) -> BrowserResult<SearchPage> {
    let root: Value = serde_json::from_str(body)
        .map_err(|err| BrowserError::Malformed(format!("search response is not json: {err}")))?;
    if let Value::Array(items) = root {
        return Ok(SearchPage {
            items,
            has_more: None,
        });
    }
    let code = root.get("code").and_then(|code| {
        code.as_i64()
            .map(|code| code.to_string())
            .or_else(|| code.as_str().map(str::to_string))
    });
    if code.as_deref() == Some("300013") {
        return Err(BrowserError::RiskRestricted {
            code: "300013".into(),
            message: root
                .get("msg")
                .and_then(Value::as_str)
                .unwrap_or("访问频次异常")
                .to_string(),
        });
    }
    if root.get("success").and_then(Value::as_bool) == Some(false) {
        return Err(BrowserError::Malformed(format!(
            "search api reported failure: code={}",
            code.unwrap_or_default()
        )));
    }
    match root.get("data") {
        Some(Value::Array(items)) => Ok(SearchPage {
            items: items.clone(),
            has_more: None,
        }),
        Some(Value::Object(data)) => Ok(SearchPage {
            items: data
                .get("items")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
            has_more: data.get("has_more").and_then(Value::as_bool),
        }),
        _ => Err(BrowserError::Malformed("search response has no data block".into())),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResultItem {
    pub note_id: String,
    pub xsec_token: Option<String>,
    /// Page the item was observed on; not part of the site's payload.
    pub page: u32,
    pub card: Value,
}

impl SearchResultItem {
    /// `None` for non-note entries (ads, hot queries) and entries without an id.
    pub fn from_raw(raw: Value, page: u32, filter: NoteTypeFilter) -> Option<Self> {
        if let Some(model_type) = raw.get("model_type").and_then(Value::as_str) {
            if model_type != "note" {
                return None;
            }
        }
        let card_type = raw
            .get("note_card")
            .and_then(|card| card.get("type"))
            .and_then(Value::as_str);
        if !filter.accepts(card_type) {
            trace!(card_type, "dropping item excluded by type filter");
            return None;
        }
        let note_id = raw
            .get("id")
            .or_else(|| raw.get("note_id"))
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())?
            .to_string();
        let xsec_token = raw
            .get("xsec_token")
            .and_then(Value::as_str)
            .map(str::to_string);
        Some(Self {
            note_id,
            xsec_token,
            page,
            card: raw,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PagerState {
    NotStarted,
    Running,
    /// An access fault was resolved; the search is reopened after the last loaded page.
    Resuming,
    Finished,
}

#[derive(Debug)]
enum PageOutcome {
    Items { count: usize, last: bool },
    Empty,
    Missing(BrowserError),
}

#[derive(Debug, PartialEq, Eq)]
enum Turn {
    Advanced,
    End,
}

/// Pull-based, cancellable sequence of search results; one page per pull.
pub struct SearchPager<'a, D> {
    page: &'a mut PacedPage<D>,
    gate: Option<LoginGate<'a>>,
    config: SearchSection,
    query: SearchQuery,
    stop: CancellationToken,
    buffer: VecDeque<SearchResultItem>,
    state: PagerState,
    current_page: u32,
    loaded_page: u32,
    consecutive_skips: u32,
    recoveries: u32,
}

impl<'a, D: PageDriver> SearchPager<'a, D> {
    pub fn new(
        page: &'a mut PacedPage<D>,
        config: SearchSection,
        query: SearchQuery,
        stop: CancellationToken,
    ) -> Self {
        Self {
            page,
            gate: None,
            config,
            query,
            stop,
            buffer: VecDeque::new(),
            state: PagerState::NotStarted,
            current_page: 0,
            loaded_page: 0,
            consecutive_skips: 0,
            recoveries: 0,
        }
    }

    /// Access faults go to the login machine instead of ending the run.
    pub fn with_gate(mut self, gate: LoginGate<'a>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn query(&self) -> &SearchQuery {
        &self.query
    }

    /// Page currently being yielded (0 before the first page loads).
    pub fn current_page(&self) -> u32 {
        self.current_page
    }

    pub fn is_finished(&self) -> bool {
        self.state == PagerState::Finished && self.buffer.is_empty()
    }

    /// Cancelling it lets the pager finish the current page, then end.
    pub fn stop_handle(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub async fn next(&mut self) -> BrowserResult<Option<SearchResultItem>> {
        loop {
            if let Some(item) = self.buffer.pop_front() {
                return Ok(Some(item));
            }
            if self.state == PagerState::Finished {
                return Ok(None);
            }
            if self.stop.is_cancelled() {
                info!(page = self.current_page, "search stopped by caller");
                self.state = PagerState::Finished;
                return Ok(None);
            }
            match self.advance().await {
                Ok(()) => {}
                Err(err) if err.is_access_fault() => {
                    if let Err(err) = self.recover(err).await {
                        self.state = PagerState::Finished;
                        return Err(err);
                    }
                    self.state = PagerState::Resuming;
                }
                Err(err) => {
                    self.state = PagerState::Finished;
                    return Err(err);
                }
            }
        }
    }

    async fn recover(&mut self, fault: BrowserError) -> BrowserResult<()> {
        let Some(gate) = self.gate.as_mut() else {
            return Err(fault);
        };
        if self.recoveries >= MAX_RECOVERIES_PER_PAGE {
            warn!(page = self.current_page, error = %fault, "access fault persists after manual resolution");
            gate.login.mark_fault(&fault);
            return Err(fault);
        }
        self.recoveries += 1;
        gate.recover(self.page, fault).await?;
        info!(page = self.loaded_page + 1, "access restored; resuming search");
        Ok(())
    }

    pub fn into_stream(self) -> impl Stream<Item = BrowserResult<SearchResultItem>> + 'a
    where
        D: 'a,
    {
        stream::unfold(self, |mut pager| async move {
            match pager.next().await {
                Ok(Some(item)) => Some((Ok(item), pager)),
                Ok(None) => None,
                Err(err) => Some((Err(err), pager)),
            }
        })
    }

    async fn advance(&mut self) -> BrowserResult<()> {
        match self.state {
            PagerState::NotStarted => return self.open_at(self.query.start_page).await,
            PagerState::Resuming => {
                let target = self.query.start_page.max(self.loaded_page + 1);
                return self.open_at(target).await;
            }
            PagerState::Running | PagerState::Finished => {}
        }

        self.rest_between_pages().await?;
        if self.stop.is_cancelled() {
            self.state = PagerState::Finished;
            return Ok(());
        }
        if self.turn_page().await? == Turn::End {
            info!(page = self.current_page, "end of search results");
            self.state = PagerState::Finished;
            return Ok(());
        }
        self.current_page += 1;
        self.load_current().await
    }

    /// Opens the search and advances through earlier pages without yielding them.
    async fn open_at(&mut self, target: u32) -> BrowserResult<()> {
        self.start().await?;
        self.state = PagerState::Running;
        self.current_page = 1;
        while self.current_page < target {
            self.collect_page(false).await?;
            if self.turn_page().await? == Turn::End {
                info!(page = self.current_page, target, "results ended before target page");
                self.state = PagerState::Finished;
                return Ok(());
            }
            self.current_page += 1;
        }
        self.load_current().await
    }

    async fn start(&mut self) -> BrowserResult<()> {
        let url = build_search_url(&self.config.base_url, &self.query);
        info!(
            keyword = %self.query.keyword,
            start_page = self.query.start_page,
            sort = %self.query.sort,
            "starting search"
        );
        let policy = RetryPolicy::fixed(
            self.config.start_attempts,
            Duration::from_millis(self.config.start_retry_delay_ms),
        );
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.open_search(&url).await {
                Ok(()) => break,
                Err(err) => {
                    if !policy.backoff(attempts, &err, "search start").await {
                        return Err(err);
                    }
                    self.page.metrics_mut().record_retry();
                }
            }
        }
        self.apply_ui_filters().await?;
        self.page.governor().warm_up().await;
        Ok(())
    }

    async fn open_search(&mut self, url: &str) -> BrowserResult<()> {
        self.page.drain_responses().await?;
        self.page.goto(url).await?;
        let current = self.page.current_url().await?;
        let dom = self.page.snapshot().await?;
        if let Some(risk) = detect_risk(&current, &dom) {
            self.page.metrics_mut().record_risk_detection();
            return Err(risk.into_error());
        }
        Ok(())
    }

    async fn apply_ui_filters(&mut self) -> BrowserResult<()> {
        for (name, labels) in self.query.ui_filters() {
            if !self.click_filter_option(labels).await? {
                warn!(filter = name, ?labels, "filter option not found; continuing without it");
            }
        }
        Ok(())
    }

    async fn click_filter_option(&mut self, labels: &[&str]) -> BrowserResult<bool> {
        if self.click_first_label(labels).await? {
            return Ok(true);
        }
        let menu = {
            let dom = self.page.snapshot().await?;
            dom.select_first(&FILTER_MENU_SELECTORS)
                .or_else(|| dom.find_by_exact_text("body", FILTER_MENU_TEXT))
                .map(css_path)
        };
        let Some(menu) = menu else {
            return Ok(false);
        };
        if !self.page.click(&menu).await? {
            return Ok(false);
        }
        self.settle().await;
        self.click_first_label(labels).await
    }

    async fn click_first_label(&mut self, labels: &[&str]) -> BrowserResult<bool> {
        let target = {
            let dom = self.page.snapshot().await?;
            labels
                .iter()
                .find_map(|label| dom.find_by_exact_text("body", label).map(|el| (*label, css_path(el))))
        };
        let Some((label, selector)) = target else {
            return Ok(false);
        };
        // The filtered list arrives as a fresh response; stale pages go first.
        self.page.drain_responses().await?;
        let clicked = self.page.click(&selector).await?;
        if clicked {
            debug!(label, "applied search filter");
            self.settle().await;
        }
        Ok(clicked)
    }

    /// Loads the current page into the buffer, re-triggering it on misses.
    async fn load_current(&mut self) -> BrowserResult<()> {
        let mut retries = 0;
        loop {
            match self.collect_page(true).await? {
                PageOutcome::Items { count, last } => {
                    self.consecutive_skips = 0;
                    self.recoveries = 0;
                    self.loaded_page = self.current_page;
                    self.page.metrics_mut().record_page(count);
                    info!(page = self.current_page, count, "search page captured");
                    if last {
                        info!(page = self.current_page, "search api reports no more results");
                        self.state = PagerState::Finished;
                    }
                    return Ok(());
                }
                PageOutcome::Empty => {
                    info!(page = self.current_page, "empty search page, ending");
                    self.state = PagerState::Finished;
                    return Ok(());
                }
                PageOutcome::Missing(err) => {
                    if retries >= self.config.max_page_retries {
                        warn!(page = self.current_page, error = %err, "skipping search page after retries");
                        self.page.metrics_mut().record_page_skipped();
                        self.loaded_page = self.current_page;
                        self.consecutive_skips += 1;
                        if self.consecutive_skips >= MAX_CONSECUTIVE_SKIPS {
                            warn!(page = self.current_page, "repeated lost pages, ending search");
                            self.state = PagerState::Finished;
                        }
                        return Ok(());
                    }
                    retries += 1;
                    self.page.metrics_mut().record_retry();
                    debug!(page = self.current_page, retries, error = %err, "re-triggering search page");
                    self.retrigger().await?;
                }
            }
        }
    }

    async fn retrigger(&mut self) -> BrowserResult<()> {
        self.page.drain_responses().await?;
        if self.current_page <= 1 {
            self.page.reload().await
        } else {
            let back = self.page.governor().between(200.0, 500.0);
            self.page.scroll(&ScrollTarget::Window, -back).await?;
            self.page.scroll_to_bottom(&ScrollTarget::Window).await
        }
    }

    async fn collect_page(&mut self, keep: bool) -> BrowserResult<PageOutcome> {
        let deadline = Instant::now() + Duration::from_secs(self.config.page_wait_seconds);
        let poll = Duration::from_millis(self.config.poll_timeout_ms.max(1));
        let settle = Duration::from_millis(self.config.response_settle_ms);
        let mut first_data: Option<Instant> = None;
        let mut saw_empty = false;
        let mut count = 0;
        let mut last = false;
        let mut malformed: Option<BrowserError> = None;

        loop {
            let now = Instant::now();
            if let Some(first) = first_data {
                if now.duration_since(first) >= settle {
                    break;
                }
            }
            if now >= deadline {
                break;
            }
            let wait = poll.min(deadline - now);
            let Some(response) = self.page.next_response(wait).await? else {
                if first_data.is_some() && settle.is_zero() {
                    break;
                }
                continue;
            };
            let Some(kind) = classify_endpoint(&response.url) else {
                trace!(url = %response.url, "ignoring captured response");
                continue;
            };
            let parsed = match parse_search_response(&response.body) {
                Ok(parsed) => parsed,
                Err(err) if err.is_access_fault() => {
                    self.page.metrics_mut().record_risk_detection();
                    return Err(err);
                }
                Err(err) => {
                    if kind == EndpointKind::Primary {
                        debug!(url = %response.url, error = %err, "malformed search response");
                        malformed = Some(err);
                    }
                    continue;
                }
            };
            if parsed.items.is_empty() {
                if kind == EndpointKind::Primary && first_data.is_none() {
                    saw_empty = true;
                    break;
                }
                continue;
            }
            first_data.get_or_insert_with(Instant::now);
            if parsed.has_more == Some(false) {
                last = true;
            }
            for raw in parsed.items {
                if let Some(item) = SearchResultItem::from_raw(raw, self.current_page, self.query.note_type) {
                    count += 1;
                    if keep {
                        self.buffer.push_back(item);
                    }
                }
            }
        }

        Ok(if first_data.is_some() {
            PageOutcome::Items { count, last }
        } else if saw_empty {
            PageOutcome::Empty
        } else {
            PageOutcome::Missing(malformed.unwrap_or_else(|| {
                BrowserError::Timeout(format!("search response for page {}", self.current_page))
            }))
        })
    }

    async fn rest_between_pages(&mut self) -> BrowserResult<()> {
        let pause = self.page.governor().page_pause(self.current_page);
        if self.page.governor().chance(self.config.micro_scroll_probability) {
            let delta = self.page.governor().between(320.0, 920.0);
            self.page.scroll(&ScrollTarget::Window, delta).await?;
            if self.page.governor().chance(0.15) {
                let back = self.page.governor().between(120.0, 460.0);
                self.page.scroll(&ScrollTarget::Window, -back).await?;
            }
        }
        self.page.pause(pause).await;
        Ok(())
    }

    async fn turn_page(&mut self) -> BrowserResult<Turn> {
        let url = self.page.current_url().await?;
        let next_button = {
            let dom = self.page.snapshot().await?;
            if let Some(risk) = detect_risk(&url, &dom) {
                self.page.metrics_mut().record_risk_detection();
                return Err(risk.into_error());
            }
            if has_end_marker(&dom) {
                return Ok(Turn::End);
            }
            find_next_button(&dom)
        };

        self.page.drain_responses().await?;
        if let Some(selector) = next_button {
            if self.page.click(&selector).await? {
                debug!(page = self.current_page, "clicked next page");
                self.settle().await;
                return Ok(Turn::Advanced);
            }
        }

        let before = self.page.scroll_height(&ScrollTarget::Window).await?;
        self.page.scroll_to_bottom(&ScrollTarget::Window).await?;
        self.settle().await;
        if has_end_marker(&self.page.snapshot().await?) {
            debug!(page = self.current_page, "end marker shown after scrolling");
            return Ok(Turn::End);
        }
        let after = self.page.scroll_height(&ScrollTarget::Window).await?;
        if after - before <= MIN_SCROLL_GROWTH_PX {
            debug!(before, after, "scroll height stopped growing");
            return Ok(Turn::End);
        }
        Ok(Turn::Advanced)
    }

    async fn settle(&mut self) {
        let bounds = [
            self.config.settle_after_action_ms,
            self.config.settle_after_action_ms.saturating_mul(8) / 5,
        ];
        let pause = self.page.governor().sample(bounds);
        self.page.pause(pause).await;
    }
}

/// An end-of-results element, or an element whose whole text is an end marker.
pub fn has_end_marker(dom: &DomSnapshot) -> bool {
    END_MARKER_SELECTORS.iter().any(|selector| dom.exists(selector))
        || END_MARKER_TEXTS
            .iter()
            .any(|marker| dom.find_by_exact_text("body", marker).is_some())
}

fn find_next_button(dom: &DomSnapshot) -> Option<String> {
    dom.select_first(&NEXT_BUTTON_SELECTORS)
        .or_else(|| dom.find_by_exact_text("body", NEXT_BUTTON_TEXT))
        .map(css_path)
}
