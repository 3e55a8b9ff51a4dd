#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use async_trait::async_trait;
use xhs_core::browser::{BrowserError, BrowserResult, CapturedResponse, PageDriver, ScrollTarget};
use xhs_core::dom::DomSnapshot;
use xhs_core::StoredCookie;

pub const SEARCH_API: &str = "https://edith.xiaohongshu.com/api/sns/web/v1/search/notes";

const FEED_HTML: &str = "<html><body>feed</body></html>";

/// A page reached by `goto` when its URL contains `pattern`.
#[derive(Debug, Clone)]
pub struct Route {
    pub pattern: String,
    pub final_url: Option<String>,
    pub title: String,
    pub html: String,
    /// Responses captured per visit; the last batch repeats.
    pub visits: VecDeque<Vec<CapturedResponse>>,
    /// Cookie the page requires, and where visitors without it land.
    pub guard: Option<(String, String)>,
}

impl Route {
    pub fn new(pattern: &str, html: &str) -> Self {
        Self {
            pattern: pattern.to_string(),
            final_url: None,
            title: String::new(),
            html: html.to_string(),
            visits: VecDeque::from([Vec::new()]),
            guard: None,
        }
    }

    pub fn requires_cookie(mut self, cookie: &str, wall_url: &str) -> Self {
        self.guard = Some((cookie.to_string(), wall_url.to_string()));
        self
    }

    /// Later `respond` calls apply to the next visit.
    pub fn next_visit(mut self) -> Self {
        self.visits.push_back(Vec::new());
        self
    }

    pub fn redirect_to(mut self, url: &str) -> Self {
        self.final_url = Some(url.to_string());
        self
    }

    pub fn titled(mut self, title: &str) -> Self {
        self.title = title.to_string();
        self
    }

    pub fn respond(mut self, response: CapturedResponse) -> Self {
        if let Some(batch) = self.visits.back_mut() {
            batch.push(response);
        }
        self
    }

    fn visit(&mut self) -> Vec<CapturedResponse> {
        if self.visits.len() > 1 {
            self.visits.pop_front().unwrap_or_default()
        } else {
            self.visits.front().cloned().unwrap_or_default()
        }
    }
}

/// What the page does after a click or a scroll to the bottom.
#[derive(Debug, Clone, Default)]
pub struct Effect {
    pub html: Option<String>,
    pub responses: Vec<CapturedResponse>,
    pub height_growth: f64,
}

impl Effect {
    pub fn responses(responses: Vec<CapturedResponse>) -> Self {
        Self {
            html: None,
            responses,
            height_growth: 900.0,
        }
    }

    pub fn html(html: &str) -> Self {
        Self {
            html: Some(html.to_string()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Default)]
pub struct MockState {
    pub url: String,
    pub title: String,
    pub html: String,
    pub height: f64,
    pub routes: Vec<Route>,
    pub on_click: VecDeque<Effect>,
    pub on_bottom: VecDeque<Effect>,
    pub on_reload: VecDeque<Vec<CapturedResponse>>,
    pub ready: VecDeque<CapturedResponse>,
    pub cookies: Vec<StoredCookie>,
    pub visited: Vec<String>,
    /// Each clicked selector with the document it was clicked in.
    pub clicks: Vec<(String, String)>,
    pub scrolls: usize,
    pub bottom_scrolls: usize,
    pub close_calls: usize,
    pub closed: bool,
}

/// Scripted stand-in for a browser page; clones share state.
#[derive(Debug, Clone, Default)]
pub struct MockDriver {
    state: Rc<RefCell<MockState>>,
}

impl MockDriver {
    pub fn new() -> Self {
        let driver = Self::default();
        {
            let mut state = driver.state.borrow_mut();
            state.url = "about:blank".into();
            state.html = "<html><body></body></html>".into();
            state.height = 1_000.0;
        }
        driver
    }

    pub fn route(self, route: Route) -> Self {
        self.state.borrow_mut().routes.push(route);
        self
    }

    pub fn on_click(self, effect: Effect) -> Self {
        self.state.borrow_mut().on_click.push_back(effect);
        self
    }

    pub fn on_bottom(self, effect: Effect) -> Self {
        self.state.borrow_mut().on_bottom.push_back(effect);
        self
    }

    pub fn on_reload(self, responses: Vec<CapturedResponse>) -> Self {
        self.state.borrow_mut().on_reload.push_back(responses);
        self
    }

    pub fn with_cookie(self, cookie: StoredCookie) -> Self {
        self.state.borrow_mut().cookies.push(cookie);
        self
    }

    pub fn state(&self) -> std::cell::Ref<'_, MockState> {
        self.state.borrow()
    }

    /// What a human changes in the window while the crawler waits.
    pub fn set_html(&self, html: &str) {
        self.state.borrow_mut().html = html.to_string();
    }

    pub fn add_cookie(&self, cookie: StoredCookie) {
        self.state.borrow_mut().cookies.push(cookie);
    }

    fn ensure_open(&self) -> BrowserResult<()> {
        if self.state.borrow().closed {
            return Err(BrowserError::SessionClosed);
        }
        Ok(())
    }

    fn apply(&self, effect: Effect) {
        let mut state = self.state.borrow_mut();
        if let Some(html) = effect.html {
            state.html = html;
        }
        state.height += effect.height_growth;
        state.ready.extend(effect.responses);
    }
}

pub fn search_response(ids: &[&str], has_more: bool) -> CapturedResponse {
    let items: Vec<serde_json::Value> = ids
        .iter()
        .map(|id| {
            serde_json::json!({
                "id": id,
                "model_type": "note",
                "xsec_token": format!("tok-{id}"),
                "note_card": {"type": "normal", "display_title": format!("title {id}")}
            })
        })
        .collect();
    let body = serde_json::json!({
        "code": 0,
        "success": true,
        "data": {"items": items, "has_more": has_more}
    });
    CapturedResponse::new(SEARCH_API, 200, body.to_string())
}

pub fn malformed_response() -> CapturedResponse {
    CapturedResponse::new(SEARCH_API, 200, "<html>gateway timeout</html>")
}

/// Text of the element `selector` addresses in `html`.
pub fn text_at(html: &str, selector: &str) -> Option<String> {
    let dom = DomSnapshot::parse(html);
    dom.select_first(&[selector]).map(xhs_core::dom::text_of)
}

#[async_trait(?Send)]
impl PageDriver for MockDriver {
    async fn goto(&mut self, url: &str) -> BrowserResult<()> {
        self.ensure_open()?;
        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;
        state.visited.push(url.to_string());
        state.height = 1_000.0;
        let Some(route) = state.routes.iter_mut().find(|route| url.contains(&route.pattern)) else {
            state.url = url.to_string();
            state.html = "<html><body></body></html>".into();
            return Ok(());
        };
        let walled = route
            .guard
            .as_ref()
            .filter(|(cookie, _)| !state.cookies.iter().any(|existing| existing.name == *cookie))
            .map(|(_, wall)| wall.clone());
        if let Some(wall) = walled {
            state.url = wall;
            state.title.clear();
            state.html = FEED_HTML.into();
            return Ok(());
        }
        let responses = route.visit();
        state.url = route.final_url.clone().unwrap_or_else(|| url.to_string());
        state.title = route.title.clone();
        state.html = route.html.clone();
        state.ready.extend(responses);
        Ok(())
    }

    async fn reload(&mut self) -> BrowserResult<()> {
        self.ensure_open()?;
        let mut state = self.state.borrow_mut();
        if let Some(responses) = state.on_reload.pop_front() {
            state.ready.extend(responses);
        }
        Ok(())
    }

    async fn current_url(&mut self) -> BrowserResult<String> {
        self.ensure_open()?;
        Ok(self.state.borrow().url.clone())
    }

    async fn title(&mut self) -> BrowserResult<String> {
        self.ensure_open()?;
        Ok(self.state.borrow().title.clone())
    }

    async fn content(&mut self) -> BrowserResult<String> {
        self.ensure_open()?;
        Ok(self.state.borrow().html.clone())
    }

    async fn click(&mut self, selector: &str) -> BrowserResult<bool> {
        self.ensure_open()?;
        let html = self.state.borrow().html.clone();
        if !DomSnapshot::parse(&html).exists(selector) {
            return Ok(false);
        }
        let effect = {
            let mut state = self.state.borrow_mut();
            state.clicks.push((selector.to_string(), html));
            state.on_click.pop_front()
        };
        if let Some(effect) = effect {
            self.apply(effect);
        }
        Ok(true)
    }

    async fn scroll(&mut self, _target: &ScrollTarget, _delta_y: f64) -> BrowserResult<()> {
        self.ensure_open()?;
        self.state.borrow_mut().scrolls += 1;
        Ok(())
    }

    async fn scroll_to_bottom(&mut self, _target: &ScrollTarget) -> BrowserResult<()> {
        self.ensure_open()?;
        let effect = {
            let mut state = self.state.borrow_mut();
            state.bottom_scrolls += 1;
            state.on_bottom.pop_front()
        };
        if let Some(effect) = effect {
            self.apply(effect);
        }
        Ok(())
    }

    async fn scroll_height(&mut self, _target: &ScrollTarget) -> BrowserResult<f64> {
        self.ensure_open()?;
        Ok(self.state.borrow().height)
    }

    async fn cookies(&mut self) -> BrowserResult<Vec<StoredCookie>> {
        self.ensure_open()?;
        Ok(self.state.borrow().cookies.clone())
    }

    async fn set_cookies(&mut self, cookies: &[StoredCookie]) -> BrowserResult<()> {
        self.ensure_open()?;
        let mut state = self.state.borrow_mut();
        for cookie in cookies {
            state.cookies.retain(|existing| existing.name != cookie.name);
            state.cookies.push(cookie.clone());
        }
        Ok(())
    }

    async fn next_response(&mut self, wait: Duration) -> BrowserResult<Option<CapturedResponse>> {
        self.ensure_open()?;
        if let Some(response) = self.state.borrow_mut().ready.pop_front() {
            return Ok(Some(response));
        }
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
        Ok(self.state.borrow_mut().ready.pop_front())
    }

    async fn close(&mut self) -> BrowserResult<()> {
        let mut state = self.state.borrow_mut();
        state.close_calls += 1;
        state.closed = true;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.state.borrow().closed
    }
}
