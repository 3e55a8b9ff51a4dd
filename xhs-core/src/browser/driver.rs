use std::time::Duration;

use async_trait::async_trait;

use crate::credentials::StoredCookie;

use super::error::BrowserResult;

/// A network response captured inside the listen scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedResponse {
    pub url: String,
    pub status: i64,
    pub body: String,
}

impl CapturedResponse {
    pub fn new(url: impl Into<String>, status: i64, body: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            status,
            body: body.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScrollTarget {
    Window,
    /// First element matching the selector; falls back to the window when absent.
    Element(String),
}

/// Primitive page operations the pipelines are written against.
///
/// `BrowserSession` implements it over CDP; tests script it. Element lookups
/// and response waits are bounded by the implementation.
#[async_trait(?Send)]
pub trait PageDriver {
    async fn goto(&mut self, url: &str) -> BrowserResult<()>;
    async fn reload(&mut self) -> BrowserResult<()>;
    async fn current_url(&mut self) -> BrowserResult<String>;
    async fn title(&mut self) -> BrowserResult<String>;
    /// Serialized HTML of the current document.
    async fn content(&mut self) -> BrowserResult<String>;
    /// Clicks the first element matching `selector`. `Ok(false)` when nothing matched.
    async fn click(&mut self, selector: &str) -> BrowserResult<bool>;
    async fn scroll(&mut self, target: &ScrollTarget, delta_y: f64) -> BrowserResult<()>;
    async fn scroll_to_bottom(&mut self, target: &ScrollTarget) -> BrowserResult<()>;
    async fn scroll_height(&mut self, target: &ScrollTarget) -> BrowserResult<f64>;
    async fn cookies(&mut self) -> BrowserResult<Vec<StoredCookie>>;
    async fn set_cookies(&mut self, cookies: &[StoredCookie]) -> BrowserResult<()>;
    /// Next captured response, or `None` once `wait` elapses.
    async fn next_response(&mut self, wait: Duration) -> BrowserResult<Option<CapturedResponse>>;
    async fn close(&mut self) -> BrowserResult<()>;
    fn is_closed(&self) -> bool;

    /// Discards responses captured before the next page action.
    async fn drain_responses(&mut self) -> BrowserResult<usize> {
        let mut drained = 0;
        while self.next_response(Duration::ZERO).await?.is_some() {
            drained += 1;
        }
        Ok(drained)
    }
}
