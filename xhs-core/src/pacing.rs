use std::time::Duration;

use chrono::{Local, NaiveTime, Timelike};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tokio::time::sleep;
use tracing::{debug, trace};

use crate::browser::{BrowserResult, CapturedResponse, CrawlMetrics, PageDriver, ScrollTarget};
use crate::config::PacingSection;
use crate::credentials::StoredCookie;
use crate::dom::DomSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Navigate,
    Click,
    Scroll,
}

/// Randomized delays in front of every navigation and interactive action.
///
/// One governor per session; its RNG is owned, never shared across sessions.
#[derive(Debug)]
pub struct PacingGovernor {
    config: PacingSection,
    rng: ChaCha8Rng,
}

impl PacingGovernor {
    pub fn new(config: PacingSection) -> Self {
        Self::with_rng(config, ChaCha8Rng::from_entropy())
    }

    pub fn seeded(config: PacingSection, seed: u64) -> Self {
        Self::with_rng(config, ChaCha8Rng::seed_from_u64(seed))
    }

    pub fn with_rng(config: PacingSection, rng: ChaCha8Rng) -> Self {
        Self { config, rng }
    }

    pub fn config(&self) -> &PacingSection {
        &self.config
    }

    pub fn delay_for(&mut self, kind: ActionKind) -> Duration {
        let bounds = match kind {
            ActionKind::Navigate => self.config.navigation_delay_ms,
            ActionKind::Click => self.config.click_delay_ms,
            ActionKind::Scroll => self.config.scroll_delay_ms,
        };
        let base = self.sample(bounds);
        self.scaled(base)
    }

    pub async fn before_action(&mut self, kind: ActionKind) {
        let delay = self.delay_for(kind);
        trace!(?kind, delay_ms = delay.as_millis() as u64, "pacing action");
        sleep(delay).await;
    }

    pub async fn warm_up(&mut self) {
        let delay = self.sample(self.config.warm_up_ms);
        sleep(delay).await;
    }

    /// Pause after finishing `page`, with an occasional long rest.
    pub fn page_pause(&mut self, page: u32) -> Duration {
        let mut pause = self.sample(self.config.page_pause_ms);
        let [low, high] = self.config.long_rest_every_pages;
        let every = self.rng.gen_range(low.min(high)..=low.max(high));
        if every > 0 && page > 0 && page % every == 0 {
            let rest = self.sample(self.config.long_rest_ms);
            debug!(page, rest_ms = rest.as_millis() as u64, "taking a long rest");
            pause += rest;
        }
        self.scaled(pause)
    }

    pub fn chance(&mut self, probability: f64) -> bool {
        probability > 0.0 && self.rng.gen_bool(probability.min(1.0))
    }

    pub fn between(&mut self, low: f64, high: f64) -> f64 {
        if high <= low {
            return low;
        }
        self.rng.gen_range(low..high)
    }

    pub fn sample(&mut self, bounds: [u64; 2]) -> Duration {
        let (low, high) = (bounds[0].min(bounds[1]), bounds[0].max(bounds[1]));
        Duration::from_millis(self.rng.gen_range(low..=high))
    }

    fn scaled(&mut self, base: Duration) -> Duration {
        if !self.config.time_of_day_scaling || base.is_zero() {
            return base;
        }
        let multiplier = time_of_day_multiplier(Local::now().time(), &mut self.rng);
        base.mul_f64(multiplier)
    }
}

/// Slower around lunch, dinner and late at night.
pub fn time_of_day_multiplier<R: Rng>(time: NaiveTime, rng: &mut R) -> f64 {
    let hour = time.hour() as f64 + time.minute() as f64 / 60.0;
    if (12.0..13.5).contains(&hour) || (18.0..20.0).contains(&hour) {
        rng.gen_range(1.5..2.3)
    } else if hour >= 22.0 {
        rng.gen_range(1.3..1.9)
    } else {
        rng.gen_range(0.9..1.3)
    }
}

/// A driver whose navigations and interactive actions all pass the governor.
///
/// Reads (content, URL, cookies, captured responses) are not paced.
pub struct PacedPage<D> {
    driver: D,
    governor: PacingGovernor,
    metrics: CrawlMetrics,
}

impl<D: PageDriver> PacedPage<D> {
    pub fn new(driver: D, governor: PacingGovernor) -> Self {
        Self {
            driver,
            governor,
            metrics: CrawlMetrics::default(),
        }
    }

    pub fn governor(&mut self) -> &mut PacingGovernor {
        &mut self.governor
    }

    pub fn metrics(&self) -> &CrawlMetrics {
        &self.metrics
    }

    pub fn metrics_mut(&mut self) -> &mut CrawlMetrics {
        &mut self.metrics
    }

    pub async fn goto(&mut self, url: &str) -> BrowserResult<()> {
        self.governor.before_action(ActionKind::Navigate).await;
        self.metrics.record_navigation();
        debug!(url, "navigating");
        self.driver.goto(url).await
    }

    pub async fn reload(&mut self) -> BrowserResult<()> {
        self.governor.before_action(ActionKind::Navigate).await;
        self.metrics.record_navigation();
        self.driver.reload().await
    }

    pub async fn click(&mut self, selector: &str) -> BrowserResult<bool> {
        self.governor.before_action(ActionKind::Click).await;
        self.metrics.record_action();
        self.driver.click(selector).await
    }

    pub async fn scroll(&mut self, target: &ScrollTarget, delta_y: f64) -> BrowserResult<()> {
        self.governor.before_action(ActionKind::Scroll).await;
        self.metrics.record_action();
        self.driver.scroll(target, delta_y).await
    }

    pub async fn scroll_to_bottom(&mut self, target: &ScrollTarget) -> BrowserResult<()> {
        self.governor.before_action(ActionKind::Scroll).await;
        self.metrics.record_action();
        self.driver.scroll_to_bottom(target).await
    }

    pub async fn pause(&mut self, duration: Duration) {
        if !duration.is_zero() {
            sleep(duration).await;
        }
    }

    pub async fn snapshot(&mut self) -> BrowserResult<DomSnapshot> {
        let html = self.driver.content().await?;
        Ok(DomSnapshot::parse(&html))
    }

    pub async fn current_url(&mut self) -> BrowserResult<String> {
        self.driver.current_url().await
    }

    pub async fn title(&mut self) -> BrowserResult<String> {
        self.driver.title().await
    }

    pub async fn scroll_height(&mut self, target: &ScrollTarget) -> BrowserResult<f64> {
        self.driver.scroll_height(target).await
    }

    pub async fn cookies(&mut self) -> BrowserResult<Vec<StoredCookie>> {
        self.driver.cookies().await
    }

    pub async fn set_cookies(&mut self, cookies: &[StoredCookie]) -> BrowserResult<()> {
        self.driver.set_cookies(cookies).await
    }

    pub async fn next_response(
        &mut self,
        wait: Duration,
    ) -> BrowserResult<Option<CapturedResponse>> {
        let response = self.driver.next_response(wait).await?;
        if response.is_some() {
            self.metrics.record_response();
        }
        Ok(response)
    }

    pub async fn drain_responses(&mut self) -> BrowserResult<usize> {
        self.driver.drain_responses().await
    }

    pub async fn close(&mut self) -> BrowserResult<()> {
        self.driver.close().await
    }

    pub fn is_closed(&self) -> bool {
        self.driver.is_closed()
    }
}
