use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::browser::{BrowserError, BrowserResult, BrowserSession, CrawlMetrics, PageDriver, SessionLauncher};
use crate::config::CrawlerConfig;
use crate::credentials::CredentialStore;
use crate::detail::{DetailExtractor, NoteDetail};
use crate::login::{LoginGate, LoginMachine, LoginPhase, LoginStatus};
use crate::pacing::{PacedPage, PacingGovernor};
use crate::search::{SearchPager, SearchQuery};

/// Stop switch shared by every handle a crawler gives out.
///
/// `cancel` reaches whichever search is running; a stop that ended a run is
/// cleared when the next search starts.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    current: Arc<Mutex<CancellationToken>>,
}

impl StopHandle {
    fn lock(&self) -> MutexGuard<'_, CancellationToken> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn cancel(&self) {
        self.lock().cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.lock().is_cancelled()
    }

    fn rearm(&self) -> CancellationToken {
        let mut token = self.lock();
        if token.is_cancelled() {
            *token = CancellationToken::new();
        }
        token.clone()
    }
}

/// One logged-in browsing session: search pagination and note extraction
/// over a single page, paced and gated by the login machine.
pub struct XhsCrawler<D: PageDriver = BrowserSession> {
    config: CrawlerConfig,
    page: PacedPage<D>,
    store: CredentialStore,
    login: LoginMachine,
    stop: StopHandle,
    shutdown: CancellationToken,
}

impl XhsCrawler<BrowserSession> {
    /// Starts Chromium on the configured port and applies stored credentials.
    pub async fn launch(config: CrawlerConfig) -> BrowserResult<Self> {
        let launcher = SessionLauncher::new(config.session.clone(), config.motion.clone());
        let session = launcher.launch().await?;
        let mut crawler = Self::with_driver(config, session);
        if let Err(err) = crawler.bootstrap().await {
            warn!(error = %err, "session bootstrap failed; closing browser");
            if let Err(close_err) = crawler.close().await {
                warn!(error = %close_err, "failed to close browser after bootstrap error");
            }
            return Err(err);
        }
        Ok(crawler)
    }
}

impl<D: PageDriver> XhsCrawler<D> {
    pub fn with_driver(config: CrawlerConfig, driver: D) -> Self {
        let governor = PacingGovernor::new(config.pacing.clone());
        let store = CredentialStore::new(&config.credentials);
        let login = LoginMachine::new(config.login.clone(), config.session.headless);
        Self {
            page: PacedPage::new(driver, governor),
            store,
            login,
            stop: StopHandle::default(),
            shutdown: CancellationToken::new(),
            config,
        }
    }

    pub fn config(&self) -> &CrawlerConfig {
        &self.config
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.store
    }

    pub fn login_phase(&self) -> LoginPhase {
        self.login.phase()
    }

    pub fn metrics(&self) -> &CrawlMetrics {
        self.page.metrics()
    }

    /// Raised while the session waits for a human to finish login or verification.
    pub fn waiting_flag(&self) -> Arc<AtomicBool> {
        self.login.waiting_flag()
    }

    async fn bootstrap(&mut self) -> BrowserResult<()> {
        let Some(set) = self.store.load().await else {
            info!(configured = self.store.is_configured(), "no stored credentials to apply");
            return Ok(());
        };
        self.page.set_cookies(&set.cookies).await?;
        info!(cookies = set.cookies.len(), "stored credentials applied");
        Ok(())
    }

    /// Probes the current page without acting on it.
    pub async fn login_status(&mut self) -> BrowserResult<LoginStatus> {
        self.login.status(&mut self.page).await
    }

    /// Gates on an authenticated session; see [`LoginMachine::ensure_authenticated`].
    pub async fn ensure_login(&mut self) -> BrowserResult<()> {
        if self.page.is_closed() {
            return Err(BrowserError::SessionClosed);
        }
        if self.login.is_authenticated() {
            return Ok(());
        }
        match self.config.login.wait_timeout_seconds {
            Some(seconds) => {
                self.login
                    .ensure_authenticated_within(
                        &mut self.page,
                        &mut self.store,
                        &self.shutdown,
                        Duration::from_secs(seconds),
                    )
                    .await?;
            }
            None => {
                self.login
                    .ensure_authenticated(&mut self.page, &mut self.store, &self.shutdown)
                    .await?;
            }
        }
        Ok(())
    }

    /// Lazily paginates `query`. Access faults met on the way pause for the
    /// login machine and the run resumes after the last loaded page.
    pub async fn search(&mut self, query: SearchQuery) -> BrowserResult<SearchPager<'_, D>> {
        self.ensure_login().await?;
        let stop = self.stop.rearm();
        let gate = LoginGate {
            login: &mut self.login,
            store: &mut self.store,
            shutdown: &self.shutdown,
        };
        Ok(SearchPager::new(&mut self.page, self.config.search.clone(), query, stop).with_gate(gate))
    }

    pub async fn fetch_note(
        &mut self,
        note_id: &str,
        token: Option<&str>,
        max_scrolls: Option<usize>,
    ) -> BrowserResult<NoteDetail> {
        self.ensure_login().await?;
        let result = DetailExtractor::new(&mut self.page, &self.config.search.base_url, &self.config.comments)
            .fetch(&self.store, note_id, token, max_scrolls)
            .await;
        if let Err(err) = &result {
            if err.is_access_fault() {
                warn!(note_id, error = %err, "access fault during note fetch; login will be re-checked");
                self.login.mark_fault(err);
            }
        }
        result
    }

    /// Halts the active search after its current page.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Take it before `search`; the pager borrows the crawler while it runs.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Cancelling it also ends a pending manual-login wait.
    pub fn shutdown_handle(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.page.is_closed()
    }

    /// Safe to call repeatedly and after a partial startup.
    pub async fn close(&mut self) -> BrowserResult<()> {
        self.stop.cancel();
        self.shutdown.cancel();
        if self.page.is_closed() {
            return Ok(());
        }
        let metrics = self.page.metrics().clone();
        info!(
            navigations = metrics.navigations,
            pages = metrics.pages_yielded,
            notes = metrics.notes_fetched,
            "closing crawler session"
        );
        self.page.close().await
    }
}
