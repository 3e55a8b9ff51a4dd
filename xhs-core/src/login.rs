use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::browser::{BrowserError, BrowserResult, PageDriver};
use crate::config::LoginSection;
use crate::credentials::{CredentialSet, CredentialStore, SaveOutcome};
use crate::dom::DomSnapshot;
use crate::pacing::PacedPage;

pub const TOKEN_COOKIE: &str = "id_token";

const RISK_URL_MARKER: &str = "website-login/error";
const RISK_PHRASES: [&str; 3] = ["安全限制", "访问频次异常", "请勿频繁操作"];
const RISK_CODE: &str = "300013";
const CAPTCHA_SELECTORS: [&str; 2] = [".slide-verify", ".captcha-container"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginStatus {
    Unauthenticated,
    RiskRestricted,
    Authenticated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RiskSignal {
    pub code: String,
    pub message: String,
}

impl RiskSignal {
    pub fn into_error(self) -> BrowserError {
        BrowserError::RiskRestricted {
            code: self.code,
            message: self.message,
        }
    }
}

/// Restriction page, rate-limit notice or slide captcha. Never the login prompt.
pub fn detect_risk(url: &str, dom: &DomSnapshot) -> Option<RiskSignal> {
    if url.contains(RISK_URL_MARKER) {
        let mut code = RISK_CODE.to_string();
        let mut message = "redirected to security restriction page".to_string();
        if let Ok(parsed) = url::Url::parse(url) {
            for (key, value) in parsed.query_pairs() {
                match key.as_ref() {
                    "error_code" if !value.is_empty() => code = value.into_owned(),
                    "error_msg" if !value.is_empty() => message = value.into_owned(),
                    _ => {}
                }
            }
        }
        return Some(RiskSignal { code, message });
    }
    if CAPTCHA_SELECTORS.iter().any(|selector| dom.exists(selector)) {
        return Some(RiskSignal {
            code: "captcha".into(),
            message: "slide captcha displayed".into(),
        });
    }
    let text = dom.body_text();
    RISK_PHRASES
        .iter()
        .find(|phrase| text.contains(*phrase))
        .map(|phrase| RiskSignal {
            code: if text.contains(RISK_CODE) {
                RISK_CODE.into()
            } else {
                "restricted".into()
            },
            message: phrase.to_string(),
        })
}

/// Observations a login classification is derived from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoginProbe {
    pub url: String,
    pub has_identity: bool,
    pub has_visible_login_prompt: bool,
    pub risk: Option<RiskSignal>,
    pub has_token_cookie: bool,
}

impl LoginProbe {
    pub fn observe(url: &str, dom: &DomSnapshot, has_token_cookie: bool, config: &LoginSection) -> Self {
        let has_identity = config
            .identity_selectors
            .iter()
            .any(|selector| dom.exists(selector));
        let has_visible_login_prompt = config
            .prompt_selectors
            .iter()
            .any(|selector| dom.exists(selector))
            || config
                .prompt_texts
                .iter()
                .any(|text| dom.find_by_exact_text("body", text).is_some());
        Self {
            url: url.to_string(),
            has_identity,
            has_visible_login_prompt,
            risk: detect_risk(url, dom),
            has_token_cookie,
        }
    }

    /// Only a positive identity signal authenticates; a missing prompt proves nothing.
    pub fn classify(&self, accept_token_cookie: bool) -> LoginStatus {
        if self.risk.is_some() {
            LoginStatus::RiskRestricted
        } else if self.has_identity {
            LoginStatus::Authenticated
        } else if accept_token_cookie && self.has_token_cookie && !self.has_visible_login_prompt {
            LoginStatus::Authenticated
        } else {
            LoginStatus::Unauthenticated
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginPhase {
    Unknown,
    Unauthenticated,
    ApplyingCredentials,
    RiskRestricted,
    AwaitingHuman,
    Authenticated,
}

struct WaitingGuard(Arc<AtomicBool>);

impl WaitingGuard {
    fn raise(flag: &Arc<AtomicBool>) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(Arc::clone(flag))
    }
}

impl Drop for WaitingGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// What a pipeline needs to hand an access fault back to the login machine.
pub struct LoginGate<'a> {
    pub login: &'a mut LoginMachine,
    pub store: &'a mut CredentialStore,
    pub shutdown: &'a CancellationToken,
}

impl LoginGate<'_> {
    pub async fn recover<D: PageDriver>(
        &mut self,
        page: &mut PacedPage<D>,
        fault: BrowserError,
    ) -> BrowserResult<()> {
        self.login.recover(page, self.store, self.shutdown, fault).await
    }
}

/// Gates the pipelines on an authenticated session.
#[derive(Debug)]
pub struct LoginMachine {
    config: LoginSection,
    headless: bool,
    phase: LoginPhase,
    waiting: Arc<AtomicBool>,
}

impl LoginMachine {
    pub fn new(config: LoginSection, headless: bool) -> Self {
        Self {
            config,
            headless,
            phase: LoginPhase::Unknown,
            waiting: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn phase(&self) -> LoginPhase {
        self.phase
    }

    pub fn is_authenticated(&self) -> bool {
        self.phase == LoginPhase::Authenticated
    }

    /// Raised while the machine is blocked on a human.
    pub fn waiting_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.waiting)
    }

    pub fn is_waiting(&self) -> bool {
        self.waiting.load(Ordering::SeqCst)
    }

    /// Records an access fault seen by a pipeline; the next gate probes again.
    pub fn mark_fault(&mut self, fault: &BrowserError) {
        self.phase = match fault {
            BrowserError::RiskRestricted { .. } => LoginPhase::RiskRestricted,
            _ => LoginPhase::Unauthenticated,
        };
    }

    pub async fn probe<D: PageDriver>(&self, page: &mut PacedPage<D>) -> BrowserResult<LoginProbe> {
        let url = page.current_url().await?;
        let dom = page.snapshot().await?;
        let has_token = page
            .cookies()
            .await?
            .iter()
            .any(|cookie| cookie.name == TOKEN_COOKIE && !cookie.value.is_empty());
        Ok(LoginProbe::observe(&url, &dom, has_token, &self.config))
    }

    pub async fn status<D: PageDriver>(&self, page: &mut PacedPage<D>) -> BrowserResult<LoginStatus> {
        Ok(self.probe(page).await?.classify(self.config.accept_token_cookie))
    }

    /// Resolves to `Authenticated` or an access fault.
    ///
    /// With a visible browser this blocks until a human resolves the page, with
    /// no timeout. `shutdown` ends the wait with `LoginRequired`.
    pub async fn ensure_authenticated<D: PageDriver>(
        &mut self,
        page: &mut PacedPage<D>,
        store: &mut CredentialStore,
        shutdown: &CancellationToken,
    ) -> BrowserResult<LoginStatus> {
        let url = page.current_url().await?;
        if !url.starts_with("http") {
            page.goto(&self.config.home_url).await?;
        }
        self.dismiss_popups(page).await?;

        let mut probe = self.probe(page).await?;
        let mut status = probe.classify(self.config.accept_token_cookie);
        debug!(?status, url = %probe.url, "login probe");

        if status == LoginStatus::Unauthenticated {
            if let Some(set) = store.load().await {
                self.phase = LoginPhase::ApplyingCredentials;
                info!(cookies = set.cookies.len(), "applying stored credentials");
                page.set_cookies(&set.cookies).await?;
                page.reload().await?;
                probe = self.probe(page).await?;
                status = probe.classify(self.config.accept_token_cookie);
            }
        }

        if status != LoginStatus::Authenticated {
            store.set_suppressed(true);
            self.phase = match status {
                LoginStatus::RiskRestricted => {
                    page.metrics_mut().record_risk_detection();
                    LoginPhase::RiskRestricted
                }
                _ => LoginPhase::Unauthenticated,
            };
            if self.headless && !self.config.wait_when_headless {
                warn!(?status, "manual resolution impossible in headless mode");
                return Err(match probe.risk {
                    Some(risk) => risk.into_error(),
                    None => BrowserError::LoginRequired(format!("not logged in at {}", probe.url)),
                });
            }
            self.await_human(page, shutdown).await?;
        }

        self.on_authenticated(page, store).await;
        Ok(LoginStatus::Authenticated)
    }

    /// `ensure_authenticated` bounded by a caller-chosen timeout.
    pub async fn ensure_authenticated_within<D: PageDriver>(
        &mut self,
        page: &mut PacedPage<D>,
        store: &mut CredentialStore,
        shutdown: &CancellationToken,
        limit: Duration,
    ) -> BrowserResult<LoginStatus> {
        match tokio::time::timeout(limit, self.ensure_authenticated(page, store, shutdown)).await {
            Ok(result) => result,
            Err(_) => Err(BrowserError::Timeout("manual login".into())),
        }
    }

    /// Pauses a pipeline that hit `fault` until the page probes authenticated.
    ///
    /// Headless sessions get the fault back unless `wait_when_headless` is set.
    /// `login.wait_timeout_seconds` bounds the wait.
    pub async fn recover<D: PageDriver>(
        &mut self,
        page: &mut PacedPage<D>,
        store: &mut CredentialStore,
        shutdown: &CancellationToken,
        fault: BrowserError,
    ) -> BrowserResult<()> {
        self.mark_fault(&fault);
        store.set_suppressed(true);
        if self.headless && !self.config.wait_when_headless {
            warn!(error = %fault, "access fault in headless mode; manual resolution impossible");
            return Err(fault);
        }
        warn!(error = %fault, "access fault; pausing for manual resolution");
        match self.config.wait_timeout_seconds {
            Some(seconds) => {
                tokio::time::timeout(Duration::from_secs(seconds), self.await_human(page, shutdown))
                    .await
                    .map_err(|_| BrowserError::Timeout("manual resolution".into()))??;
            }
            None => self.await_human(page, shutdown).await?,
        }
        self.on_authenticated(page, store).await;
        Ok(())
    }

    async fn await_human<D: PageDriver>(
        &mut self,
        page: &mut PacedPage<D>,
        shutdown: &CancellationToken,
    ) -> BrowserResult<()> {
        let _guard = WaitingGuard::raise(&self.waiting);
        self.phase = LoginPhase::AwaitingHuman;
        page.metrics_mut().record_login_wait();
        warn!("waiting for manual login or verification in the browser window");
        let interval = Duration::from_millis(self.config.poll_interval_ms.max(1));
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    return Err(BrowserError::LoginRequired("shutdown while waiting for login".into()));
                }
                _ = tokio::time::sleep(interval) => {}
            }
            if self.status(page).await? == LoginStatus::Authenticated {
                info!("manual login resolved");
                return Ok(());
            }
        }
    }

    async fn on_authenticated<D: PageDriver>(&mut self, page: &mut PacedPage<D>, store: &mut CredentialStore) {
        self.phase = LoginPhase::Authenticated;
        store.set_suppressed(false);
        let cookies = match page.cookies().await {
            Ok(cookies) => cookies,
            Err(err) => {
                warn!(error = %err, "could not read cookies after login");
                return;
            }
        };
        match store.save(&CredentialSet::captured(cookies)).await {
            Ok(SaveOutcome::Saved(paths)) => debug!(targets = paths.len(), "credentials captured"),
            Ok(outcome) => debug!(?outcome, "credentials not persisted"),
            Err(err) => warn!(error = %err, "failed to persist credentials"),
        }
    }

    async fn dismiss_popups<D: PageDriver>(&self, page: &mut PacedPage<D>) -> BrowserResult<()> {
        let dom = page.snapshot().await?;
        let present: Vec<String> = self
            .config
            .popup_close_selectors
            .iter()
            .filter(|selector| dom.exists(selector))
            .cloned()
            .collect();
        drop(dom);
        for selector in present {
            if page.click(&selector).await? {
                debug!(selector = %selector, "dismissed popup");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observe(html: &str, url: &str, token: bool) -> LoginProbe {
        LoginProbe::observe(url, &DomSnapshot::parse(html), token, &LoginSection::default())
    }

    #[test]
    fn guest_page_without_prompt_is_unauthenticated() {
        let probe = observe("<html><body><div class='feeds'></div></body></html>", "https://www.xiaohongshu.com/explore", false);
        assert!(!probe.has_visible_login_prompt);
        assert_eq!(probe.classify(true), LoginStatus::Unauthenticated);
    }

    #[test]
    fn identity_element_authenticates() {
        let probe = observe(
            "<html><body><div class='user-side-content'>me</div></body></html>",
            "https://www.xiaohongshu.com/explore",
            false,
        );
        assert_eq!(probe.classify(true), LoginStatus::Authenticated);
    }

    #[test]
    fn token_cookie_counts_only_without_prompt() {
        let without_prompt = observe("<html><body></body></html>", "https://www.xiaohongshu.com", true);
        assert_eq!(without_prompt.classify(true), LoginStatus::Authenticated);
        assert_eq!(without_prompt.classify(false), LoginStatus::Unauthenticated);

        let with_prompt = observe(
            "<html><body><button class='login-btn'>登录</button></body></html>",
            "https://www.xiaohongshu.com",
            true,
        );
        assert_eq!(with_prompt.classify(true), LoginStatus::Unauthenticated);
    }

    #[test]
    fn risk_redirect_carries_code_and_message() {
        let url = "https://www.xiaohongshu.com/website-login/error?error_code=300013&error_msg=%E8%AE%BF%E9%97%AE%E9%A2%91%E6%AC%A1%E5%BC%82%E5%B8%B8";
        let probe = observe("<html><body></body></html>", url, true);
        assert_eq!(probe.classify(true), LoginStatus::RiskRestricted);
        let risk = probe.risk.unwrap();
        assert_eq!(risk.code, "300013");
        assert_eq!(risk.message, "访问频次异常");
    }

    #[test]
    fn captcha_and_notice_text_are_risk_not_login() {
        let captcha = observe(
            "<html><body><div class='slide-verify'></div><div class='user-side-content'></div></body></html>",
            "https://www.xiaohongshu.com",
            false,
        );
        assert_eq!(captcha.classify(true), LoginStatus::RiskRestricted);

        let notice = observe(
            "<html><body><p>请勿频繁操作</p></body></html>",
            "https://www.xiaohongshu.com",
            false,
        );
        assert_eq!(notice.risk.unwrap().code, "restricted");
    }

    #[test]
    fn faults_set_the_matching_phase() {
        let mut machine = LoginMachine::new(LoginSection::default(), true);
        machine.mark_fault(&BrowserError::RiskRestricted {
            code: "300013".into(),
            message: "访问频次异常".into(),
        });
        assert_eq!(machine.phase(), LoginPhase::RiskRestricted);
        machine.mark_fault(&BrowserError::LoginRequired("wall".into()));
        assert_eq!(machine.phase(), LoginPhase::Unauthenticated);
        assert!(!machine.is_authenticated());
    }

    #[test]
    fn waiting_guard_lowers_flag_on_drop() {
        let machine = LoginMachine::new(LoginSection::default(), false);
        let flag = machine.waiting_flag();
        {
            let _guard = WaitingGuard::raise(&flag);
            assert!(machine.is_waiting());
        }
        assert!(!machine.is_waiting());
    }
}
