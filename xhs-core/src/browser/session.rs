use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig as ChromiumConfig};
use chromiumoxide::cdp::browser_protocol::network::{CookieParam, TimeSinceEpoch};
use chromiumoxide::cdp::browser_protocol::page::{
    AddScriptToEvaluateOnNewDocumentParams, NavigateParams,
};
use chromiumoxide::cdp::browser_protocol::target::CreateTargetParams;
use chromiumoxide::handler::viewport::Viewport as ChromiumViewport;
use chromiumoxide::page::Page;
use futures::StreamExt;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{MotionSection, SessionSection};
use crate::credentials::StoredCookie;
use crate::search::is_search_endpoint;

use super::capture::ResponseCapture;
use super::driver::{CapturedResponse, PageDriver, ScrollTarget};
use super::error::{BrowserError, BrowserResult};
use super::motion::HumanMotion;
use super::profile::{BrowserProfile, ProfileManager};

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

#[derive(Debug, Clone)]
pub struct SessionLauncher {
    config: SessionSection,
    motion: MotionSection,
    profiles: ProfileManager,
}

impl SessionLauncher {
    pub fn new(config: SessionSection, motion: MotionSection) -> Self {
        let profiles = ProfileManager::from_config(&config);
        Self {
            config,
            motion,
            profiles,
        }
    }

    pub fn config(&self) -> &SessionSection {
        &self.config
    }

    /// Launches on the configured profile, falling back to a disposable one
    /// when the configured directory cannot be used (typically a stale lock).
    pub async fn launch(&self) -> BrowserResult<BrowserSession> {
        if let Err(err) = self.profiles.cleanup_expired() {
            warn!(error = %err, "failed to clean expired scratch profiles");
        }
        let port = self.config.port;
        let preferred = match self.profiles.persistent(self.config.profile_dir.as_deref()) {
            Ok(profile) => profile,
            Err(err) => {
                warn!(port, error = %err, "configured profile unusable");
                None
            }
        };
        match preferred {
            Some(profile) => {
                let path = profile.path().display().to_string();
                match self.launch_with(profile).await {
                    Ok(session) => Ok(session),
                    Err(err @ BrowserError::Launch(_)) => {
                        warn!(
                            port,
                            profile = %path,
                            error = %err,
                            "profile locked or unusable, retrying with a disposable profile"
                        );
                        self.launch_with(self.profiles.disposable(port)?).await
                    }
                    Err(err) => Err(err),
                }
            }
            None => self.launch_with(self.profiles.disposable(port)?).await,
        }
    }

    async fn launch_with(&self, profile: BrowserProfile) -> BrowserResult<BrowserSession> {
        let user_agent = self
            .config
            .user_agent
            .clone()
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string());
        let chromium_config = self.build_chromium_config(&profile, &user_agent)?;
        info!(
            port = self.config.port,
            profile = %profile.path().display(),
            disposable = profile.is_disposable(),
            headless = self.config.headless,
            proxy = self.config.proxy.is_some(),
            "Launching Chromium instance"
        );

        let (mut browser, mut handler) = Browser::launch(chromium_config)
            .await
            .map_err(|err| BrowserError::Launch(err.to_string()))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    debug!(error = %err, "Chromium handler reported error");
                }
            }
        });

        let opened = async {
            let page = browser.new_page(CreateTargetParams::new("about:blank")).await?;
            self.configure_page(&page, &user_agent).await?;
            let capture = ResponseCapture::attach(&page, &self.config.listen_scope, is_search_endpoint).await?;
            Ok::<_, BrowserError>((page, capture))
        }
        .await;

        let (page, capture) = match opened {
            Ok(parts) => parts,
            Err(err) => {
                // Partial startup: release the process before reporting.
                if let Err(close_err) = browser.close().await {
                    warn!(error = %close_err, "failed to close browser after setup error");
                }
                handler_task.abort();
                return Err(err);
            }
        };

        Ok(BrowserSession {
            browser: Some(browser),
            page: Some(page),
            handler_task: Some(handler_task),
            capture: Some(capture),
            profile: Some(profile),
            port: self.config.port,
            cookie_domain: format!(".{}", self.config.listen_scope),
            element_timeout: Duration::from_millis(self.config.element_timeout_ms),
            motion: HumanMotion::new(self.motion.clone()),
        })
    }

    fn build_chromium_config(
        &self,
        profile: &BrowserProfile,
        user_agent: &str,
    ) -> BrowserResult<ChromiumConfig> {
        let [width, height] = self.config.window;
        let mut builder = ChromiumConfig::builder()
            .port(self.config.port)
            .user_data_dir(profile.path())
            .request_timeout(Duration::from_secs(self.config.request_timeout_seconds))
            .viewport(ChromiumViewport {
                width,
                height,
                device_scale_factor: None,
                emulating_mobile: false,
                is_landscape: width >= height,
                has_touch: false,
            });

        if let Some(executable) = &self.config.executable_path {
            builder = builder.chrome_executable(executable);
        }
        if !self.config.headless {
            builder = builder.with_head();
        }
        if cfg!(target_os = "linux") {
            builder = builder.no_sandbox();
        }

        let mut args = vec![
            format!("--user-agent={user_agent}"),
            format!("--window-size={width},{height}"),
            "--disable-gpu".to_string(),
            "--mute-audio".to_string(),
            "--ignore-certificate-errors".to_string(),
            "--disable-features=AutomationControlled".to_string(),
            "--disable-blink-features=AutomationControlled".to_string(),
            "--no-first-run".to_string(),
            "--password-store=basic".to_string(),
        ];
        if let Some(lang) = &self.config.lang {
            args.push(format!("--lang={lang}"));
        }
        if let Some(proxy) = &self.config.proxy {
            args.push(format!("--proxy-server={proxy}"));
        }
        builder = builder.args(args);

        builder.build().map_err(BrowserError::Configuration)
    }

    async fn configure_page(&self, page: &Page, user_agent: &str) -> BrowserResult<()> {
        page.enable_stealth_mode_with_agent(user_agent).await?;
        if let Some(lang) = &self.config.lang {
            let languages_script = format!(
                "Object.defineProperty(navigator, 'language', {{ get: () => '{lang}' }});\nObject.defineProperty(navigator, 'languages', {{ get: () => ['{lang}', 'zh', 'en'] }});"
            );
            page.evaluate_on_new_document(
                AddScriptToEvaluateOnNewDocumentParams::builder()
                    .source(languages_script)
                    .build()
                    .map_err(BrowserError::Configuration)?,
            )
            .await?;
        }
        Ok(())
    }
}

/// One browser process bound to one control port, driving a single page.
#[derive(Debug)]
pub struct BrowserSession {
    browser: Option<Browser>,
    page: Option<Page>,
    handler_task: Option<JoinHandle<()>>,
    capture: Option<ResponseCapture>,
    profile: Option<BrowserProfile>,
    port: u16,
    cookie_domain: String,
    element_timeout: Duration,
    motion: HumanMotion,
}

impl BrowserSession {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn profile(&self) -> Option<&BrowserProfile> {
        self.profile.as_ref()
    }

    fn page(&self) -> BrowserResult<&Page> {
        self.page.as_ref().ok_or(BrowserError::SessionClosed)
    }

    async fn run_script(&self, script: String) -> BrowserResult<serde_json::Value> {
        let result = self.page()?.evaluate(script.as_str()).await?;
        Ok(result.value().cloned().unwrap_or(serde_json::Value::Null))
    }
}

fn scroll_host(target: &ScrollTarget) -> String {
    match target {
        ScrollTarget::Window => "(document.scrollingElement || document.documentElement)".into(),
        ScrollTarget::Element(selector) => {
            let literal = serde_json::to_string(selector).unwrap_or_else(|_| "\"\"".into());
            format!(
                "(document.querySelector({literal}) || document.scrollingElement || document.documentElement)"
            )
        }
    }
}

#[async_trait(?Send)]
impl PageDriver for BrowserSession {
    async fn goto(&mut self, url: &str) -> BrowserResult<()> {
        let params = NavigateParams::builder()
            .url(url)
            .build()
            .map_err(BrowserError::Configuration)?;
        let page = self.page()?;
        page.goto(params)
            .await
            .map_err(|err| BrowserError::Navigation {
                url: url.to_string(),
                reason: err.to_string(),
            })?;
        page.wait_for_navigation().await?;
        Ok(())
    }

    async fn reload(&mut self) -> BrowserResult<()> {
        let page = self.page()?;
        page.reload().await?;
        page.wait_for_navigation().await?;
        Ok(())
    }

    async fn current_url(&mut self) -> BrowserResult<String> {
        Ok(self.page()?.url().await?.unwrap_or_default())
    }

    async fn title(&mut self) -> BrowserResult<String> {
        Ok(self.page()?.get_title().await?.unwrap_or_default())
    }

    async fn content(&mut self) -> BrowserResult<String> {
        Ok(self.page()?.content().await?)
    }

    async fn click(&mut self, selector: &str) -> BrowserResult<bool> {
        let Some(page) = self.page.as_ref() else {
            return Err(BrowserError::SessionClosed);
        };
        let element = match tokio::time::timeout(self.element_timeout, page.find_element(selector)).await {
            Ok(Ok(element)) => element,
            Ok(Err(err)) => {
                debug!(selector, error = %err, "click target not found");
                return Ok(false);
            }
            Err(_) => {
                debug!(selector, "click target lookup timed out");
                return Ok(false);
            }
        };
        self.motion.click_element(page, &element).await?;
        Ok(true)
    }

    async fn scroll(&mut self, target: &ScrollTarget, delta_y: f64) -> BrowserResult<()> {
        let host = scroll_host(target);
        for step in self.motion.scroll_steps(delta_y) {
            self.run_script(format!(
                "(() => {{ {host}.scrollBy({{ top: {step}, behavior: 'smooth' }}); return true; }})()"
            ))
            .await?;
            tokio::time::sleep(Duration::from_millis(120)).await;
        }
        Ok(())
    }

    async fn scroll_to_bottom(&mut self, target: &ScrollTarget) -> BrowserResult<()> {
        let host = scroll_host(target);
        self.run_script(format!(
            "(() => {{ const el = {host}; el.scrollTo({{ top: el.scrollHeight, behavior: 'smooth' }}); return true; }})()"
        ))
        .await?;
        Ok(())
    }

    async fn scroll_height(&mut self, target: &ScrollTarget) -> BrowserResult<f64> {
        let host = scroll_host(target);
        let value = self
            .run_script(format!("(() => {host}.scrollHeight)()"))
            .await?;
        value
            .as_f64()
            .ok_or_else(|| BrowserError::Malformed(format!("scroll height was {value}")))
    }

    async fn cookies(&mut self) -> BrowserResult<Vec<StoredCookie>> {
        let cookies = self.page()?.get_cookies().await?;
        Ok(cookies
            .into_iter()
            .map(|cookie| StoredCookie {
                name: cookie.name,
                value: cookie.value,
                domain: Some(cookie.domain),
                path: Some(cookie.path),
                expires: (cookie.expires > 0.0).then_some(cookie.expires),
                http_only: cookie.http_only,
                secure: cookie.secure,
            })
            .collect())
    }

    async fn set_cookies(&mut self, cookies: &[StoredCookie]) -> BrowserResult<()> {
        let params = cookies
            .iter()
            .map(|cookie| {
                let mut param = CookieParam::new(cookie.name.clone(), cookie.value.clone());
                param.domain = Some(
                    cookie
                        .domain
                        .clone()
                        .unwrap_or_else(|| self.cookie_domain.clone()),
                );
                param.path = Some(cookie.path.clone().unwrap_or_else(|| "/".into()));
                param.expires = cookie.expires.map(TimeSinceEpoch::new);
                param.http_only = Some(cookie.http_only);
                param.secure = Some(cookie.secure);
                param
            })
            .collect::<Vec<_>>();
        self.page()?.set_cookies(params).await?;
        Ok(())
    }

    async fn next_response(&mut self, wait: Duration) -> BrowserResult<Option<CapturedResponse>> {
        let capture = self.capture.as_mut().ok_or(BrowserError::SessionClosed)?;
        let receiver = capture.receiver();
        if wait.is_zero() {
            return match receiver.try_recv() {
                Ok(response) => Ok(Some(response)),
                Err(TryRecvError::Empty) => Ok(None),
                Err(TryRecvError::Disconnected) => {
                    Err(BrowserError::Network("response capture stopped".into()))
                }
            };
        }
        match tokio::time::timeout(wait, receiver.recv()).await {
            Ok(Some(response)) => Ok(Some(response)),
            Ok(None) => Err(BrowserError::Network("response capture stopped".into())),
            Err(_) => Ok(None),
        }
    }

    async fn close(&mut self) -> BrowserResult<()> {
        let Some(mut browser) = self.browser.take() else {
            return Ok(());
        };
        info!(port = self.port, "Shutting down Chromium instance");
        if let Some(capture) = self.capture.take() {
            capture.stop();
        }
        self.page = None;
        if let Err(err) = browser.close().await {
            warn!(error = %err, "Failed to close browser gracefully");
        }
        if let Err(err) = browser.wait().await {
            debug!(error = %err, "browser process wait failed");
        }
        if let Some(handle) = self.handler_task.take() {
            match tokio::time::timeout(Duration::from_secs(5), handle).await {
                Ok(Err(err)) => warn!(error = %err, "Browser handler join error"),
                Err(_) => warn!("Browser handler did not stop in time"),
                Ok(Ok(())) => {}
            }
        }
        self.profile = None;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.browser.is_none()
    }
}

impl Drop for BrowserSession {
    fn drop(&mut self) {
        if self.browser.is_some() {
            warn!(port = self.port, "BrowserSession dropped without explicit close");
            if let Some(handle) = self.handler_task.take() {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scroll_host_quotes_selectors() {
        let host = scroll_host(&ScrollTarget::Element(".note-scroller".into()));
        assert!(host.contains(r#"document.querySelector(".note-scroller")"#));
        assert!(scroll_host(&ScrollTarget::Window).contains("scrollingElement"));
    }

    #[test]
    fn chromium_config_builds_for_configured_port() {
        let mut config = SessionSection::default();
        config.port = 9333;
        config.proxy = Some("http://127.0.0.1:7890".into());
        config.executable_path = Some("/usr/bin/chromium".into());
        let launcher = SessionLauncher::new(config, MotionSection::default());
        let dir = tempfile::tempdir().unwrap();
        let profile = BrowserProfile::Persistent(dir.path().to_path_buf());
        assert!(launcher.build_chromium_config(&profile, DEFAULT_USER_AGENT).is_ok());
    }
}
