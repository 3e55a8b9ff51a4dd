use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};

pub const DEFAULT_CONTROL_PORT: u16 = 9222;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CrawlerConfig {
    pub session: SessionSection,
    pub credentials: CredentialSection,
    pub login: LoginSection,
    pub pacing: PacingSection,
    pub motion: MotionSection,
    pub search: SearchSection,
    pub comments: CommentSection,
}

impl CrawlerConfig {
    /// Config for tests and dry runs: every delay collapsed to zero.
    pub fn without_delays() -> Self {
        let mut config = Self::default();
        config.pacing = PacingSection::zero();
        config.motion = MotionSection::zero();
        config.search.response_settle_ms = 0;
        config.search.settle_after_action_ms = 0;
        config.comments.settle_after_expand_ms = 0;
        config.login.poll_interval_ms = 0;
        config
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    pub executable_path: Option<String>,
    pub headless: bool,
    pub port: u16,
    pub profile_dir: Option<PathBuf>,
    /// Parent directory for disposable fallback profiles.
    pub scratch_dir: PathBuf,
    pub scratch_ttl_hours: u64,
    pub proxy: Option<String>,
    pub user_agent: Option<String>,
    pub window: [u32; 2],
    pub lang: Option<String>,
    pub request_timeout_seconds: u64,
    pub element_timeout_ms: u64,
    /// Substring a response URL must contain to be captured at all.
    pub listen_scope: String,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            executable_path: None,
            headless: false,
            port: DEFAULT_CONTROL_PORT,
            profile_dir: None,
            scratch_dir: PathBuf::from("profiles/_tmp_sessions"),
            scratch_ttl_hours: 24,
            proxy: None,
            user_agent: None,
            window: [1366, 768],
            lang: Some("zh-CN".into()),
            request_timeout_seconds: 30,
            element_timeout_ms: 1_500,
            listen_scope: "xiaohongshu.com".into(),
        }
    }
}

/// Cookie persistence is opt-in: both paths default to `None`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CredentialSection {
    pub task_path: Option<PathBuf>,
    pub global_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoginSection {
    pub home_url: String,
    pub poll_interval_ms: u64,
    /// `None` waits for the human indefinitely.
    pub wait_timeout_seconds: Option<u64>,
    pub wait_when_headless: bool,
    pub accept_token_cookie: bool,
    pub identity_selectors: Vec<String>,
    pub prompt_selectors: Vec<String>,
    pub prompt_texts: Vec<String>,
    pub popup_close_selectors: Vec<String>,
}

impl Default for LoginSection {
    fn default() -> Self {
        Self {
            home_url: "https://www.xiaohongshu.com".into(),
            poll_interval_ms: 2_000,
            wait_timeout_seconds: None,
            wait_when_headless: false,
            accept_token_cookie: true,
            identity_selectors: strings(&[
                "#user-avatar",
                ".user-side-content",
                ".side-bar .user .avatar-wrapper",
                ".side-bar .user .user-name",
                "a.user[href*='/user/profile/'] .avatar-wrapper",
            ]),
            prompt_selectors: strings(&[
                ".login-container",
                ".login-modal",
                ".login-btn",
                ".side-bar-component .login-btn",
            ]),
            prompt_texts: strings(&["登录", "登录注册"]),
            popup_close_selectors: strings(&[".close-icon", "[class*='close-circle']", ".icon-close"]),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PacingSection {
    pub navigation_delay_ms: [u64; 2],
    pub click_delay_ms: [u64; 2],
    pub scroll_delay_ms: [u64; 2],
    pub page_pause_ms: [u64; 2],
    pub warm_up_ms: [u64; 2],
    /// A long rest happens every N pages, N drawn from this range.
    pub long_rest_every_pages: [u32; 2],
    pub long_rest_ms: [u64; 2],
    pub time_of_day_scaling: bool,
}

impl PacingSection {
    pub fn zero() -> Self {
        Self {
            navigation_delay_ms: [0, 0],
            click_delay_ms: [0, 0],
            scroll_delay_ms: [0, 0],
            page_pause_ms: [0, 0],
            warm_up_ms: [0, 0],
            long_rest_every_pages: [0, 0],
            long_rest_ms: [0, 0],
            time_of_day_scaling: false,
        }
    }
}

impl Default for PacingSection {
    fn default() -> Self {
        Self {
            navigation_delay_ms: [1_200, 3_200],
            click_delay_ms: [350, 1_100],
            scroll_delay_ms: [280, 900],
            page_pause_ms: [1_800, 4_500],
            warm_up_ms: [1_500, 4_000],
            long_rest_every_pages: [5, 9],
            long_rest_ms: [25_000, 80_000],
            time_of_day_scaling: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MotionSection {
    pub mouse_speed_px_s: [u32; 2],
    pub mouse_jitter_px: u32,
    pub click_hesitation_ms: [u32; 2],
    pub scroll_step_px: [u32; 2],
}

impl MotionSection {
    pub fn zero() -> Self {
        Self {
            mouse_speed_px_s: [100_000, 100_000],
            mouse_jitter_px: 0,
            click_hesitation_ms: [0, 0],
            scroll_step_px: [600, 600],
        }
    }
}

impl Default for MotionSection {
    fn default() -> Self {
        Self {
            mouse_speed_px_s: [700, 1_600],
            mouse_jitter_px: 3,
            click_hesitation_ms: [60, 220],
            scroll_step_px: [600, 1_400],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SearchSection {
    pub base_url: String,
    /// Upper bound on waiting for the search endpoint after a page action.
    pub page_wait_seconds: u64,
    pub poll_timeout_ms: u64,
    /// Extra listening window after the first item-bearing response.
    pub response_settle_ms: u64,
    pub settle_after_action_ms: u64,
    /// Pagination re-triggers before a page is given up as lost.
    pub max_page_retries: usize,
    pub start_attempts: usize,
    pub start_retry_delay_ms: u64,
    pub micro_scroll_probability: f64,
}

impl Default for SearchSection {
    fn default() -> Self {
        Self {
            base_url: "https://www.xiaohongshu.com".into(),
            page_wait_seconds: 15,
            poll_timeout_ms: 1_000,
            response_settle_ms: 2_000,
            settle_after_action_ms: 2_000,
            max_page_retries: 3,
            start_attempts: 3,
            start_retry_delay_ms: 2_000,
            micro_scroll_probability: 0.4,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CommentSection {
    pub default_scrolls: usize,
    pub max_scrolls: usize,
    pub comments_per_scroll: u32,
    /// Consecutive scrolls without new blocks before scrolling stops.
    pub stable_rounds: usize,
    pub expand_replies: bool,
    pub min_reply_count: u32,
    pub settle_after_expand_ms: u64,
    pub detail_attempts: usize,
    pub detail_retry_delay_ms: u64,
}

impl Default for CommentSection {
    fn default() -> Self {
        Self {
            default_scrolls: 2,
            max_scrolls: 20,
            comments_per_scroll: 12,
            stable_rounds: 2,
            expand_replies: true,
            min_reply_count: 1,
            settle_after_expand_ms: 2_000,
            detail_attempts: 3,
            detail_retry_delay_ms: 2_000,
        }
    }
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}

pub fn load_crawler_config<P: AsRef<Path>>(path: P) -> Result<CrawlerConfig> {
    let config: CrawlerConfig = load_toml(path)?;
    config.validate()?;
    Ok(config)
}

fn check_bounds<T: PartialOrd>(field: &'static str, bounds: [T; 2]) -> Result<()> {
    if bounds[0] > bounds[1] {
        return Err(ConfigError::invalid(field, "lower bound exceeds upper bound"));
    }
    Ok(())
}

impl CrawlerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.session.port == 0 {
            return Err(ConfigError::invalid("session.port", "control port must be non-zero"));
        }
        if self.session.window.contains(&0) {
            return Err(ConfigError::invalid("session.window", "window dimensions must be non-zero"));
        }
        for (field, raw) in [
            ("login.home_url", &self.login.home_url),
            ("search.base_url", &self.search.base_url),
        ] {
            url::Url::parse(raw).map_err(|err| ConfigError::invalid(field, err.to_string()))?;
        }
        check_bounds("pacing.navigation_delay_ms", self.pacing.navigation_delay_ms)?;
        check_bounds("pacing.click_delay_ms", self.pacing.click_delay_ms)?;
        check_bounds("pacing.scroll_delay_ms", self.pacing.scroll_delay_ms)?;
        check_bounds("pacing.page_pause_ms", self.pacing.page_pause_ms)?;
        check_bounds("pacing.warm_up_ms", self.pacing.warm_up_ms)?;
        check_bounds("pacing.long_rest_every_pages", self.pacing.long_rest_every_pages)?;
        check_bounds("pacing.long_rest_ms", self.pacing.long_rest_ms)?;
        check_bounds("motion.mouse_speed_px_s", self.motion.mouse_speed_px_s)?;
        check_bounds("motion.click_hesitation_ms", self.motion.click_hesitation_ms)?;
        check_bounds("motion.scroll_step_px", self.motion.scroll_step_px)?;
        if !(0.0..=1.0).contains(&self.search.micro_scroll_probability) {
            return Err(ConfigError::invalid(
                "search.micro_scroll_probability",
                "must be within 0.0..=1.0",
            ));
        }
        if self.comments.max_scrolls == 0 {
            return Err(ConfigError::invalid("comments.max_scrolls", "must allow at least one scroll"));
        }
        Ok(())
    }
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_fixture_config() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs/crawler.toml");
        let config = load_crawler_config(path).expect("fixture should parse");
        assert_eq!(config.session.port, 9333);
        assert!(config.session.headless);
        assert_eq!(
            config.credentials.task_path.as_deref(),
            Some(Path::new("data/task-42/cookies.json"))
        );
        assert_eq!(config.search.max_page_retries, 3);
        assert_eq!(config.comments.max_scrolls, 12);
        assert_eq!(config.pacing.navigation_delay_ms, [1500, 3500]);
    }

    #[test]
    fn empty_document_uses_defaults_without_credential_paths() {
        let config: CrawlerConfig = toml::from_str("").unwrap();
        assert_eq!(config.session.port, DEFAULT_CONTROL_PORT);
        assert!(config.credentials.task_path.is_none());
        assert!(config.credentials.global_path.is_none());
        assert!(config.login.wait_timeout_seconds.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn inverted_delay_bounds_are_rejected() {
        let config: CrawlerConfig = toml::from_str("[pacing]\nclick_delay_ms = [900, 100]").unwrap();
        match config.validate() {
            Err(ConfigError::Invalid { field, .. }) => assert_eq!(field, "pacing.click_delay_ms"),
            other => panic!("expected invalid bounds, got {other:?}"),
        }
        assert!(CrawlerConfig::without_delays().validate().is_ok());
    }
}
