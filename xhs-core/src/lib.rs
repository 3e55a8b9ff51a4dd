pub mod browser;
pub mod comments;
pub mod config;
pub mod crawler;
pub mod credentials;
pub mod detail;
pub mod dom;
pub mod error;
pub mod login;
pub mod pacing;
pub mod retry;
pub mod search;

pub use browser::{
    BrowserError, BrowserResult, BrowserSession, CapturedResponse, CrawlMetrics, ErrorClass,
    PageDriver, ScrollTarget, SessionLauncher,
};
pub use comments::{Comment, CommentCollector};
pub use config::{
    load_crawler_config, CommentSection, CrawlerConfig, CredentialSection, LoginSection,
    MotionSection, PacingSection, SearchSection, SessionSection,
};
pub use crawler::{StopHandle, XhsCrawler};
pub use credentials::{CredentialError, CredentialSet, CredentialStore, SaveOutcome, StoredCookie};
pub use detail::{DetailExtractor, NoteDetail, NoteStats};
pub use error::{ConfigError, Result};
pub use login::{LoginGate, LoginMachine, LoginPhase, LoginStatus, RiskSignal};
pub use pacing::{PacedPage, PacingGovernor};
pub use retry::RetryPolicy;
pub use search::{
    Distance, NoteTypeFilter, SearchPager, SearchQuery, SearchResultItem, SearchScope, SortMode,
    TimeRange,
};
