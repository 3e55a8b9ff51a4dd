mod capture;
mod driver;
mod error;
mod metrics;
mod motion;
mod profile;
mod session;

pub use capture::ResponseCapture;
pub use driver::{CapturedResponse, PageDriver, ScrollTarget};
pub use error::{BrowserError, BrowserResult, ErrorClass};
pub use metrics::CrawlMetrics;
pub use motion::{HumanMotion, MouseStep};
pub use profile::{BrowserProfile, ProfileManager};
pub use session::{BrowserSession, SessionLauncher};
