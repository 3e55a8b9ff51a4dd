use thiserror::Error;

pub type BrowserResult<T> = Result<T, BrowserError>;

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("chromium launch failed: {0}")]
    Launch(String),
    #[error("cdp error: {0}")]
    Cdp(#[from] chromiumoxide::error::CdpError),
    #[error("timeout waiting for {0}")]
    Timeout(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("profile error: {0}")]
    Profile(String),
    #[error("navigation failed for {url}: {reason}")]
    Navigation { url: String, reason: String },
    #[error("network capture error: {0}")]
    Network(String),
    #[error("malformed page payload: {0}")]
    Malformed(String),
    #[error("login required: {0}")]
    LoginRequired(String),
    #[error("risk restriction ({code}): {message}")]
    RiskRestricted { code: String, message: String },
    #[error("ambiguous page structure: {0}")]
    Ambiguous(String),
    #[error("session closed")]
    SessionClosed,
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

/// Recovery class of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Element/response missing or malformed; retried or omitted locally.
    Transient,
    /// Unauthenticated or risk-restricted session; needs a human.
    Access,
    /// Browser unreachable or unusable; fatal to the call.
    Session,
    /// Page structure did not allow a safe action; the action is skipped.
    Ambiguity,
}

impl BrowserError {
    pub fn class(&self) -> ErrorClass {
        match self {
            BrowserError::Timeout(_)
            | BrowserError::Network(_)
            | BrowserError::Malformed(_)
            | BrowserError::Navigation { .. } => ErrorClass::Transient,
            BrowserError::LoginRequired(_) | BrowserError::RiskRestricted { .. } => {
                ErrorClass::Access
            }
            BrowserError::Ambiguous(_) => ErrorClass::Ambiguity,
            BrowserError::Cdp(err) => {
                if err.to_string().to_lowercase().contains("timeout") {
                    ErrorClass::Transient
                } else {
                    ErrorClass::Session
                }
            }
            BrowserError::Launch(_)
            | BrowserError::Configuration(_)
            | BrowserError::Profile(_)
            | BrowserError::SessionClosed
            | BrowserError::Unexpected(_) => ErrorClass::Session,
        }
    }

    pub fn is_access_fault(&self) -> bool {
        self.class() == ErrorClass::Access
    }
}
