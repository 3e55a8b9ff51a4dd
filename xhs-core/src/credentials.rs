//! Cookie persistence with an explicit, opt-in fallback chain.
//!
//! Nothing is read or written unless a task or global path is configured.
//! Candidates are tried in order: task path, global path, then
//! `cookies_backup.json` next to the first configured path.

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::CredentialSection;

pub const BACKUP_FILE_NAME: &str = "cookies_backup.json";

/// Files shorter than this cannot hold a cookie list.
const MIN_FILE_LEN: usize = 3;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("failed to access credentials {path}: {source}")]
    Io { source: io::Error, path: PathBuf },
    #[error("invalid credential file {path}: {source}")]
    Json {
        source: serde_json::Error,
        path: PathBuf,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredCookie {
    pub name: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, alias = "expiry", skip_serializing_if = "Option::is_none")]
    pub expires: Option<f64>,
    #[serde(default)]
    pub http_only: bool,
    #[serde(default)]
    pub secure: bool,
}

impl StoredCookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: None,
            path: None,
            expires: None,
            http_only: false,
            secure: false,
        }
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CredentialSet {
    pub cookies: Vec<StoredCookie>,
    pub captured_at: DateTime<Utc>,
    /// File the set was loaded from; `None` for sets captured from the browser.
    pub source_path: Option<PathBuf>,
}

impl CredentialSet {
    pub fn captured(cookies: Vec<StoredCookie>) -> Self {
        Self {
            cookies,
            captured_at: Utc::now(),
            source_path: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    pub fn cookie(&self, name: &str) -> Option<&StoredCookie> {
        self.cookies.iter().find(|cookie| cookie.name == name)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CredentialEnvelope {
    captured_at: DateTime<Utc>,
    cookies: Vec<StoredCookie>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CredentialFile {
    Envelope(CredentialEnvelope),
    Bare(Vec<StoredCookie>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateKind {
    Task,
    Global,
    Backup,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved(Vec<PathBuf>),
    NotConfigured,
    Empty,
    Suppressed,
}

#[derive(Debug, Clone, Default)]
pub struct CredentialStore {
    task_path: Option<PathBuf>,
    global_path: Option<PathBuf>,
    suppressed: bool,
}

impl CredentialStore {
    pub fn new(config: &CredentialSection) -> Self {
        Self {
            task_path: config.task_path.clone(),
            global_path: config.global_path.clone(),
            suppressed: false,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.task_path.is_some() || self.global_path.is_some()
    }

    /// While suppressed, `save` is a no-op so guest cookies never replace good ones.
    pub fn set_suppressed(&mut self, suppressed: bool) {
        self.suppressed = suppressed;
    }

    pub fn is_suppressed(&self) -> bool {
        self.suppressed
    }

    pub fn backup_path(&self) -> Option<PathBuf> {
        let anchor = self.task_path.as_ref().or(self.global_path.as_ref())?;
        let dir = anchor.parent().unwrap_or_else(|| Path::new(""));
        Some(dir.join(BACKUP_FILE_NAME))
    }

    pub fn candidates(&self) -> Vec<(CandidateKind, PathBuf)> {
        let mut candidates = Vec::with_capacity(3);
        if let Some(path) = &self.task_path {
            candidates.push((CandidateKind::Task, path.clone()));
        }
        if let Some(path) = &self.global_path {
            candidates.push((CandidateKind::Global, path.clone()));
        }
        if let Some(path) = self.backup_path() {
            if !candidates.iter().any(|(_, existing)| *existing == path) {
                candidates.push((CandidateKind::Backup, path));
            }
        }
        candidates
    }

    /// First non-empty, parseable set along the fallback chain.
    pub async fn load(&self) -> Option<CredentialSet> {
        for (kind, path) in self.candidates() {
            let set = match read_set(&path).await {
                Ok(Some(set)) => set,
                Ok(None) => continue,
                Err(err) => {
                    warn!(error = %err, ?kind, "skipping unreadable credential candidate");
                    continue;
                }
            };
            info!(path = %path.display(), ?kind, cookies = set.cookies.len(), "loaded credentials");
            if kind != CandidateKind::Task {
                if let Some(task_path) = &self.task_path {
                    match write_atomic(task_path, &set).await {
                        Ok(()) => debug!(path = %task_path.display(), "synced credentials to task path"),
                        Err(err) => warn!(error = %err, "failed to sync credentials to task path"),
                    }
                }
            }
            return Some(set);
        }
        None
    }

    /// Writes to the task path and mirrors to the global path.
    ///
    /// Every configured target is attempted; the first failure is returned
    /// after the rest have been tried.
    pub async fn save(&self, set: &CredentialSet) -> Result<SaveOutcome, CredentialError> {
        if self.suppressed {
            debug!("credential save suppressed");
            return Ok(SaveOutcome::Suppressed);
        }
        if !self.is_configured() {
            return Ok(SaveOutcome::NotConfigured);
        }
        if set.is_empty() {
            return Ok(SaveOutcome::Empty);
        }
        let mut written = Vec::new();
        let mut first_error = None;
        for path in [&self.task_path, &self.global_path].into_iter().flatten() {
            match write_atomic(path, set).await {
                Ok(()) => written.push(path.clone()),
                Err(err) => {
                    warn!(error = %err, "failed to persist credentials");
                    first_error.get_or_insert(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => {
                info!(targets = written.len(), cookies = set.cookies.len(), "saved credentials");
                Ok(SaveOutcome::Saved(written))
            }
        }
    }
}

async fn read_set(path: &Path) -> Result<Option<CredentialSet>, CredentialError> {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(CredentialError::Io {
                source,
                path: path.to_path_buf(),
            })
        }
    };
    if raw.trim().len() < MIN_FILE_LEN {
        return Ok(None);
    }
    let file: CredentialFile = serde_json::from_str(&raw).map_err(|source| CredentialError::Json {
        source,
        path: path.to_path_buf(),
    })?;
    let (cookies, captured_at) = match file {
        CredentialFile::Envelope(envelope) => (envelope.cookies, envelope.captured_at),
        CredentialFile::Bare(cookies) => (cookies, Utc::now()),
    };
    if cookies.is_empty() {
        return Ok(None);
    }
    Ok(Some(CredentialSet {
        cookies,
        captured_at,
        source_path: Some(path.to_path_buf()),
    }))
}

async fn write_atomic(path: &Path, set: &CredentialSet) -> Result<(), CredentialError> {
    let io_err = |source| CredentialError::Io {
        source,
        path: path.to_path_buf(),
    };
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
    }
    let envelope = CredentialEnvelope {
        captured_at: set.captured_at,
        cookies: set.cookies.clone(),
    };
    let body = serde_json::to_vec_pretty(&envelope).map_err(|source| CredentialError::Json {
        source,
        path: path.to_path_buf(),
    })?;
    let mut tmp: OsString = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, body).await.map_err(io_err)?;
    tokio::fs::rename(&tmp, path).await.map_err(io_err)?;
    Ok(())
}
