use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tempfile::TempDir;

use crate::config::SessionSection;

use super::error::{BrowserError, BrowserResult};

/// User data directory backing one browser session.
#[derive(Debug)]
pub enum BrowserProfile {
    Persistent(PathBuf),
    /// Removed from disk when dropped.
    Disposable(TempDir),
}

impl BrowserProfile {
    pub fn path(&self) -> &Path {
        match self {
            BrowserProfile::Persistent(path) => path,
            BrowserProfile::Disposable(dir) => dir.path(),
        }
    }

    pub fn is_disposable(&self) -> bool {
        matches!(self, BrowserProfile::Disposable(_))
    }
}

#[derive(Debug, Clone)]
pub struct ProfileManager {
    scratch_dir: PathBuf,
    ttl: Duration,
}

impl ProfileManager {
    pub fn new<P: AsRef<Path>>(scratch_dir: P, ttl: Duration) -> Self {
        Self {
            scratch_dir: scratch_dir.as_ref().to_path_buf(),
            ttl,
        }
    }

    pub fn from_config(config: &SessionSection) -> Self {
        Self::new(
            &config.scratch_dir,
            Duration::from_secs(config.scratch_ttl_hours * 60 * 60),
        )
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    /// The configured directory, created if missing. `None` when no profile dir was given.
    pub fn persistent(&self, dir: Option<&Path>) -> BrowserResult<Option<BrowserProfile>> {
        let Some(dir) = dir else {
            return Ok(None);
        };
        std::fs::create_dir_all(dir).map_err(|err| {
            BrowserError::Profile(format!("failed to create profile dir {}: {err}", dir.display()))
        })?;
        Ok(Some(BrowserProfile::Persistent(dir.to_path_buf())))
    }

    pub fn disposable(&self, port: u16) -> BrowserResult<BrowserProfile> {
        std::fs::create_dir_all(&self.scratch_dir).map_err(|err| {
            BrowserError::Profile(format!("failed to create scratch dir: {err}"))
        })?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("task_port_{port}_"))
            .tempdir_in(&self.scratch_dir)
            .map_err(|err| {
                BrowserError::Profile(format!("failed to create disposable profile: {err}"))
            })?;
        Ok(BrowserProfile::Disposable(dir))
    }

    /// Removes disposable profiles left behind by crashed sessions.
    pub fn cleanup_expired(&self) -> BrowserResult<usize> {
        if !self.scratch_dir.exists() {
            return Ok(0);
        }
        let now = SystemTime::now();
        let entries = std::fs::read_dir(&self.scratch_dir).map_err(|err| {
            BrowserError::Profile(format!("failed to list scratch directory: {err}"))
        })?;
        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "failed to read profile metadata");
                    continue;
                }
            };
            if let Ok(modified) = metadata.modified() {
                if now.duration_since(modified).unwrap_or(Duration::ZERO) > self.ttl {
                    match std::fs::remove_dir_all(&path) {
                        Ok(()) => removed += 1,
                        Err(err) => {
                            tracing::warn!(path = %path.display(), error = %err, "failed to remove expired profile")
                        }
                    }
                }
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disposable_profile_is_removed_on_drop() {
        let base = tempfile::tempdir().unwrap();
        let manager = ProfileManager::new(base.path().join("_tmp_sessions"), Duration::from_secs(60));
        let profile = manager.disposable(9222).unwrap();
        let path = profile.path().to_path_buf();
        assert!(profile.is_disposable());
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("task_port_9222_"));
        assert!(path.exists());
        drop(profile);
        assert!(!path.exists());
    }

    #[test]
    fn missing_profile_dir_means_no_persistent_profile() {
        let manager = ProfileManager::new("unused", Duration::from_secs(60));
        assert!(manager.persistent(None).unwrap().is_none());
    }

    #[test]
    fn cleanup_tolerates_missing_scratch_dir() {
        let base = tempfile::tempdir().unwrap();
        let manager = ProfileManager::new(base.path().join("absent"), Duration::ZERO);
        assert_eq!(manager.cleanup_expired().unwrap(), 0);
    }
}
