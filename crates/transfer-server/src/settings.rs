use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error(
        "Interval must be between {} and {} seconds",
        RefreshSettings::MIN_INTERVAL,
        RefreshSettings::MAX_INTERVAL
    )]
    IntervalOutOfRange(i64),
    #[error("failed to persist settings: {0}")]
    Persist(#[from] std::io::Error),
    #[error("malformed settings file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// How often browser clients re-poll the file listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshSettings {
    pub enabled: bool,
    pub interval_seconds: u32,
}

impl Default for RefreshSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: 30,
        }
    }
}

impl RefreshSettings {
    pub const MIN_INTERVAL: i64 = 5;
    pub const MAX_INTERVAL: i64 = 300;

    pub fn validated(enabled: bool, interval_seconds: i64) -> Result<Self, SettingsError> {
        if !(Self::MIN_INTERVAL..=Self::MAX_INTERVAL).contains(&interval_seconds) {
            return Err(SettingsError::IntervalOutOfRange(interval_seconds));
        }
        Ok(Self {
            enabled,
            interval_seconds: interval_seconds as u32,
        })
    }
}

/// Operator-controlled configuration that outlives a single server run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    pub password: Option<String>,
    pub ip_approval: bool,
    pub refresh: RefreshSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            password: None,
            ip_approval: true,
            refresh: RefreshSettings::default(),
        }
    }
}

impl Settings {
    /// The configured shared secret; an empty string counts as unset.
    pub fn password(&self) -> Option<&str> {
        self.password.as_deref().filter(|p| !p.is_empty())
    }

    /// Password and IP-approval changes take effect only after a restart.
    pub fn requires_restart(&self, other: &Settings) -> bool {
        self.password() != other.password() || self.ip_approval != other.ip_approval
    }
}

/// Process-wide settings, observable through a watch channel and optionally
/// persisted as JSON.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    tx: watch::Sender<Settings>,
    path: Option<PathBuf>,
}

impl SettingsStore {
    /// In-memory store.
    pub fn new(initial: Settings) -> Self {
        let (tx, _) = watch::channel(initial);
        Self {
            inner: Arc::new(Inner { tx, path: None }),
        }
    }

    /// Load from `path` (missing file means defaults) and persist every update back to it.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, SettingsError> {
        let path = path.into();
        let settings = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Settings::default(),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), "loaded settings");
        let (tx, _) = watch::channel(settings);
        Ok(Self {
            inner: Arc::new(Inner {
                tx,
                path: Some(path),
            }),
        })
    }

    pub fn current(&self) -> Settings {
        self.inner.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Settings> {
        self.inner.tx.subscribe()
    }

    /// Apply `f`; subscribers are woken and the file rewritten only if something changed.
    pub fn update(&self, f: impl FnOnce(&mut Settings)) -> Result<Settings, SettingsError> {
        let mut changed = false;
        self.inner.tx.send_if_modified(|settings| {
            let before = settings.clone();
            f(settings);
            changed = *settings != before;
            changed
        });
        let current = self.current();
        if changed {
            self.persist(&current)?;
        }
        Ok(current)
    }

    pub fn set_refresh(&self, refresh: RefreshSettings) -> Result<Settings, SettingsError> {
        self.update(|s| s.refresh = refresh)
    }

    pub fn set_password(&self, password: Option<String>) -> Result<Settings, SettingsError> {
        self.update(|s| s.password = password.filter(|p| !p.is_empty()))
    }

    pub fn set_ip_approval(&self, enabled: bool) -> Result<Settings, SettingsError> {
        self.update(|s| s.ip_approval = enabled)
    }

    fn persist(&self, settings: &Settings) -> Result<(), SettingsError> {
        let Some(path) = &self.inner.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(settings)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        info!(path = %path.display(), "settings saved");
        Ok(())
    }
}
