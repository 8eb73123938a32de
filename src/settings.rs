//! Operator settings persisted between sessions.
//!
//! Settings are a flat JSON document. Every field has a default, so files
//! written by older versions (or edited by hand) keep loading.
//!
//! [`Settings::load`] never fails: a missing file means "first run" and a
//! malformed one is logged and replaced by defaults. Use
//! [`Settings::load_strict`] to surface the [`ConfigError`] instead.

use crate::config::HeadingConfig;
use crate::error::ConfigError;
use crate::model::RecoveryInfo;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const APP_DIR: &str = "convo-archiver";
const SETTINGS_FILE: &str = "settings.json";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Last archive the operator appended to.
    pub destination: Option<PathBuf>,
    /// Last export platform used.
    pub platform: Option<String>,
    pub headings: HeadingConfig,
    pub mappings_dir: Option<PathBuf>,
    pub render_url: Option<String>,
    pub render_command: Option<Vec<String>>,
    /// Pre-filled into new recovery pages. Only the fields that do not
    /// depend on the export file are meaningful here.
    pub recovery: RecoveryInfo,
}

impl Settings {
    /// `<config dir>/convo-archiver/settings.json`, if the platform has a
    /// config directory.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join(APP_DIR).join(SETTINGS_FILE))
    }

    /// Load settings, falling back to defaults on any problem.
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            debug!("No settings at {}, using defaults", path.display());
            return Self::default();
        }
        match Self::load_strict(path) {
            Ok(settings) => settings,
            Err(e) => {
                warn!("{}; using default settings", e);
                Self::default()
            }
        }
    }

    pub fn load_strict(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        serde_json::from_str(&raw).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })
    }

    /// Write atomically: temp file in the same directory, then rename.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let write_err = |e: std::io::Error| ConfigError::Write {
            path: path.to_path_buf(),
            source: e,
        };
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir).map_err(write_err)?;

        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| ConfigError::Invalid(format!("settings not serialisable: {e}")))?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(write_err)?;
        tmp.write_all(&json).map_err(write_err)?;
        tmp.persist(path).map_err(|e| write_err(e.error))?;
        debug!("Saved settings to {}", path.display());
        Ok(())
    }

    /// Recovery defaults merged with the details of a specific export file.
    pub fn recovery_for(&self, platform: &str, export_path: &Path) -> RecoveryInfo {
        let base = RecoveryInfo::for_export(platform, export_path);
        RecoveryInfo {
            link: self.recovery.link.clone(),
            account: self.recovery.account.clone(),
            md_file_name: self.recovery.md_file_name.clone(),
            md_file_location: self.recovery.md_file_location.clone(),
            notes: self.recovery.notes.clone(),
            ..base
        }
    }
}
