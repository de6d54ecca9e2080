//! Persistent settings (`settings.toml`) consumed by the bridge and the diagnostic binary.
//!
//! Settings live in `<config dir>/cmdline-hook/settings.toml`; the directory can be
//! overridden with `CMDLINE_HOOK_CONFIG_DIR`. A missing file yields defaults.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::collaborators::{AutoAnswerMode, SettingsSource};

const SETTINGS_FILE: &str = "settings.toml";
const CONFIG_DIR_ENV: &str = "CMDLINE_HOOK_CONFIG_DIR";
const CONFIG_DIR_NAME: &str = "cmdline-hook";

/// User settings for one hooked session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// 0 = disabled, 1 = auto-deny, 2 = auto-accept.
    pub terminate_autoanswer: i64,
    /// Treat end-of-input (Ctrl-D) as the `exit` command.
    pub ctrld_exits: bool,
    /// Write the JSON trace log.
    pub logging: bool,
}

impl Settings {
    /// Load from the resolved settings path, falling back to defaults when absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        match settings_file_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    /// Load from an explicit path; a missing file yields defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read settings {}", path.display()))?;
        Self::parse(&contents).with_context(|| format!("invalid settings {}", path.display()))
    }

    /// Parse TOML settings text. Unknown keys are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error on malformed TOML or mistyped values.
    pub fn parse(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Render as TOML text.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string(self)?)
    }
}

impl SettingsSource for Settings {
    fn terminate_autoanswer(&self) -> AutoAnswerMode {
        AutoAnswerMode::from_setting(self.terminate_autoanswer)
    }

    fn ctrld_exits(&self) -> bool {
        self.ctrld_exits
    }
}

/// Resolve the settings directory.
pub fn config_dir() -> Option<PathBuf> {
    if let Ok(dir) = env::var(CONFIG_DIR_ENV) {
        let trimmed = dir.trim();
        if !trimmed.is_empty() {
            return Some(PathBuf::from(trimmed));
        }
    }
    dirs::config_dir().map(|dir| dir.join(CONFIG_DIR_NAME))
}

/// Resolve the full settings file path.
pub fn settings_file_path() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join(SETTINGS_FILE))
}
