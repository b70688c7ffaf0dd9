//! Cache configuration loaded from TOML and merged over defaults.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, CacheResult};
use crate::storage::FsyncMode;

const DEFAULT_ROOT: &str = "./cfcache";

/// Where and how the cache persists buffers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// On-disk root; one directory per cache key lives below it.
    pub root: PathBuf,
    pub fsync_mode: FsyncMode,
    /// Prime buffers reloaded from disk before handing them out.
    pub prime_on_load: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_ROOT),
            fsync_mode: FsyncMode::default(),
            prime_on_load: true,
        }
    }
}

impl CacheConfig {
    /// Defaults with a different root.
    #[must_use]
    pub fn with_root<P: Into<PathBuf>>(root: P) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    /// Parse a TOML document; absent keys keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Configuration`] when the document does not parse.
    pub fn from_toml_str(contents: &str) -> CacheResult<Self> {
        toml::from_str(contents).map_err(|e| CacheError::Configuration {
            path: PathBuf::from("<inline>"),
            reason: e.to_string(),
        })
    }

    /// Load `path` merged over the defaults. A missing file yields the
    /// defaults.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Io`] if the file exists but cannot be read and
    /// [`CacheError::Configuration`] if it does not parse.
    pub fn load_with_path<P: Into<PathBuf>>(path: P) -> CacheResult<Self> {
        let path = path.into();
        let mut config = Self::default();

        if path.exists() {
            let contents = fs::read_to_string(&path)
                .map_err(|e| CacheError::io("read cache config", &path, e))?;
            let user_config: Self =
                toml::from_str(&contents).map_err(|e| CacheError::Configuration {
                    path: path.clone(),
                    reason: e.to_string(),
                })?;
            config.merge(&user_config);
        }

        Ok(config)
    }

    /// Overlay `other` onto `self`. An empty root in `other` keeps ours.
    pub fn merge(&mut self, other: &Self) {
        if !other.root.as_os_str().is_empty() {
            self.root.clone_from(&other.root);
        }
        self.fsync_mode = other.fsync_mode;
        self.prime_on_load = other.prime_on_load;
    }

    /// Write the configuration as TOML, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Io`] on write failure and
    /// [`CacheError::Configuration`] if serialization fails.
    pub fn save(&self, path: &Path) -> CacheResult<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| CacheError::io("create config directory", parent, e))?;
        }
        let contents = toml::to_string_pretty(self).map_err(|e| CacheError::Configuration {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        fs::write(path, contents).map_err(|e| CacheError::io("write cache config", path, e))
    }

    /// Read a setting by name.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            "root" => Some(self.root.display().to_string()),
            "fsync_mode" => Some(fsync_mode_name(self.fsync_mode).to_string()),
            "prime_on_load" => Some(self.prime_on_load.to_string()),
            _ => None,
        }
    }

    /// Change a setting by name.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Configuration`] for an unknown key or a value
    /// that does not parse.
    pub fn set(&mut self, key: &str, value: &str) -> CacheResult<()> {
        let invalid = |reason: String| CacheError::Configuration {
            path: PathBuf::from(key),
            reason,
        };
        match key {
            "root" => {
                if value.trim().is_empty() {
                    return Err(invalid("root must not be empty".to_string()));
                }
                self.root = PathBuf::from(value.trim());
            }
            "fsync_mode" => {
                self.fsync_mode = match value.trim().to_lowercase().as_str() {
                    "per_write" => FsyncMode::PerWrite,
                    "per_batch" => FsyncMode::PerBatch,
                    "none" => FsyncMode::None,
                    other => return Err(invalid(format!("unknown fsync mode '{other}'"))),
                };
            }
            "prime_on_load" => {
                self.prime_on_load = match value.trim().to_lowercase().as_str() {
                    "true" | "1" | "yes" | "on" => true,
                    "false" | "0" | "no" | "off" => false,
                    other => return Err(invalid(format!("'{other}' is not a boolean"))),
                };
            }
            _ => return Err(invalid(format!("unknown configuration key: {key}"))),
        }
        Ok(())
    }
}

const fn fsync_mode_name(mode: FsyncMode) -> &'static str {
    match mode {
        FsyncMode::PerWrite => "per_write",
        FsyncMode::PerBatch => "per_batch",
        FsyncMode::None => "none",
    }
}
