//! Optional settings file.
//!
//! A `.punchclock.toml` at the repository root (or any file passed with
//! `--config`) supplies defaults for flags that were not given on the
//! command line.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::commit::IdentityOverride;
use crate::schedule::{self, WorkHours, parse_time};

/// File name looked up at the repository root.
pub const DEFAULT_FILE: &str = ".punchclock.toml";

pub const DEFAULT_WORK_START: &str = "09:00";
pub const DEFAULT_WORK_END: &str = "17:00";
pub const DEFAULT_JITTER: u32 = 15;

/// The settings file. Every key is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Start of the working day (`HH:MM`)
    pub work_start: Option<String>,

    /// End of the working day (`HH:MM`)
    pub work_end: Option<String>,

    /// Jitter bound in minutes
    pub jitter: Option<u32>,

    pub skip_weekends: Option<bool>,

    pub author_name: Option<String>,

    pub author_email: Option<String>,

    /// Create a backup branch before rewriting
    pub backup: Option<bool>,
}

impl Config {
    /// Parse settings from TOML content.
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Read settings from `path`.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml(&content).map_err(|e| Error::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Layer `over` on top of `self`. Keys set in `over` win.
    pub fn merged(self, over: Config) -> Config {
        Config {
            work_start: over.work_start.or(self.work_start),
            work_end: over.work_end.or(self.work_end),
            jitter: over.jitter.or(self.jitter),
            skip_weekends: over.skip_weekends.or(self.skip_weekends),
            author_name: over.author_name.or(self.author_name),
            author_email: over.author_email.or(self.author_email),
            backup: over.backup.or(self.backup),
        }
    }

    pub fn work_hours(&self) -> Result<WorkHours, schedule::Error> {
        let start = parse_time(self.work_start.as_deref().unwrap_or(DEFAULT_WORK_START))?;
        let end = parse_time(self.work_end.as_deref().unwrap_or(DEFAULT_WORK_END))?;
        WorkHours::new(start, end)
    }

    pub fn jitter_minutes(&self) -> u32 {
        self.jitter.unwrap_or(DEFAULT_JITTER)
    }

    pub fn skips_weekends(&self) -> bool {
        self.skip_weekends.unwrap_or(true)
    }

    pub fn backs_up(&self) -> bool {
        self.backup.unwrap_or(true)
    }

    /// The identity override, if either half is set.
    pub fn identity(&self) -> Option<IdentityOverride> {
        let identity = IdentityOverride {
            name: self.author_name.clone(),
            email: self.author_email.clone(),
        };
        (!identity.is_empty()).then_some(identity)
    }

    /// Read `explicit` if given, else the default file under `repo_root` if
    /// it exists, else empty settings.
    pub fn discover(explicit: Option<&Path>, repo_root: &Path) -> Result<Self, Error> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        let fallback = repo_root.join(DEFAULT_FILE);
        if fallback.is_file() {
            tracing::debug!(path = %fallback.display(), "using settings file");
            Self::load(&fallback)
        } else {
            Ok(Self::default())
        }
    }
}

/// Errors loading the settings file.
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read settings file '{}'", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid settings file '{}'", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}
