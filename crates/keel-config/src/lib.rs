//! Configuration for Keel, loaded from `keel.toml`.
//!
//! Every field has a default, so an empty file (or no file at all) is a valid
//! configuration.

mod logging;
mod schema;

use std::path::{Path, PathBuf};
use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub use logging::{init_tracing, LoggingConfig};
pub use schema::json_schema;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse toml config: {0}")]
    Toml(String),
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        // The default `Display` embeds a snippet of the input; keep only the message.
        let message = err.message().to_owned();
        match err.span() {
            Some(span) => ConfigError::Toml(format!("{message} (at byte {})", span.start)),
            None => ConfigError::Toml(message),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
#[schemars(deny_unknown_fields)]
pub struct KeelConfig {
    pub logging: LoggingConfig,
    pub build_settings: BuildSettingsConfig,
}

impl KeelConfig {
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::load_from_str(&text)
    }

    pub fn load_from_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Looks for `keel.toml` (or `.keel.toml`) directly in `root`.
    pub fn discover(root: &Path) -> Option<PathBuf> {
        ["keel.toml", ".keel.toml"]
            .iter()
            .map(|name| root.join(name))
            .find(|candidate| candidate.is_file())
    }

    /// Loads the workspace config if one exists, otherwise returns the defaults.
    pub fn load_for_workspace(root: &Path) -> Result<Self, ConfigError> {
        match Self::discover(root) {
            Some(path) => Self::load_from_path(path),
            None => Ok(Self::default()),
        }
    }
}

/// When build targets get prepared (their dependencies built so semantic functionality
/// works).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum PreparationMode {
    /// Never prepare targets.
    Off,
    /// Prepare targets when a document in them is opened.
    #[default]
    Lazy,
    /// Additionally re-prepare dependents whenever files change.
    Eager,
}

/// How symlink-resolved main-file paths are mapped back to paths the build graph knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum PathStandardization {
    None,
    /// Strip macOS's `/private` prefix from `/private/var`, `/private/tmp` and
    /// `/private/etc`.
    StripPrivatePrefix,
}

impl Default for PathStandardization {
    fn default() -> Self {
        if cfg!(target_os = "macos") {
            Self::StripPrivatePrefix
        } else {
            Self::None
        }
    }
}

/// Default compiler arguments used when no backend answer is available.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
#[schemars(deny_unknown_fields)]
pub struct FallbackConfig {
    /// SDK root passed as `-sdk` (Swift) or `-isysroot` (clang).
    #[schemars(with = "Option<String>")]
    pub sdk: Option<PathBuf>,
    /// Extra arguments for C and Objective-C files.
    pub c_flags: Vec<String>,
    /// Extra arguments for C++ and Objective-C++ files.
    pub cxx_flags: Vec<String>,
    /// Extra arguments for Swift files.
    pub swift_flags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
#[schemars(deny_unknown_fields)]
pub struct BuildSettingsConfig {
    /// How long a settings query waits for the backend before answering with fallback
    /// settings.
    #[schemars(range(min = 1))]
    pub settings_timeout_ms: u64,
    /// Timeout for workspace-level lookups (build targets, sources) made while answering
    /// a settings query.
    #[schemars(range(min = 1))]
    pub workspace_request_timeout_ms: u64,
    pub settings_changed_debounce_ms: u64,
    pub dependencies_updated_debounce_ms: u64,
    /// Adds source-file watch patterns so the index stays current.
    pub background_indexing: bool,
    pub preparation: PreparationMode,
    pub server_shutdown_grace_ms: u64,
    pub process_exit_grace_ms: u64,
    pub path_standardization: PathStandardization,
    pub fallback: FallbackConfig,
}

impl Default for BuildSettingsConfig {
    fn default() -> Self {
        Self {
            settings_timeout_ms: 500,
            workspace_request_timeout_ms: 2_000,
            settings_changed_debounce_ms: 20,
            dependencies_updated_debounce_ms: 500,
            background_indexing: false,
            preparation: PreparationMode::default(),
            server_shutdown_grace_ms: 2_000,
            process_exit_grace_ms: 2_000,
            path_standardization: PathStandardization::default(),
            fallback: FallbackConfig::default(),
        }
    }
}

impl BuildSettingsConfig {
    pub fn settings_timeout(&self) -> Duration {
        Duration::from_millis(self.settings_timeout_ms.max(1))
    }

    pub fn workspace_request_timeout(&self) -> Duration {
        Duration::from_millis(self.workspace_request_timeout_ms.max(1))
    }

    pub fn settings_changed_debounce(&self) -> Duration {
        Duration::from_millis(self.settings_changed_debounce_ms)
    }

    pub fn dependencies_updated_debounce(&self) -> Duration {
        Duration::from_millis(self.dependencies_updated_debounce_ms)
    }

    pub fn server_shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.server_shutdown_grace_ms)
    }

    pub fn process_exit_grace(&self) -> Duration {
        Duration::from_millis(self.process_exit_grace_ms)
    }
}
