//! Loading of engine settings and modules.
//!
//! Settings and modules are read from YAML. Settings can additionally be
//! overridden from `KEEL_*` environment variables, optionally loaded from a
//! `.env` file first.

use crate::error::{ConfigError, KeelError, Result};
use crate::model::Module;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::settings::{EngineSettings, LogFormat};

/// Environment variable prefix for settings overrides.
pub const ENV_PREFIX: &str = "KEEL_";

/// Default settings file names to search for.
pub const DEFAULT_SETTINGS_FILES: &[&str] = &["keel.yaml", "keel.yml"];

/// Parser for engine settings.
#[derive(Debug, Default)]
pub struct SettingsParser {
    /// Base path for resolving the `.env` file.
    base_path: Option<PathBuf>,
}

/// Parser for module documents.
#[derive(Debug, Default, Clone, Copy)]
pub struct ModuleParser;

impl SettingsParser {
    /// Creates a new settings parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the directory holding the `.env` file.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads settings from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<EngineSettings> {
        let path = path.as_ref();
        info!("Loading settings from: {}", path.display());
        let content = read_file(path)?;
        self.parse_yaml(&content, Some(path))
    }

    /// Parses settings from a YAML string.
    ///
    /// An empty document yields the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<EngineSettings> {
        debug!("Parsing engine settings");
        if content.trim().is_empty() {
            return Ok(EngineSettings::default());
        }
        parse_yaml(content, source)
    }

    /// Loads settings, then applies `.env` and `KEEL_*` overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be loaded or an override is
    /// malformed.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<EngineSettings> {
        let mut settings = self.load_file(path)?;
        self.load_dotenv()?;
        Self::apply_overrides(&mut settings, |key| std::env::var(key).ok())?;
        Ok(settings)
    }

    /// Applies overrides looked up by variable name.
    ///
    /// Recognised variables: `KEEL_MAX_CONCURRENCY`,
    /// `KEEL_OPERATION_TIMEOUT_SECS`, `KEEL_ROLLBACK_ENABLED`,
    /// `KEEL_DRIFT_INTERVAL_SECS`, `KEEL_EVENT_BUFFER`, `KEEL_LOG_LEVEL` and
    /// `KEEL_LOG_FORMAT`.
    ///
    /// # Errors
    ///
    /// Returns an error naming the variable if a value cannot be parsed.
    pub fn apply_overrides<F>(settings: &mut EngineSettings, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(value) = var("MAX_CONCURRENCY") {
            debug!("Overriding executor.max_concurrency from environment");
            settings.executor.max_concurrency = parse_override("MAX_CONCURRENCY", &value)?;
        }
        if let Some(value) = var("OPERATION_TIMEOUT_SECS") {
            debug!("Overriding executor.operation_timeout_secs from environment");
            settings.executor.operation_timeout_secs = parse_override("OPERATION_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = var("ROLLBACK_ENABLED") {
            debug!("Overriding executor.rollback_enabled from environment");
            settings.executor.rollback_enabled = parse_override("ROLLBACK_ENABLED", &value)?;
        }
        if let Some(value) = var("DRIFT_INTERVAL_SECS") {
            debug!("Overriding drift.interval_secs from environment");
            settings.drift.interval_secs = parse_override("DRIFT_INTERVAL_SECS", &value)?;
        }
        if let Some(value) = var("EVENT_BUFFER") {
            debug!("Overriding events.buffer from environment");
            settings.events.buffer = parse_override("EVENT_BUFFER", &value)?;
        }
        if let Some(value) = var("LOG_LEVEL") {
            debug!("Overriding logging.level from environment");
            settings.logging.level = value;
        }
        if let Some(value) = var("LOG_FORMAT") {
            debug!("Overriding logging.format from environment");
            settings.logging.format = value
                .parse::<LogFormat>()
                .map_err(|e| ConfigError::validation(e, format!("{ENV_PREFIX}LOG_FORMAT")))?;
        }

        Ok(())
    }

    /// Loads the `.env` file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the `.env` file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                KeelError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }
}

impl ModuleParser {
    /// Creates a new module parser.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Loads a module from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<Module> {
        let path = path.as_ref();
        info!("Loading module from: {}", path.display());
        let content = read_file(path)?;
        self.parse_yaml(&content, Some(path))
    }

    /// Parses a module from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<Module> {
        let module: Module = parse_yaml(content, source)?;
        debug!(
            "Parsed module {} v{} ({} resources)",
            module.name,
            module.version,
            module.resources.len()
        );
        Ok(module)
    }
}

/// Finds a settings file in `start_dir` or any parent directory.
///
/// # Errors
///
/// Returns an error if no settings file is found.
pub fn find_settings_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_SETTINGS_FILES {
            let candidate = current.join(filename);
            if candidate.exists() {
                info!("Found settings file: {}", candidate.display());
                return Ok(candidate);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(KeelError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_SETTINGS_FILES[0]),
    }))
}

fn read_file(path: &Path) -> Result<String> {
    if !path.exists() {
        return Err(KeelError::Config(ConfigError::FileNotFound {
            path: path.to_path_buf(),
        }));
    }

    std::fs::read_to_string(path).map_err(|e| {
        KeelError::Config(ConfigError::ParseError {
            message: format!("Failed to read file: {e}"),
            location: Some(path.display().to_string()),
        })
    })
}

fn parse_yaml<T: DeserializeOwned>(content: &str, source: Option<&Path>) -> Result<T> {
    serde_yaml::from_str(content).map_err(|e| {
        KeelError::Config(ConfigError::ParseError {
            message: format!("YAML parse error: {e}"),
            location: source.map(|p| p.display().to_string()),
        })
    })
}

fn parse_override<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| {
        KeelError::Config(ConfigError::validation(
            format!("invalid value '{value}'"),
            format!("{ENV_PREFIX}{name}"),
        ))
    })
}
