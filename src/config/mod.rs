//! Configuration for the Keel engine.
//!
//! This module handles all configuration-related functionality:
//! - Engine settings with defaults and `KEEL_*` environment overrides
//! - Parsing modules from YAML
//! - Validation of modules before planning
//! - Fingerprinting modules for change detection

mod hash;
mod parser;
mod settings;
mod validator;

pub use hash::ConfigHasher;
pub use parser::{find_settings_file, ModuleParser, SettingsParser, DEFAULT_SETTINGS_FILES, ENV_PREFIX};
pub use settings::{
    DriftSettings, EngineSettings, EventSettings, ExecutorSettings, LogFormat, LoggingSettings,
};
pub use validator::{ModuleValidator, ValidationError, ValidationResult};
