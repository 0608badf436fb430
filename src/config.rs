//! dlbridge Configuration
//!
//! Handles parsing and management of dlbridge.toml configuration files.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::ffi::{CallPolicy, FfiSignature, Loader, SignatureError};

/// File name searched for by [`BridgeConfig::find_and_load`].
pub const CONFIG_FILE: &str = "dlbridge.toml";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(String),

    #[error("Invalid declaration '{signature}' in library '{library}': {source}")]
    InvalidSignature {
        library: String,
        signature: String,
        source: SignatureError,
    },

    #[error("Library '{0}' is declared more than once")]
    DuplicateLibrary(String),

    #[error("Function '{function}' is declared more than once in library '{library}'")]
    DuplicateFunction { library: String, function: String },
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Root configuration structure matching dlbridge.toml.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct BridgeConfig {
    /// Library search and call policy
    #[serde(default)]
    pub loader: LoaderConfig,

    /// Libraries and their declared functions
    #[serde(default)]
    pub libraries: Vec<LibraryConfig>,
}

impl BridgeConfig {
    /// Load configuration from a file path.
    ///
    /// Relative search paths and library paths are taken relative to the
    /// directory holding the file.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::parse(&content)?;
        if let Some(dir) = path.parent() {
            config.anchor_paths(dir);
        }
        tracing::debug!(path = %path.display(), libraries = config.libraries.len(), "loaded config");
        Ok(config)
    }

    /// Parse and validate configuration text.
    pub fn parse(content: &str) -> ConfigResult<Self> {
        let config: BridgeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the current directory or parents.
    pub fn load_from_cwd() -> ConfigResult<Self> {
        let cwd = std::env::current_dir().map_err(ConfigError::Io)?;
        Self::find_and_load(&cwd)
    }

    /// Find and load configuration by searching up from the given directory.
    pub fn find_and_load(start_dir: &Path) -> ConfigResult<Self> {
        let mut dir = start_dir.to_path_buf();
        loop {
            let config_path = dir.join(CONFIG_FILE);
            if config_path.exists() {
                return Self::load(&config_path);
            }
            if !dir.pop() {
                // Reached root without finding config
                return Ok(Self::default());
            }
        }
    }

    /// Save configuration to a file.
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Check every declaration parses and library names are unique.
    pub fn validate(&self) -> ConfigResult<()> {
        let mut seen = std::collections::HashSet::new();
        for library in &self.libraries {
            if !seen.insert(library.name.as_str()) {
                return Err(ConfigError::DuplicateLibrary(library.name.clone()));
            }
            let mut functions = std::collections::HashSet::new();
            for function in &library.functions {
                let signature = FfiSignature::parse(&function.signature).map_err(|source| {
                    ConfigError::InvalidSignature {
                        library: library.name.clone(),
                        signature: function.signature.clone(),
                        source,
                    }
                })?;
                if !functions.insert(signature.name.clone()) {
                    return Err(ConfigError::DuplicateFunction {
                        library: library.name.clone(),
                        function: signature.name,
                    });
                }
            }
        }
        Ok(())
    }

    pub fn library(&self, name: &str) -> Option<&LibraryConfig> {
        self.libraries.iter().find(|lib| lib.name == name)
    }

    fn anchor_paths(&mut self, base: &Path) {
        for path in &mut self.loader.search_paths {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
        for library in &mut self.libraries {
            if let Some(path) = library.path.as_mut() {
                let candidate = Path::new(path.as_str());
                if candidate.is_relative() && candidate.components().count() > 1 {
                    *path = base.join(candidate).to_string_lossy().into_owned();
                }
            }
        }
    }
}

/// Library search settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoaderConfig {
    /// Extra directories searched after the current directory
    #[serde(default)]
    pub search_paths: Vec<PathBuf>,

    /// Search the platform's default library directories
    #[serde(default = "default_true")]
    pub system_paths: bool,

    /// Whether calls through one library may overlap
    #[serde(default)]
    pub call_policy: CallPolicy,
}

fn default_true() -> bool {
    true
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            search_paths: Vec::new(),
            system_paths: true,
            call_policy: CallPolicy::default(),
        }
    }
}

impl LoaderConfig {
    /// Build a loader with these settings.
    pub fn build_loader(&self) -> Loader {
        let mut loader = Loader::new();
        for path in &self.search_paths {
            loader.add_search_path(path);
        }
        loader.set_system_paths(self.system_paths);
        loader.set_call_policy(self.call_policy);
        loader
    }
}

/// One library and the functions declared on it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LibraryConfig {
    /// Name used in qualified function names (`name:function`)
    pub name: String,

    /// Path or file name; defaults to `name`
    #[serde(default)]
    pub path: Option<String>,

    #[serde(default)]
    pub functions: Vec<FunctionConfig>,
}

/// A declared function.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionConfig {
    /// C-style declaration, e.g. `"i32 double_me(i32)"`
    pub signature: String,

    #[serde(default)]
    pub description: String,
}
