//! Configuration module for ScriptFlow
//!
//! This module handles configuration for the user node stage:
//! - [`StageConfig`] tunables (timeouts, cache slack, script limits)
//! - [`ProjectFile`] (`.json`) holding user nodes, global variables and the
//!   stage config
//!
//! # App Data Location
//!
//! The default project lives in the platform-appropriate location:
//! - **Linux**: `~/.local/share/dev.scriptflow.scriptflow-rs/`
//! - **macOS**: `~/Library/Application Support/dev.scriptflow.scriptflow-rs/`
//! - **Windows**: `%APPDATA%\dev.scriptflow.scriptflow-rs\`
//!
//! # Example
//!
//! ```ignore
//! use scriptflow_rs::config::{ProjectFile, StageConfig};
//!
//! let project = ProjectFile::load("nodes.json")?;
//! let config = StageConfig::from_toml_file("stage.toml")?;
//! ```

use crate::error::{Result, ScriptFlowError};
use crate::types::{GlobalVariables, UserNode, UserNodes};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application identifier for data directories
pub const APP_ID: &str = "dev.scriptflow.scriptflow-rs";

/// Default project filename inside the app data directory
pub const DEFAULT_PROJECT_FILE: &str = "project.json";

/// Default per-call worker timeout in milliseconds
pub const DEFAULT_PROCESS_TIMEOUT_MS: u64 = 5_000;

/// Default maximum operations per script call
pub const DEFAULT_MAX_OPERATIONS: u64 = 100_000;

// ==================== App Data Directory ====================

/// Get the application data directory path
pub fn app_data_dir() -> Option<PathBuf> {
    dirs_next::data_dir().map(|p| p.join(APP_ID))
}

/// Ensure the app data directory exists
pub fn ensure_app_data_dir() -> Result<PathBuf> {
    let dir = app_data_dir().ok_or_else(|| {
        ScriptFlowError::Config("Could not determine app data directory".to_string())
    })?;

    if !dir.exists() {
        std::fs::create_dir_all(&dir).map_err(|e| {
            ScriptFlowError::Config(format!("Failed to create app data directory: {}", e))
        })?;
    }

    Ok(dir)
}

/// Path of the default project file
pub fn default_project_path() -> Option<PathBuf> {
    app_data_dir().map(|p| p.join(DEFAULT_PROJECT_FILE))
}

// ==================== Script Limits ====================

/// Resource limits applied to every script engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptLimits {
    /// Maximum operations per call before the script is aborted
    #[serde(default = "default_max_operations")]
    pub max_operations: u64,

    /// Maximum function call nesting
    #[serde(default = "default_max_call_levels")]
    pub max_call_levels: usize,

    #[serde(default = "default_max_string_size")]
    pub max_string_size: usize,

    #[serde(default = "default_max_array_size")]
    pub max_array_size: usize,

    #[serde(default = "default_max_map_size")]
    pub max_map_size: usize,
}

fn default_max_operations() -> u64 {
    DEFAULT_MAX_OPERATIONS
}

fn default_max_call_levels() -> usize {
    32
}

fn default_max_string_size() -> usize {
    1024 * 1024
}

fn default_max_array_size() -> usize {
    100_000
}

fn default_max_map_size() -> usize {
    10_000
}

impl Default for ScriptLimits {
    fn default() -> Self {
        Self {
            max_operations: default_max_operations(),
            max_call_levels: default_max_call_levels(),
            max_string_size: default_max_string_size(),
            max_array_size: default_max_array_size(),
            max_map_size: default_max_map_size(),
        }
    }
}

// ==================== Stage Config ====================

/// Tunables of the user node stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageConfig {
    /// Timeout for a single worker call in milliseconds
    #[serde(default = "default_process_timeout_ms")]
    pub process_timeout_ms: u64,

    /// Extra registration cache entries kept beyond the node count
    #[serde(default = "default_registration_cache_slack")]
    pub registration_cache_slack: usize,

    /// Script engine limits
    #[serde(flatten)]
    pub limits: ScriptLimits,

    /// Name prefix of sandbox worker threads
    #[serde(default = "default_worker_thread_prefix")]
    pub worker_thread_prefix: String,

    /// Capacity of the channel between the upstream player and the stage
    #[serde(default = "default_emit_capacity")]
    pub emit_capacity: usize,
}

fn default_process_timeout_ms() -> u64 {
    DEFAULT_PROCESS_TIMEOUT_MS
}

fn default_registration_cache_slack() -> usize {
    1
}

fn default_worker_thread_prefix() -> String {
    "scriptflow-worker".to_string()
}

fn default_emit_capacity() -> usize {
    64
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            process_timeout_ms: default_process_timeout_ms(),
            registration_cache_slack: default_registration_cache_slack(),
            limits: ScriptLimits::default(),
            worker_thread_prefix: default_worker_thread_prefix(),
            emit_capacity: default_emit_capacity(),
        }
    }
}

impl StageConfig {
    pub fn process_timeout(&self) -> Duration {
        Duration::from_millis(self.process_timeout_ms)
    }

    /// Load a stage config from a TOML file
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ScriptFlowError::Config(format!("Failed to read stage config {:?}: {}", path, e))
        })?;
        let config: StageConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.process_timeout_ms == 0 {
            return Err(ScriptFlowError::Config(
                "process_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.emit_capacity == 0 {
            return Err(ScriptFlowError::Config(
                "emit_capacity must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

// ==================== Project File ====================

/// Project file holding everything needed to run a set of user nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectFile {
    /// Project file format version for future compatibility
    #[serde(default = "default_project_version")]
    pub version: u32,

    /// Project name
    #[serde(default)]
    pub name: String,

    /// User nodes in evaluation order
    #[serde(default)]
    pub nodes: Vec<UserNode>,

    /// Global variables passed to every node
    #[serde(default)]
    pub global_variables: GlobalVariables,

    /// Stage tunables
    #[serde(default)]
    pub stage: StageConfig,
}

fn default_project_version() -> u32 {
    1
}

impl Default for ProjectFile {
    fn default() -> Self {
        Self {
            version: 1,
            name: "Untitled Project".to_string(),
            nodes: Vec::new(),
            global_variables: GlobalVariables::new(),
            stage: StageConfig::default(),
        }
    }
}

impl ProjectFile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Load a project file from disk
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ScriptFlowError::Config(format!("Failed to read project file {:?}: {}", path, e))
        })?;

        let project: ProjectFile = serde_json::from_str(&content).map_err(|e| {
            ScriptFlowError::Config(format!("Failed to parse project file {:?}: {}", path, e))
        })?;
        project.stage.validate()?;
        Ok(project)
    }

    /// Load a project file, returning defaults if any error occurs
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        Self::load(path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load project, using defaults: {}", e);
            Self::default()
        })
    }

    /// Save project file to disk as JSON
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ScriptFlowError::Config(format!("Failed to create project directory: {}", e))
            })?;
        }

        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ScriptFlowError::Config(format!("Failed to serialize project: {}", e)))?;

        std::fs::write(path, content).map_err(|e| {
            ScriptFlowError::Config(format!("Failed to write project file {:?}: {}", path, e))
        })
    }

    pub fn with_node(mut self, node: UserNode) -> Self {
        self.nodes.push(node);
        self
    }

    /// Nodes keyed by id, keeping file order. Later duplicates win.
    pub fn user_nodes(&self) -> UserNodes {
        self.nodes
            .iter()
            .map(|node| (node.id.clone(), node.clone()))
            .collect()
    }
}
