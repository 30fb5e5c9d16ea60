//! Project configuration: `.tollgate/config.yaml`.
//!
//! Supplies defaults for the CLI's `gate:` settings. Command-line flags and
//! `TOLLGATE_*` variables override anything set here.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::broker::BrokerKind;
use crate::errors::GateError;
use crate::gate::Profile;

pub const DEFAULT_CONFIG_PATH: &str = ".tollgate/config.yaml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectConfig {
    #[serde(default)]
    pub gate: GateDefaults,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GateDefaults {
    pub policy: Option<PathBuf>,
    pub profile: Option<Profile>,
    #[serde(default)]
    pub approval_public_keys: Vec<PathBuf>,
    #[serde(default)]
    pub delegation_public_keys: Vec<PathBuf>,
    #[serde(default)]
    pub registry_public_keys: Vec<PathBuf>,
    pub signing_key: Option<PathBuf>,
    pub rate_limit_state: Option<PathBuf>,
    pub approved_script_registry: Option<PathBuf>,
    pub broker: Option<BrokerKind>,
    pub broker_env_prefix: Option<String>,
    pub broker_command: Option<String>,
    #[serde(default)]
    pub broker_command_args: Vec<String>,
    /// Humantime duration, e.g. `5s`.
    pub broker_timeout: Option<String>,
    pub trace_out: Option<PathBuf>,
}

impl ProjectConfig {
    pub fn from_yaml_str(raw: &str) -> Result<Self, GateError> {
        if raw.trim().is_empty() {
            return Ok(ProjectConfig::default());
        }
        serde_yaml::from_str(raw).map_err(|e| GateError::InvalidInput(format!("config: {e}")))
    }

    /// Load an explicitly named config. The file must exist.
    pub fn load(path: &Path) -> Result<Self, GateError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| GateError::io(format!("read config {}", path.display()), e))?;
        let config = Self::from_yaml_str(&raw)?;
        tracing::debug!(path = %path.display(), "loaded project config");
        Ok(config.resolve_relative_to(path.parent().unwrap_or(Path::new("."))))
    }

    /// Load `<root>/.tollgate/config.yaml` if present.
    pub fn load_default(root: &Path) -> Result<Self, GateError> {
        let path = root.join(DEFAULT_CONFIG_PATH);
        if !path.exists() {
            return Ok(ProjectConfig::default());
        }
        Self::load(&path)
    }

    /// Paths in the file are relative to the project root, i.e. the parent
    /// of `.tollgate/`.
    fn resolve_relative_to(mut self, config_dir: &Path) -> Self {
        let root = if config_dir.file_name().is_some_and(|n| n == ".tollgate") {
            config_dir.parent().unwrap_or(config_dir)
        } else {
            config_dir
        };
        let fix = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = root.join(&*p);
            }
        };
        let g = &mut self.gate;
        g.policy.iter_mut().for_each(fix);
        g.signing_key.iter_mut().for_each(fix);
        g.rate_limit_state.iter_mut().for_each(fix);
        g.approved_script_registry.iter_mut().for_each(fix);
        g.trace_out.iter_mut().for_each(fix);
        g.approval_public_keys.iter_mut().for_each(fix);
        g.delegation_public_keys.iter_mut().for_each(fix);
        g.registry_public_keys.iter_mut().for_each(fix);
        self
    }
}
