//! Input/Output for Deep Q-Learning Module.
use std::path::Path;

use crate::dqn::{environment::EnvironmentSettings, AgentSettings, ModelSettings};

use super::*;

/// A YAML file that describes a training run.
/// Every field has a default, so an empty file is a valid configuration.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(default)]
pub struct RunConfig {
    pub name: Option<String>,
    /// Model settings.
    pub model: ModelSettings,
    /// Agent hyperparameters.
    pub agent: AgentSettings,
    /// Simulated environment settings.
    pub environment: EnvironmentSettings,
    /// Seed for the random number generators and libtorch.
    pub seed: Option<u64>,
}

impl RunConfig {
    /// Read the run configuration from a YAML file.
    pub fn read_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)?;
        let config: RunConfig = serde_yaml::from_str(&content).map_err(|error| {
            DqnError::Serialization(format!(
                "Failed to parse run YAML ({}): {}",
                path.as_ref().display(),
                error
            ))
        })?;
        config.agent.validate()?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}
