use std::path::{Path, PathBuf};

use super::fs::{name_to_file, timestamp};
use crate::{DqnError, Result};

/// Paths of the three artifacts of a checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointPaths {
    /// Sanitized checkpoint name.
    pub name: String,
    pub q_network: PathBuf,
    pub target_network: PathBuf,
    pub training_state: PathBuf,
}

impl CheckpointPaths {
    pub fn new(dir: &Path, name: &str) -> Self {
        let name = name_to_file(name, "");
        Self {
            q_network: dir.join(format!("{name}_q_network.ot")),
            target_network: dir.join(format!("{name}_target_network.ot")),
            training_state: dir.join(format!("{name}_training_state.bin")),
            name,
        }
    }

    /// `dqn_model_<unix seconds>`
    pub fn default_name() -> String {
        Self::timestamped("dqn_model")
    }

    /// `<prefix>_<unix seconds>`
    pub fn timestamped(prefix: &str) -> String {
        format!("{}_{}", prefix, timestamp())
    }

    /// Split a `<dir>/<name>` model path into the directory and the checkpoint name.
    pub fn split_model_path(path: &Path) -> Result<(PathBuf, String)> {
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| DqnError::ArtifactNotFound(path.to_path_buf()))?;
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        Ok((dir, name.to_string()))
    }

    /// Returns [`DqnError::ArtifactNotFound`] for the first missing artifact.
    pub fn ensure_exist(&self) -> Result<()> {
        for path in [&self.q_network, &self.target_network, &self.training_state] {
            if !path.is_file() {
                return Err(DqnError::ArtifactNotFound(path.clone()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_names() {
        let paths = CheckpointPaths::new(Path::new("models"), "dqn_env_1700000000");
        assert_eq!(
            paths.q_network,
            Path::new("models/dqn_env_1700000000_q_network.ot")
        );
        assert_eq!(
            paths.target_network,
            Path::new("models/dqn_env_1700000000_target_network.ot")
        );
        assert_eq!(
            paths.training_state,
            Path::new("models/dqn_env_1700000000_training_state.bin")
        );
        assert!(CheckpointPaths::default_name().starts_with("dqn_model_"));
    }

    #[test]
    fn model_paths() {
        let (dir, name) = CheckpointPaths::split_model_path(Path::new("models/dqn_web_1")).unwrap();
        assert_eq!(dir, Path::new("models"));
        assert_eq!(name, "dqn_web_1");
        let (dir, name) = CheckpointPaths::split_model_path(Path::new("dqn_web_1")).unwrap();
        assert_eq!(dir, Path::new("."));
        assert_eq!(name, "dqn_web_1");
    }

    #[test]
    fn missing_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let paths = CheckpointPaths::new(dir.path(), "model");
        assert!(matches!(
            paths.ensure_exist(),
            Err(DqnError::ArtifactNotFound(path)) if path == paths.q_network
        ));
        std::fs::write(&paths.q_network, b"").unwrap();
        std::fs::write(&paths.target_network, b"").unwrap();
        assert!(matches!(
            paths.ensure_exist(),
            Err(DqnError::ArtifactNotFound(path)) if path == paths.training_state
        ));
        std::fs::write(&paths.training_state, b"").unwrap();
        assert!(paths.ensure_exist().is_ok());
    }
}
