//! # Space Shooter DQN Library
//!
//! Common functionality for the DQN trainer CLI and the gameplay server.
//!
//! - [`dqn`]: replay buffer, Q-networks, epsilon-greedy policy, the agent and its
//!   training loops, and the simulated game environment.
//! - [`io`]: run configuration, checkpoints and externally recorded gameplay.

use std::path::PathBuf;

use rand::{rngs::StdRng, SeedableRng};

pub mod dqn;
pub mod io;
pub mod types;

/// Result type of every fallible operation in this crate.
pub type Result<T> = std::result::Result<T, DqnError>;

/// Represents the reasons why an operation might fail.
#[derive(Debug)]
pub enum DqnError {
    /// File system errors.
    Io(std::io::Error),
    /// Errors reported by libtorch.
    Torch(tch::TchError),
    /// Encoding or decoding of a persisted artifact failed.
    Serialization(String),
    /// A checkpoint artifact does not exist.
    ArtifactNotFound(PathBuf),
    /// A tensor or observation doesn't have the expected shape.
    ShapeMismatch { expected: String, actual: String },
    /// A gameplay record lacks a required key.
    MissingField(String),
    /// A gameplay record has all keys but a malformed value.
    InvalidRecord(String),
    /// An action index outside of `[0, num_actions)`.
    InvalidAction { action: usize, num_actions: usize },
    /// Invalid hyperparameters or model settings.
    InvalidSettings(String),
}

impl DqnError {
    pub fn shape_mismatch<A: std::fmt::Debug, B: std::fmt::Debug>(expected: A, actual: B) -> Self {
        DqnError::ShapeMismatch {
            expected: format!("{expected:?}"),
            actual: format!("{actual:?}"),
        }
    }
}

impl std::error::Error for DqnError {}

impl std::fmt::Display for DqnError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            DqnError::Io(err) => write!(f, "IO error: {}", err),
            DqnError::Torch(err) => write!(f, "Torch error: {}", err),
            DqnError::Serialization(reason) => write!(f, "Serialization error: {}", reason),
            DqnError::ArtifactNotFound(path) => {
                write!(f, "Artifact not found: {}", path.display())
            }
            DqnError::ShapeMismatch { expected, actual } => {
                write!(f, "Shape mismatch: expected {}, got {}", expected, actual)
            }
            DqnError::MissingField(key) => write!(f, "Missing required key: {}", key),
            DqnError::InvalidRecord(reason) => write!(f, "Invalid record: {}", reason),
            DqnError::InvalidAction {
                action,
                num_actions,
            } => write!(
                f,
                "Invalid action {}: must be less than {}",
                action, num_actions
            ),
            DqnError::InvalidSettings(reason) => write!(f, "Invalid settings: {}", reason),
        }
    }
}

impl From<std::io::Error> for DqnError {
    fn from(err: std::io::Error) -> Self {
        DqnError::Io(err)
    }
}

impl From<tch::TchError> for DqnError {
    fn from(err: tch::TchError) -> Self {
        DqnError::Torch(err)
    }
}

impl From<bincode::Error> for DqnError {
    fn from(err: bincode::Error) -> Self {
        DqnError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for DqnError {
    fn from(err: serde_json::Error) -> Self {
        DqnError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for DqnError {
    fn from(err: serde_yaml::Error) -> Self {
        DqnError::Serialization(err.to_string())
    }
}

impl From<ndarray::ShapeError> for DqnError {
    fn from(err: ndarray::ShapeError) -> Self {
        DqnError::InvalidRecord(err.to_string())
    }
}

/// Create a random number generator from the given seed, or from entropy if there's none.
pub fn create_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

/// Seed libtorch if a seed is given, making weight initialization reproducible.
pub fn load_torch_seed(seed: Option<u64>) {
    if let Some(seed) = seed {
        tch::manual_seed(seed as i64);
    }
}
