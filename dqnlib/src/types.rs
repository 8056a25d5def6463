//! Primitive data types.

/// An observation of the environment with a fixed declared shape.
/// `[H, W]` for the simulated game screen, `[N]` for feature vectors.
pub type Observation = ndarray::ArrayD<f32>;
/// Data type for action indices. Always in `[0, num_actions)`.
pub type Action = usize;
/// Data type for the reward of a single step.
pub type Reward = f32;
/// Data type for the exploration rate.
pub type Epsilon = f64;
/// Data type for loss values.
pub type Loss = f64;
