//! Deep Q-Learning Module
use rand::{rngs::StdRng, Rng};
use serde::{Deserialize, Serialize};
use tch::{
    nn::{self, OptimizerConfig},
    Tensor,
};

use crate::{create_rng, types::*, DqnError, Result};

mod replay;
pub use self::replay::{BatchTensors, ReplayBuffer, Transition, TransitionBatch};

mod exploration;
pub use self::exploration::{greedy_action, EpsilonGreedy};

mod model;
pub use self::model::*;

mod metrics;
pub use self::metrics::TrainingMetrics;

mod agent;
pub use self::agent::*;

pub mod environment;

mod training;
pub use self::training::*;

/// Convert a single observation into a tensor of the same shape.
pub fn observation_to_tensor(observation: &Observation) -> Tensor {
    let shape: Vec<i64> = observation.shape().iter().map(|&d| d as i64).collect();
    let data: Vec<f32> = observation.iter().copied().collect();
    Tensor::from_slice(&data).reshape(shape.as_slice())
}

/// Stack a batch of observations into a `[B, ...]` tensor.
/// All observations must have the same shape.
pub fn stack_observations(observations: &[Observation]) -> Result<Tensor> {
    let shape = match observations.first() {
        Some(first) => first.shape().to_vec(),
        None => return Err(DqnError::InvalidRecord("empty observation batch".to_string())),
    };
    let mut data: Vec<f32> = Vec::with_capacity(observations.len() * shape.iter().product::<usize>());
    for observation in observations {
        if observation.shape() != shape.as_slice() {
            return Err(DqnError::shape_mismatch(&shape, observation.shape()));
        }
        data.extend(observation.iter().copied());
    }
    let mut dims: Vec<i64> = Vec::with_capacity(shape.len() + 1);
    dims.push(observations.len() as i64);
    dims.extend(shape.iter().map(|&d| d as i64));
    Ok(Tensor::from_slice(&data).reshape(dims.as_slice()))
}
