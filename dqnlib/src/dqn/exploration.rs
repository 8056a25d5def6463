use super::*;

/// Epsilon-greedy action selection with a multiplicative decay schedule.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct EpsilonGreedy {
    epsilon: Epsilon,
    epsilon_min: Epsilon,
    decay_rate: f64,
}

impl EpsilonGreedy {
    pub fn new(epsilon: Epsilon, epsilon_min: Epsilon, decay_rate: f64) -> Self {
        Self {
            epsilon,
            epsilon_min,
            decay_rate,
        }
    }

    pub fn epsilon(&self) -> Epsilon {
        self.epsilon
    }

    pub fn epsilon_min(&self) -> Epsilon {
        self.epsilon_min
    }

    /// Used when restoring a checkpoint.
    pub fn set_epsilon(&mut self, epsilon: Epsilon) {
        self.epsilon = epsilon;
    }

    /// `epsilon <- max(epsilon_min, epsilon * decay_rate)`. Returns the new value.
    pub fn decay(&mut self) -> Epsilon {
        self.epsilon = self.epsilon_min.max(self.epsilon * self.decay_rate);
        self.epsilon
    }

    /// Select an action with the current exploration rate.
    pub fn select_action<R: Rng>(
        &self,
        rng: &mut R,
        network: &QNetwork,
        observation: &Observation,
    ) -> Result<Action> {
        Self::select_action_with(rng, network, observation, self.epsilon)
    }

    /// Select an action with an explicit exploration rate.
    /// `epsilon = 0.0` always exploits.
    pub fn select_action_with<R: Rng>(
        rng: &mut R,
        network: &QNetwork,
        observation: &Observation,
        epsilon: Epsilon,
    ) -> Result<Action> {
        if rng.gen::<f64>() < epsilon {
            Ok(rng.gen_range(0..network.num_actions()))
        } else {
            let q_values = network.q_values(observation)?;
            greedy_action(&q_values).ok_or_else(|| {
                DqnError::InvalidSettings("network has no outputs".to_string())
            })
        }
    }
}

/// Index of the largest value, the lowest index wins ties.
/// Returns `None` for an empty slice.
pub fn greedy_action(q_values: &[f32]) -> Option<Action> {
    let mut iter = q_values.iter().enumerate();
    let (mut best, mut best_value) = iter.next()?;
    for (i, value) in iter {
        if value > best_value {
            best = i;
            best_value = value;
        }
    }
    Some(best)
}
