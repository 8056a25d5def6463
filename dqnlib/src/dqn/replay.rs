//! Experience Replay Buffer module for Deep Q-Learning.
use std::{collections::VecDeque, path::Path};

use crate::io::fs::write_atomic;

use super::*;

/// A single interaction step. Never mutated after it's added to a [`ReplayBuffer`].
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Transition {
    pub state: Observation,
    /// Index of the taken action.
    pub action: Action,
    /// Has the same shape as `state`.
    pub next_state: Observation,
    pub reward: Reward,
    /// Whether `next_state` is terminal.
    pub done: bool,
}

impl Transition {
    pub fn new(
        state: Observation,
        action: Action,
        next_state: Observation,
        reward: Reward,
        done: bool,
    ) -> Self {
        Self {
            state,
            action,
            next_state,
            reward,
            done,
        }
    }
}

/// Represents a minibatch sample from [`ReplayBuffer`] as index-aligned sequences.
#[derive(Debug, Default, Clone)]
pub struct TransitionBatch {
    pub states: Vec<Observation>,
    pub actions: Vec<Action>,
    pub next_states: Vec<Observation>,
    pub rewards: Vec<Reward>,
    pub dones: Vec<bool>,
}

/// Tensor form of a [`TransitionBatch`].
pub struct BatchTensors {
    /// [B, ...] where B is the minibatch size.
    pub states: Tensor,
    /// Datatype is i64 unlike other fields.
    /// [B, 1] where B is the minibatch size.
    pub actions: Tensor,
    /// [B, ...] where B is the minibatch size.
    pub next_states: Tensor,
    /// [B, 1] where B is the minibatch size.
    pub rewards: Tensor,
    /// 1.0 for terminal transitions, 0.0 otherwise.
    /// [B, 1] where B is the minibatch size.
    pub dones: Tensor,
}

impl TransitionBatch {
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    fn push(&mut self, transition: &Transition) {
        self.states.push(transition.state.clone());
        self.actions.push(transition.action);
        self.next_states.push(transition.next_state.clone());
        self.rewards.push(transition.reward);
        self.dones.push(transition.done);
    }

    /// Convert the batch to tensors on the given device.
    pub fn to_tensors(&self, device: tch::Device) -> Result<BatchTensors> {
        let actions: Vec<i64> = self.actions.iter().map(|&a| a as i64).collect();
        let dones: Vec<f32> = self
            .dones
            .iter()
            .map(|&done| if done { 1.0 } else { 0.0 })
            .collect();
        Ok(BatchTensors {
            states: stack_observations(&self.states)?.to_device(device),
            actions: Tensor::from_slice(&actions).unsqueeze(1).to_device(device),
            next_states: stack_observations(&self.next_states)?.to_device(device),
            rewards: Tensor::from_slice(&self.rewards)
                .unsqueeze(1)
                .to_device(device),
            dones: Tensor::from_slice(&dones).unsqueeze(1).to_device(device),
        })
    }
}

/// Bounded FIFO store of transitions with uniform sampling.
pub struct ReplayBuffer {
    /// Cyclic buffer of stored transitions.
    transitions: VecDeque<Transition>,
    capacity: usize,
    /// Random number generator.
    rng: StdRng,
}

/// On-disk form of a [`ReplayBuffer`].
#[derive(Serialize, Deserialize)]
struct ReplayBufferFile {
    capacity: usize,
    transitions: VecDeque<Transition>,
}

impl ReplayBuffer {
    /// Create an empty buffer. A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        Self::with_seed(capacity, None)
    }

    pub fn with_seed(capacity: usize, seed: Option<u64>) -> Self {
        let capacity = capacity.max(1);
        Self {
            transitions: VecDeque::with_capacity(capacity),
            capacity,
            rng: create_rng(seed),
        }
    }

    /// Add a new transition, replacing the oldest one if the capacity is full.
    pub fn add(&mut self, transition: Transition) {
        if self.transitions.len() == self.capacity {
            self.transitions.pop_front();
        }
        self.transitions.push_back(transition);
    }

    /// Sample a batch without duplicate indices.
    /// The batch size is clamped to the number of stored transitions.
    pub fn sample(&mut self, batch_size: usize) -> TransitionBatch {
        let size = batch_size.min(self.transitions.len());
        let mut batch = TransitionBatch::default();
        for i in rand::seq::index::sample(&mut self.rng, self.transitions.len(), size) {
            batch.push(&self.transitions[i]);
        }
        batch
    }

    pub fn len(&self) -> usize {
        self.transitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transitions.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Iterate over the stored transitions from the oldest to the newest.
    pub fn iter(&self) -> impl Iterator<Item = &Transition> {
        self.transitions.iter()
    }

    /// Persist the whole buffer with bincode.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = ReplayBufferFile {
            capacity: self.capacity,
            transitions: self.transitions.clone(),
        };
        write_atomic(path.as_ref(), &bincode::serialize(&file)?)
    }

    /// Load a buffer saved by [`ReplayBuffer::save`].
    pub fn load<P: AsRef<Path>>(path: P, seed: Option<u64>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(DqnError::ArtifactNotFound(path.to_path_buf()));
        }
        let file: ReplayBufferFile = bincode::deserialize(&std::fs::read(path)?)?;
        let mut buffer = Self::with_seed(file.capacity, seed);
        for transition in file.transitions {
            buffer.add(transition);
        }
        Ok(buffer)
    }
}

impl Extend<Transition> for ReplayBuffer {
    fn extend<T: IntoIterator<Item = Transition>>(&mut self, iter: T) {
        for transition in iter {
            self.add(transition);
        }
    }
}
