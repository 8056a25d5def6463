use std::path::Path;

use crate::io::{fs::write_atomic, CheckpointPaths};

use super::*;

/// Hyperparameters of an [`Agent`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct AgentSettings {
    pub lr: f64,
    /// Discount factor in the Q function.
    pub gamma: f64,
    pub epsilon_start: Epsilon,
    pub epsilon_end: Epsilon,
    pub epsilon_decay: f64,
    /// Training steps between hard copies of the online network into the target network.
    pub target_update_freq: usize,
    pub batch_size: usize,
    pub buffer_size: usize,
    /// Maximum global gradient norm. No clipping if `None`.
    pub gradient_clip: Option<f64>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            lr: 1e-4,
            gamma: 0.99,
            epsilon_start: 1.0,
            epsilon_end: 0.1,
            epsilon_decay: 0.995,
            target_update_freq: 1000,
            batch_size: 64,
            buffer_size: 10000,
            gradient_clip: Some(1.0),
        }
    }
}

impl AgentSettings {
    pub fn validate(&self) -> Result<()> {
        let unit = 0.0..=1.0;
        let error = if !(self.lr > 0.0) {
            "lr must be positive"
        } else if !unit.contains(&self.gamma) {
            "gamma must be in [0, 1]"
        } else if !unit.contains(&self.epsilon_start) || !unit.contains(&self.epsilon_end) {
            "epsilon_start and epsilon_end must be in [0, 1]"
        } else if !(self.epsilon_decay > 0.0 && self.epsilon_decay <= 1.0) {
            "epsilon_decay must be in (0, 1]"
        } else if self.target_update_freq == 0 {
            "target_update_freq must be positive"
        } else if self.batch_size == 0 {
            "batch_size must be positive"
        } else if self.buffer_size < self.batch_size {
            "buffer_size must be at least batch_size"
        } else if matches!(self.gradient_clip, Some(clip) if !(clip > 0.0)) {
            "gradient_clip must be positive"
        } else {
            return Ok(());
        };
        Err(DqnError::InvalidSettings(error.to_string()))
    }
}

/// Result of [`Agent::train_step`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepOutcome {
    /// Not enough transitions in the buffer for a full batch.
    Skipped { available: usize, required: usize },
    Trained { loss: Loss },
}

impl StepOutcome {
    pub fn loss(&self) -> Option<Loss> {
        match self {
            StepOutcome::Skipped { .. } => None,
            StepOutcome::Trained { loss } => Some(*loss),
        }
    }
}

/// Scalars persisted next to the network weights in a checkpoint.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TrainingState {
    pub epsilon: Epsilon,
    pub steps: usize,
    pub metrics: TrainingMetrics,
}

/// TD targets `r + (1 - done) * gamma * max_a' Q(s', a')`.
/// All inputs are `[B, 1]` except `next_q` which is `[B, A]`.
pub fn td_targets(next_q: &Tensor, rewards: &Tensor, dones: &Tensor, gamma: f64) -> Tensor {
    let max_next = next_q.max_dim(1, true).0;
    let continuation = (dones * -1.0) + 1.0;
    rewards + (continuation * gamma) * max_next
}

const DEFAULT_LOG_TARGET: &str = "dqn::agent";

/// Deep Q-Learning agent with experience replay and a target network, as described in:
/// "Human-level control through deep reinforcement learning", 2015.
pub struct Agent {
    /// Primary model. This model will be trained.
    model: QNetwork,
    /// The target model that will be updated occasionally from the primary model.
    target_model: QNetwork,
    /// Optimizer for the primary model.
    opt: nn::Optimizer,
    buffer: ReplayBuffer,
    policy: EpsilonGreedy,
    /// Random number generator for exploration.
    rng: StdRng,
    settings: AgentSettings,
    /// Number of completed training steps.
    steps: usize,
    metrics: TrainingMetrics,
    log_target: &'static str,
}

impl Agent {
    pub fn new(
        device: tch::Device,
        input_shape: &[usize],
        num_actions: usize,
        model_settings: &ModelSettings,
        settings: AgentSettings,
        seed: Option<u64>,
    ) -> Result<Self> {
        settings.validate()?;
        let model = QNetwork::new(device, input_shape, num_actions, model_settings)?;
        let mut target_model = QNetwork::new(device, input_shape, num_actions, model_settings)?;
        target_model.copy_from(&model)?;
        let opt = nn::Adam::default().build(&model.vs, settings.lr)?;
        let policy = EpsilonGreedy::new(
            settings.epsilon_start,
            settings.epsilon_end,
            settings.epsilon_decay,
        );
        Ok(Self {
            model,
            target_model,
            opt,
            buffer: ReplayBuffer::with_seed(settings.buffer_size, seed),
            policy,
            rng: create_rng(seed.map(|seed| seed.wrapping_add(1))),
            settings,
            steps: 0,
            metrics: TrainingMetrics::default(),
            log_target: DEFAULT_LOG_TARGET,
        })
    }

    /// Use a different log target for this agent's messages.
    pub fn with_log_target(mut self, target: &'static str) -> Self {
        self.log_target = target;
        self
    }

    pub fn add_experience(&mut self, transition: Transition) {
        self.buffer.add(transition);
    }

    /// Epsilon-greedy action with the current exploration rate.
    pub fn select_action(&mut self, observation: &Observation) -> Result<Action> {
        self.policy
            .select_action(&mut self.rng, &self.model, observation)
    }

    pub fn select_action_with(
        &mut self,
        observation: &Observation,
        epsilon: Epsilon,
    ) -> Result<Action> {
        EpsilonGreedy::select_action_with(&mut self.rng, &self.model, observation, epsilon)
    }

    /// Hard copy of the online network into the target network.
    pub fn update_target_network(&mut self) -> Result<()> {
        self.target_model.copy_from(&self.model)
    }

    /// One TD-learning update on a sampled minibatch.
    pub fn train_step(&mut self) -> Result<StepOutcome> {
        let required = self.settings.batch_size;
        if self.buffer.len() < required {
            return Ok(StepOutcome::Skipped {
                available: self.buffer.len(),
                required,
            });
        }

        let batch = self.buffer.sample(required);
        let num_actions = self.model.num_actions();
        if let Some(&action) = batch.actions.iter().find(|&&a| a >= num_actions) {
            return Err(DqnError::InvalidAction {
                action,
                num_actions,
            });
        }
        let BatchTensors {
            states,
            actions,
            next_states,
            rewards,
            dones,
        } = batch.to_tensors(self.model.device())?;
        self.model.check_input(&states)?;
        self.target_model.check_input(&next_states)?;

        let predicted = self.model.forward(&states).gather(1, &actions, false);
        let targets = tch::no_grad(|| {
            let next_q = self.target_model.forward(&next_states);
            td_targets(&next_q, &rewards, &dones, self.settings.gamma)
        });

        // Compute loss & backward step
        let loss = predicted.mse_loss(&targets, tch::Reduction::Mean);
        if let Some(clip) = self.settings.gradient_clip {
            self.opt.backward_step_clip_norm(&loss, clip);
        } else {
            self.opt.backward_step(&loss);
        }
        let loss = loss.double_value(&[]);

        self.steps += 1;
        if self.steps % self.settings.target_update_freq == 0 {
            self.update_target_network()?;
            log::info!(target: self.log_target, "Updated target network at step {}", self.steps);
        }

        let epsilon = self.policy.decay();
        self.metrics.epsilon_history.push(epsilon);
        self.metrics.loss_history.push(loss);
        Ok(StepOutcome::Trained { loss })
    }

    /// Run `num_steps` training steps and return the average loss of the steps that weren't skipped.
    pub fn train_from_buffer(&mut self, num_steps: usize) -> Result<Option<Loss>> {
        let mut total = 0.0;
        let mut trained = 0;
        for i in 0..num_steps {
            if let StepOutcome::Trained { loss } = self.train_step()? {
                total += loss;
                trained += 1;
            }
            if (i + 1) % 100 == 0 && trained > 0 {
                log::info!(
                    target: self.log_target,
                    "Step {}/{}, Avg Loss: {:.4}, Epsilon: {:.4}",
                    i + 1,
                    num_steps,
                    total / trained as f64,
                    self.policy.epsilon()
                );
            }
        }
        Ok(if trained > 0 {
            Some(total / trained as f64)
        } else {
            None
        })
    }

    /// Record the outcome of an episode and log it next to the averages of the last 10 episodes.
    pub fn record_episode(&mut self, total_reward: f64, length: usize) {
        self.metrics.record_episode(total_reward, length);
        log::info!(target: self.log_target, "{}", self.episode_report());
    }

    /// Summary of the last recorded episode.
    fn episode_report(&self) -> String {
        let metrics = &self.metrics;
        let episode = metrics.episode_rewards.len();
        format!(
            "Episode {}, Reward: {:.2}, Length: {}, Avg Reward: {:.2}, Avg Length: {:.2}, Epsilon: {:.4}",
            episode,
            metrics.episode_rewards.last().copied().unwrap_or_default(),
            metrics.episode_lengths.last().copied().unwrap_or_default(),
            metrics.recent_average_reward(10).unwrap_or_default(),
            metrics.recent_average_length(10).unwrap_or_default(),
            self.policy.epsilon()
        )
    }

    pub fn training_state(&self) -> TrainingState {
        TrainingState {
            epsilon: self.policy.epsilon(),
            steps: self.steps,
            metrics: self.metrics.clone(),
        }
    }

    /// Save a checkpoint into `dir` and return its name.
    /// The name defaults to `dqn_model_<unix seconds>`.
    pub fn save<P: AsRef<Path>>(&self, dir: P, name: Option<&str>) -> Result<String> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let paths = match name {
            Some(name) => CheckpointPaths::new(dir, name),
            None => CheckpointPaths::new(dir, &CheckpointPaths::default_name()),
        };
        self.model.save(&paths.q_network)?;
        self.target_model.save(&paths.target_network)?;
        write_atomic(
            &paths.training_state,
            &bincode::serialize(&self.training_state())?,
        )?;
        log::info!(target: self.log_target, "Model saved to {}", dir.join(&paths.name).display());
        Ok(paths.name)
    }

    /// Restore a checkpoint saved by [`Agent::save`].
    ///
    /// Every artifact is read and validated before anything is applied,
    /// so the agent is unchanged when this returns an error.
    pub fn load<P: AsRef<Path>>(&mut self, dir: P, name: &str) -> Result<()> {
        let paths = CheckpointPaths::new(dir.as_ref(), name);
        paths.ensure_exist()?;
        let online = self.model.read_parameters(&paths.q_network)?;
        let target = self.target_model.read_parameters(&paths.target_network)?;
        let state: TrainingState = bincode::deserialize(&std::fs::read(&paths.training_state)?)?;

        self.model.apply_parameters(online)?;
        self.target_model.apply_parameters(target)?;
        self.policy.set_epsilon(state.epsilon);
        self.steps = state.steps;
        self.metrics = state.metrics;
        log::info!(target: self.log_target, "Model loaded from {}", dir.as_ref().join(name).display());
        Ok(())
    }

    pub fn epsilon(&self) -> Epsilon {
        self.policy.epsilon()
    }

    /// Target of this agent's log messages.
    pub fn log_target(&self) -> &'static str {
        self.log_target
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn metrics(&self) -> &TrainingMetrics {
        &self.metrics
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    pub fn buffer(&self) -> &ReplayBuffer {
        &self.buffer
    }

    /// The online network.
    pub fn model(&self) -> &QNetwork {
        &self.model
    }

    pub fn target_model(&self) -> &QNetwork {
        &self.target_model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array1;

    fn settings() -> AgentSettings {
        AgentSettings {
            lr: 1e-3,
            batch_size: 4,
            buffer_size: 100,
            target_update_freq: 3,
            ..Default::default()
        }
    }

    fn agent(settings: AgentSettings) -> Agent {
        Agent::new(
            tch::Device::Cpu,
            &[4],
            3,
            &ModelSettings::Dense { hidden: vec![8] },
            settings,
            Some(11),
        )
        .unwrap()
    }

    fn transition(i: usize, done: bool) -> Transition {
        let x = i as f32 * 0.1;
        Transition::new(
            Array1::from_vec(vec![x, -x, 1.0, 0.5]).into_dyn(),
            i % 3,
            Array1::from_vec(vec![x + 0.1, -x, 1.0, 0.5]).into_dyn(),
            1.0 - x,
            done,
        )
    }

    fn same_parameters(a: &QNetwork, b: &QNetwork) -> bool {
        let a = a.vs.variables();
        let b = b.vs.variables();
        a.iter()
            .all(|(name, tensor)| b.get(name).map_or(false, |other| tensor.equal(other)))
    }

    fn parameters(network: &QNetwork) -> Vec<(String, Tensor)> {
        network
            .vs
            .variables()
            .into_iter()
            .map(|(name, tensor)| (name, tensor.copy()))
            .collect()
    }

    #[test]
    fn skipped_without_enough_data() {
        let mut agent = agent(AgentSettings {
            batch_size: 64,
            ..settings()
        });
        for i in 0..10 {
            agent.add_experience(transition(i, false));
        }
        assert_eq!(
            agent.train_step().unwrap(),
            StepOutcome::Skipped {
                available: 10,
                required: 64
            }
        );
        assert_eq!(agent.steps(), 0);
        assert_eq!(agent.epsilon(), 1.0);
        assert_eq!(agent.train_from_buffer(5).unwrap(), None);
    }

    #[test]
    fn terminal_target_is_reward() {
        let next_q = Tensor::from_slice(&[3.0f32, -7.0, 1e6, 2.0]).reshape([2, 2]);
        let rewards = Tensor::from_slice(&[0.25f32, -1.5]).reshape([2, 1]);
        let dones = Tensor::from_slice(&[1.0f32, 1.0]).reshape([2, 1]);
        for gamma in [0.0, 0.5, 0.99, 1.0] {
            let y = td_targets(&next_q, &rewards, &dones, gamma);
            assert!(y.equal(&rewards));
        }
        let dones = Tensor::from_slice(&[0.0f32, 1.0]).reshape([2, 1]);
        let y = td_targets(&next_q, &rewards, &dones, 0.5);
        assert_eq!(y.double_value(&[0, 0]), 0.25 + 0.5 * 3.0);
        assert_eq!(y.double_value(&[1, 0]), -1.5);
    }

    #[test]
    fn target_syncs_periodically() {
        let mut agent = agent(settings());
        for i in 0..8 {
            agent.add_experience(transition(i, i == 7));
        }
        assert!(same_parameters(agent.model(), agent.target_model()));
        let mut previous = parameters(agent.target_model());
        for step in 1..=7 {
            let outcome = agent.train_step().unwrap();
            assert!(outcome.loss().unwrap().is_finite());
            let current = agent.target_model().vs.variables();
            let unchanged = previous
                .iter()
                .all(|(name, tensor)| current[name].equal(tensor));
            if step % 3 == 0 {
                assert!(same_parameters(agent.model(), agent.target_model()));
            } else {
                assert!(unchanged);
            }
            previous = parameters(agent.target_model());
        }
        assert_eq!(agent.steps(), 7);
    }

    #[test]
    fn epsilon_decays_per_step() {
        let mut agent = agent(settings());
        for i in 0..8 {
            agent.add_experience(transition(i, false));
        }
        let loss = agent.train_from_buffer(20).unwrap();
        assert!(loss.unwrap().is_finite());
        let history = &agent.metrics().epsilon_history;
        assert_eq!(history.len(), 20);
        assert!(history.windows(2).all(|w| w[1] <= w[0]));
        assert_eq!(*history.last().unwrap(), agent.epsilon());
        assert_eq!(agent.metrics().loss_history.len(), 20);
    }

    #[test]
    fn shape_mismatch_aborts_step() {
        let mut agent = agent(settings());
        for _ in 0..4 {
            agent.add_experience(Transition::new(
                Array1::zeros(5).into_dyn(),
                0,
                Array1::zeros(5).into_dyn(),
                0.0,
                false,
            ));
        }
        assert!(matches!(
            agent.train_step(),
            Err(DqnError::ShapeMismatch { .. })
        ));
        assert_eq!(agent.steps(), 0);
    }

    #[test]
    fn invalid_action_aborts_step() {
        let mut agent = agent(settings());
        for i in 0..4 {
            let mut t = transition(i, false);
            t.action = 3;
            agent.add_experience(t);
        }
        assert!(matches!(
            agent.train_step(),
            Err(DqnError::InvalidAction { action: 3, num_actions: 3 })
        ));
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut trained = agent(settings());
        for i in 0..8 {
            trained.add_experience(transition(i, i % 4 == 3));
        }
        trained.train_from_buffer(5).unwrap();
        trained.record_episode(12.5, 40);
        let name = trained.save(dir.path(), Some("round_trip")).unwrap();
        assert_eq!(name, "round_trip");

        let mut restored = agent(settings());
        restored.load(dir.path(), "round_trip").unwrap();
        assert_eq!(restored.epsilon(), trained.epsilon());
        assert_eq!(restored.steps(), 5);
        assert_eq!(restored.metrics(), trained.metrics());
        assert!(same_parameters(restored.model(), trained.model()));
        assert!(same_parameters(restored.target_model(), trained.target_model()));
        for i in 0..5 {
            let observation = transition(i, false).state;
            assert_eq!(
                restored.select_action_with(&observation, 0.0).unwrap(),
                trained.select_action_with(&observation, 0.0).unwrap()
            );
        }
    }

    #[test]
    fn load_requires_every_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let trained = agent(settings());
        trained.save(dir.path(), Some("partial")).unwrap();
        std::fs::remove_file(dir.path().join("partial_training_state.bin")).unwrap();

        let mut other = agent(settings());
        let before = parameters(other.model());
        assert!(matches!(
            other.load(dir.path(), "partial"),
            Err(DqnError::ArtifactNotFound(_))
        ));
        let current = other.model().vs.variables();
        assert!(before.iter().all(|(name, tensor)| current[name].equal(tensor)));
    }

    #[test]
    fn load_rejects_other_architecture() {
        let dir = tempfile::tempdir().unwrap();
        agent(settings()).save(dir.path(), Some("small")).unwrap();
        let mut bigger = Agent::new(
            tch::Device::Cpu,
            &[4],
            3,
            &ModelSettings::Dense { hidden: vec![16] },
            settings(),
            None,
        )
        .unwrap();
        assert!(matches!(
            bigger.load(dir.path(), "small"),
            Err(DqnError::ShapeMismatch { .. })
        ));
        assert_eq!(bigger.steps(), 0);
    }

    #[test]
    fn every_episode_is_reported() {
        let mut agent = agent(settings()).with_log_target("space");
        assert_eq!(agent.log_target(), "space");
        agent.record_episode(4.0, 10);
        assert_eq!(
            agent.episode_report(),
            "Episode 1, Reward: 4.00, Length: 10, Avg Reward: 4.00, Avg Length: 10.00, Epsilon: 1.0000"
        );
        agent.record_episode(-2.0, 30);
        assert_eq!(
            agent.episode_report(),
            "Episode 2, Reward: -2.00, Length: 30, Avg Reward: 1.00, Avg Length: 20.00, Epsilon: 1.0000"
        );
    }

    #[test]
    fn settings_validation() {
        assert!(AgentSettings::default().validate().is_ok());
        let invalid = [
            AgentSettings {
                target_update_freq: 0,
                ..Default::default()
            },
            AgentSettings {
                gamma: 1.5,
                ..Default::default()
            },
            AgentSettings {
                epsilon_decay: 0.0,
                ..Default::default()
            },
            AgentSettings {
                batch_size: 0,
                ..Default::default()
            },
            AgentSettings {
                batch_size: 64,
                buffer_size: 32,
                ..Default::default()
            },
        ];
        for settings in invalid {
            assert!(matches!(
                settings.validate(),
                Err(DqnError::InvalidSettings(_))
            ));
        }
    }
}
