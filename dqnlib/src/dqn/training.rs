use std::{
    path::PathBuf,
    sync::atomic::{AtomicBool, Ordering},
};

use super::environment::Environment;
use super::*;

/// Options of [`train_with_environment`].
#[derive(Debug, Clone)]
pub struct EpisodeSettings {
    pub episodes: usize,
    /// Episode summaries are saved here as `episode_<n>.json` if present.
    pub data_dir: Option<PathBuf>,
    /// Log the progress every this many steps of an episode.
    pub log_period: usize,
}

impl Default for EpisodeSettings {
    fn default() -> Self {
        Self {
            episodes: 10,
            data_dir: None,
            log_period: 100,
        }
    }
}

/// Train the agent online, taking one training step after every environment step.
///
/// `stop` is checked between steps; an interrupted episode is still recorded.
/// Returns the number of completed episodes.
pub fn train_with_environment<E: Environment>(
    agent: &mut Agent,
    env: &mut E,
    settings: &EpisodeSettings,
    stop: &AtomicBool,
) -> Result<usize> {
    if let Some(dir) = &settings.data_dir {
        std::fs::create_dir_all(dir)?;
    }
    let target = agent.log_target();
    let mut completed = 0;
    for episode in 1..=settings.episodes {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        let mut state = env.reset();
        let mut total_reward = 0.0;
        let mut steps = 0;
        loop {
            let action = agent.select_action(&state)?;
            let result = env.step(action)?;
            total_reward += result.reward as f64;
            steps += 1;
            agent.add_experience(Transition::new(
                state,
                action,
                result.observation.clone(),
                result.reward,
                result.done,
            ));
            let outcome = agent.train_step()?;
            state = result.observation;

            if settings.log_period > 0 && steps % settings.log_period == 0 {
                let loss = match outcome.loss() {
                    Some(loss) => format!("{:.4}", loss),
                    None => "-".to_string(),
                };
                log::info!(
                    target: target,
                    "Episode {}, Step {}, Reward: {:.2}, Loss: {}, Epsilon: {:.4}",
                    episode,
                    steps,
                    total_reward,
                    loss,
                    agent.epsilon()
                );
            }
            if result.done || stop.load(Ordering::SeqCst) {
                break;
            }
        }

        agent.record_episode(total_reward, steps);
        if let Some(dir) = &settings.data_dir {
            env.episode_summary()
                .save(dir.join(format!("episode_{}.json", episode)))?;
        }
        completed += 1;
    }
    Ok(completed)
}

/// Train the agent from recorded transitions.
///
/// The transitions are added to the replay buffer, then each epoch runs
/// `len / batch_size + 1` training steps. Returns the average loss of each epoch,
/// `None` for epochs where every step was skipped.
pub fn train_from_transitions<I: IntoIterator<Item = Transition>>(
    agent: &mut Agent,
    transitions: I,
    epochs: usize,
    stop: &AtomicBool,
) -> Result<Vec<Option<Loss>>> {
    let target = agent.log_target();
    let mut count = 0;
    for transition in transitions {
        agent.add_experience(transition);
        count += 1;
    }
    let stored = agent.buffer().len();
    if stored < count {
        log::warn!(
            target: target,
            "Replay buffer keeps only the last {} of {} transitions",
            stored,
            count
        );
    }
    let steps_per_epoch = stored / agent.settings().batch_size + 1;
    log::info!(
        target: target,
        "Training on {} transitions, {} steps per epoch",
        stored,
        steps_per_epoch
    );

    let mut losses = Vec::with_capacity(epochs);
    for epoch in 1..=epochs {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        let loss = agent.train_from_buffer(steps_per_epoch)?;
        match loss {
            Some(loss) => log::info!(target: target, "Epoch {}/{}, Loss: {:.4}", epoch, epochs, loss),
            None => log::warn!(
                target: target,
                "Epoch {}/{}: not enough transitions for a batch of {}",
                epoch,
                epochs,
                agent.settings().batch_size
            ),
        }
        losses.push(loss);
    }
    Ok(losses)
}

/// Result of a greedy evaluation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct EvaluationResult {
    pub episode_rewards: Vec<f64>,
    pub episode_lengths: Vec<usize>,
    pub avg_reward: f64,
    pub avg_length: f64,
}

/// Play `episodes` episodes with the greedy policy without training.
pub fn evaluate<E: Environment>(
    agent: &mut Agent,
    env: &mut E,
    episodes: usize,
) -> Result<EvaluationResult> {
    let mut episode_rewards = Vec::with_capacity(episodes);
    let mut episode_lengths = Vec::with_capacity(episodes);
    for episode in 1..=episodes {
        let mut state = env.reset();
        let mut total_reward = 0.0;
        let mut steps = 0;
        loop {
            let action = agent.select_action_with(&state, 0.0)?;
            let result = env.step(action)?;
            total_reward += result.reward as f64;
            steps += 1;
            state = result.observation;
            if result.done {
                break;
            }
        }
        log::info!(
            target: agent.log_target(),
            "Evaluation episode {}/{}: reward {:.2}, length {}",
            episode,
            episodes,
            total_reward,
            steps
        );
        episode_rewards.push(total_reward);
        episode_lengths.push(steps);
    }
    let n = episodes.max(1) as f64;
    Ok(EvaluationResult {
        avg_reward: episode_rewards.iter().sum::<f64>() / n,
        avg_length: episode_lengths.iter().sum::<usize>() as f64 / n,
        episode_rewards,
        episode_lengths,
    })
}

#[cfg(test)]
mod tests {
    use crate::dqn::environment::{EnvironmentSettings, SpaceGameEnv};
    use super::*;

    fn small_env(seed: u64) -> SpaceGameEnv {
        SpaceGameEnv::new(
            EnvironmentSettings {
                height: 24,
                width: 24,
                max_steps: 12,
            },
            Some(seed),
        )
        .unwrap()
    }

    fn small_agent() -> Agent {
        Agent::new(
            tch::Device::Cpu,
            &[24, 24],
            6,
            &ModelSettings::Dense { hidden: vec![16] },
            AgentSettings {
                batch_size: 8,
                buffer_size: 200,
                target_update_freq: 10,
                ..Default::default()
            },
            Some(2),
        )
        .unwrap()
    }

    #[test]
    fn environment_training() {
        let dir = tempfile::tempdir().unwrap();
        let mut agent = small_agent();
        let mut env = small_env(4);
        let settings = EpisodeSettings {
            episodes: 3,
            data_dir: Some(dir.path().to_path_buf()),
            log_period: 5,
        };
        let stop = AtomicBool::new(false);
        let completed = train_with_environment(&mut agent, &mut env, &settings, &stop).unwrap();
        assert_eq!(completed, 3);

        let metrics = agent.metrics();
        assert_eq!(metrics.episode_rewards.len(), 3);
        let total_steps: usize = metrics.episode_lengths.iter().sum();
        assert_eq!(agent.buffer().len(), total_steps);
        // Training starts once the buffer holds a full batch.
        assert_eq!(agent.steps(), total_steps - 7);
        for episode in 1..=3 {
            assert!(dir.path().join(format!("episode_{}.json", episode)).exists());
        }
    }

    #[test]
    fn stop_flag_prevents_episodes() {
        let mut agent = small_agent();
        let mut env = small_env(4);
        let stop = AtomicBool::new(true);
        let completed =
            train_with_environment(&mut agent, &mut env, &EpisodeSettings::default(), &stop)
                .unwrap();
        assert_eq!(completed, 0);
        assert!(agent.metrics().episode_rewards.is_empty());
    }

    #[test]
    fn recorded_transitions() {
        let mut env = small_env(5);
        let mut transitions = Vec::new();
        let mut state = env.reset();
        for i in 0..20 {
            let result = env.step(i % 6).unwrap();
            transitions.push(Transition::new(
                state,
                i % 6,
                result.observation.clone(),
                result.reward,
                result.done,
            ));
            state = if result.done {
                env.reset()
            } else {
                result.observation
            };
        }
        let mut agent = small_agent();
        let stop = AtomicBool::new(false);
        let losses = train_from_transitions(&mut agent, transitions, 2, &stop).unwrap();
        assert_eq!(losses.len(), 2);
        assert!(losses.iter().all(|loss| loss.is_some()));
        // 20 / 8 + 1 steps per epoch
        assert_eq!(agent.steps(), 6);

        let mut agent = small_agent();
        let losses = train_from_transitions(&mut agent, Vec::new(), 2, &stop).unwrap();
        assert_eq!(losses, vec![None, None]);
    }

    #[test]
    fn epoch_covers_stored_transitions() {
        let mut env = small_env(7);
        let mut state = env.reset();
        let mut transitions = Vec::new();
        for i in 0..20 {
            let result = env.step(i % 6).unwrap();
            let next = result.observation.clone();
            transitions.push(Transition::new(state, i % 6, next, result.reward, false));
            state = result.observation;
        }
        let mut agent = Agent::new(
            tch::Device::Cpu,
            &[24, 24],
            6,
            &ModelSettings::Dense { hidden: vec![16] },
            AgentSettings {
                batch_size: 8,
                buffer_size: 8,
                ..Default::default()
            },
            Some(3),
        )
        .unwrap();
        let stop = AtomicBool::new(false);
        let losses = train_from_transitions(&mut agent, transitions, 2, &stop).unwrap();
        assert_eq!(losses.len(), 2);
        assert_eq!(agent.buffer().len(), 8);
        // 8 / 8 + 1 steps per epoch
        assert_eq!(agent.steps(), 4);
    }

    #[test]
    fn greedy_evaluation() {
        let mut agent = small_agent();
        let mut env = small_env(6);
        let result = evaluate(&mut agent, &mut env, 2).unwrap();
        assert_eq!(result.episode_rewards.len(), 2);
        assert!(result.episode_lengths.iter().all(|&l| l > 0 && l <= 12));
        assert_eq!(agent.steps(), 0);
        assert_eq!(agent.epsilon(), 1.0);
    }
}
