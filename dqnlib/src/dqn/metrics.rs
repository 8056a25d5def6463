use std::path::Path;

use crate::io::fs::write_json_pretty;

use super::*;

/// Histories collected while training.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct TrainingMetrics {
    /// Total reward of each episode.
    pub episode_rewards: Vec<f64>,
    /// Number of steps in each episode.
    pub episode_lengths: Vec<usize>,
    /// Exploration rate after each training step.
    pub epsilon_history: Vec<Epsilon>,
    /// Loss of each training step.
    pub loss_history: Vec<Loss>,
}

fn tail_mean<T: Copy + Into<f64>>(values: &[T], window: usize) -> Option<f64> {
    let tail = &values[values.len().saturating_sub(window)..];
    if tail.is_empty() {
        None
    } else {
        Some(tail.iter().map(|&v| v.into()).sum::<f64>() / tail.len() as f64)
    }
}

impl TrainingMetrics {
    pub fn record_episode(&mut self, total_reward: f64, length: usize) {
        self.episode_rewards.push(total_reward);
        self.episode_lengths.push(length);
    }

    /// Mean reward of the last `window` episodes.
    pub fn recent_average_reward(&self, window: usize) -> Option<f64> {
        tail_mean(&self.episode_rewards, window)
    }

    /// Mean length of the last `window` episodes.
    pub fn recent_average_length(&self, window: usize) -> Option<f64> {
        let lengths: Vec<f64> = self.episode_lengths.iter().map(|&l| l as f64).collect();
        tail_mean(&lengths, window)
    }

    /// Export all histories as pretty JSON.
    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        write_json_pretty(path.as_ref(), self)
    }
}
