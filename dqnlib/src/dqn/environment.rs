//! Environment module for DQN.
//!
//! [`SpaceGameEnv`] is a lightweight simulation of the space shooter. It has no physics:
//! every step the player moves and/or shoots, shots hit with a fixed probability and
//! enemies damage the player with a fixed probability.
use std::path::Path;

use ndarray::{s, Array2};
use serde::{Deserialize, Serialize};

use crate::{
    create_rng,
    io::fs::write_json_pretty,
    types::{Action, Observation, Reward},
    DqnError, Result,
};

use rand::{rngs::StdRng, Rng};

/// Initial health of the player.
pub const MAX_HEALTH: i32 = 100;
/// Number of enemies in a level. Destroying all of them ends the episode.
pub const ENEMY_COUNT: u32 = 50;
const HIT_PROBABILITY: f64 = 0.3;
const ENEMY_FIRE_PROBABILITY: f64 = 0.2;
/// Damage taken from an enemy shot, upper bound excluded.
const ENEMY_DAMAGE: std::ops::Range<i32> = 5..15;
const KILL_SCORE: u32 = 100;
const MOVE_STEP: f64 = 0.1;

const PLAYER_ROWS: usize = 10;
const PLAYER_HALF_WIDTH: usize = 5;
const PLAYER_VALUE: f32 = 1.0;
const ENEMY_SIZE: usize = 3;
const ENEMY_VALUE: f32 = 0.7;
/// Enemies are drawn above this many rows from the bottom.
const ENEMY_MARGIN: usize = 20;

/// Discrete actions of the space shooter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GameAction {
    Left = 0,
    Right = 1,
    Shoot = 2,
    LeftShoot = 3,
    RightShoot = 4,
    Idle = 5,
}

impl GameAction {
    pub const COUNT: usize = 6;
    pub const ALL: [GameAction; GameAction::COUNT] = [
        GameAction::Left,
        GameAction::Right,
        GameAction::Shoot,
        GameAction::LeftShoot,
        GameAction::RightShoot,
        GameAction::Idle,
    ];

    pub fn from_index(index: Action) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// Horizontal movement direction: -1, 0 or 1.
    fn direction(self) -> f64 {
        match self {
            GameAction::Left | GameAction::LeftShoot => -1.0,
            GameAction::Right | GameAction::RightShoot => 1.0,
            _ => 0.0,
        }
    }

    fn shoots(self) -> bool {
        matches!(
            self,
            GameAction::Shoot | GameAction::LeftShoot | GameAction::RightShoot
        )
    }
}

/// Counters of the simulated game.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GameCounters {
    pub player_health: i32,
    pub score: u32,
    pub enemies_destroyed: u32,
    pub step: usize,
}

impl GameCounters {
    fn new() -> Self {
        Self {
            player_health: MAX_HEALTH,
            score: 0,
            enemies_destroyed: 0,
            step: 0,
        }
    }
}

/// Computes the reward of a step from the counters after the step.
pub trait RewardFunction: Send {
    fn reward(&self, counters: &GameCounters) -> Reward;
}

/// Rewards destroyed enemies and survival, penalizes damage and death,
/// and gives a large bonus for clearing the level.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpaceGameReward;

impl RewardFunction for SpaceGameReward {
    fn reward(&self, counters: &GameCounters) -> Reward {
        let mut reward = counters.enemies_destroyed as Reward * 1.0;
        reward += 0.1;
        if counters.player_health < MAX_HEALTH {
            reward -= 0.5;
        }
        if counters.player_health <= 0 {
            reward -= 10.0;
        }
        if counters.enemies_destroyed >= ENEMY_COUNT {
            reward += 50.0;
        }
        reward
    }
}

/// Auxiliary information of a step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StepInfo {
    pub player_health: i32,
    pub score: u32,
    pub enemies_destroyed: u32,
    pub step: usize,
    pub total_reward: f64,
}

pub struct StepResult {
    pub observation: Observation,
    pub reward: Reward,
    pub done: bool,
    pub info: StepInfo,
}

/// Summary of a finished episode.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpisodeSummary {
    pub total_reward: f64,
    pub episode_length: usize,
    pub final_score: u32,
    pub enemies_destroyed: u32,
}

impl EpisodeSummary {
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        write_json_pretty(path.as_ref(), self)
    }
}

pub trait Environment {
    /// Start a new episode and return the initial observation.
    fn reset(&mut self) -> Observation;
    /// Apply an action. Fails if the action is out of range.
    fn step(&mut self, action: Action) -> Result<StepResult>;
    fn observation_shape(&self) -> Vec<usize>;
    fn num_actions(&self) -> usize;
    /// Summary of the current (or last finished) episode.
    fn episode_summary(&self) -> EpisodeSummary;
}

fn default_size() -> usize {
    84
}

fn default_max_steps() -> usize {
    1000
}

/// Settings for [`SpaceGameEnv`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct EnvironmentSettings {
    #[serde(default = "default_size")]
    pub height: usize,
    #[serde(default = "default_size")]
    pub width: usize,
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
}

impl Default for EnvironmentSettings {
    fn default() -> Self {
        Self {
            height: default_size(),
            width: default_size(),
            max_steps: default_max_steps(),
        }
    }
}

/// Simulated space shooter producing `[height, width]` observations.
pub struct SpaceGameEnv {
    settings: EnvironmentSettings,
    counters: GameCounters,
    /// Horizontal position of the player in `[0, 1]`.
    player_position: f64,
    total_reward: f64,
    rng: StdRng,
    reward_fn: Box<dyn RewardFunction>,
}

impl SpaceGameEnv {
    pub fn new(settings: EnvironmentSettings, seed: Option<u64>) -> Result<Self> {
        Self::with_reward(settings, seed, Box::new(SpaceGameReward))
    }

    pub fn with_reward(
        settings: EnvironmentSettings,
        seed: Option<u64>,
        reward_fn: Box<dyn RewardFunction>,
    ) -> Result<Self> {
        if settings.height == 0 || settings.width == 0 {
            return Err(DqnError::InvalidSettings(format!(
                "invalid screen size {}x{}",
                settings.height, settings.width
            )));
        }
        Ok(Self {
            settings,
            counters: GameCounters::new(),
            player_position: 0.5,
            total_reward: 0.0,
            rng: create_rng(seed),
            reward_fn,
        })
    }

    pub fn counters(&self) -> &GameCounters {
        &self.counters
    }

    pub fn player_position(&self) -> f64 {
        self.player_position
    }

    fn is_done(&self) -> bool {
        self.counters.player_health <= 0
            || self.counters.step >= self.settings.max_steps
            || self.counters.enemies_destroyed >= ENEMY_COUNT
    }

    fn info(&self) -> StepInfo {
        StepInfo {
            player_health: self.counters.player_health,
            score: self.counters.score,
            enemies_destroyed: self.counters.enemies_destroyed,
            step: self.counters.step,
            total_reward: self.total_reward,
        }
    }

    /// Render the screen: a bright bar for the player on the bottom rows
    /// and a small dot for each remaining enemy at a random position.
    fn observation(&mut self) -> Observation {
        let (height, width) = (self.settings.height, self.settings.width);
        let mut screen = Array2::<f32>::zeros((height, width));

        let player_x = (self.player_position * width as f64) as usize;
        let left = player_x.saturating_sub(PLAYER_HALF_WIDTH);
        let right = (player_x + PLAYER_HALF_WIDTH).min(width);
        if left < right {
            screen
                .slice_mut(s![height.saturating_sub(PLAYER_ROWS).., left..right])
                .fill(PLAYER_VALUE);
        }

        let enemy_rows = height.saturating_sub(ENEMY_MARGIN).max(1);
        for _ in self.counters.enemies_destroyed..ENEMY_COUNT {
            let x = self.rng.gen_range(0..width);
            let y = self.rng.gen_range(0..enemy_rows);
            screen
                .slice_mut(s![y..(y + ENEMY_SIZE).min(height), x..(x + ENEMY_SIZE).min(width)])
                .fill(ENEMY_VALUE);
        }
        screen.into_dyn()
    }
}

impl Environment for SpaceGameEnv {
    fn reset(&mut self) -> Observation {
        self.counters = GameCounters::new();
        self.player_position = 0.5;
        self.total_reward = 0.0;
        self.observation()
    }

    fn step(&mut self, action: Action) -> Result<StepResult> {
        let game_action = GameAction::from_index(action).ok_or(DqnError::InvalidAction {
            action,
            num_actions: GameAction::COUNT,
        })?;

        self.player_position =
            (self.player_position + game_action.direction() * MOVE_STEP).clamp(0.0, 1.0);
        if game_action.shoots() && self.rng.gen_bool(HIT_PROBABILITY) {
            self.counters.enemies_destroyed += 1;
            self.counters.score += KILL_SCORE;
        }
        if self.rng.gen_bool(ENEMY_FIRE_PROBABILITY) {
            let damage = self.rng.gen_range(ENEMY_DAMAGE);
            self.counters.player_health = (self.counters.player_health - damage).max(0);
        }
        self.counters.step += 1;
        self.counters.score += 1;

        let reward = self.reward_fn.reward(&self.counters);
        self.total_reward += reward as f64;
        let done = self.is_done();
        Ok(StepResult {
            observation: self.observation(),
            reward,
            done,
            info: self.info(),
        })
    }

    fn observation_shape(&self) -> Vec<usize> {
        vec![self.settings.height, self.settings.width]
    }

    fn num_actions(&self) -> usize {
        GameAction::COUNT
    }

    fn episode_summary(&self) -> EpisodeSummary {
        EpisodeSummary {
            total_reward: self.total_reward,
            episode_length: self.counters.step,
            final_score: self.counters.score,
            enemies_destroyed: self.counters.enemies_destroyed,
        }
    }
}
