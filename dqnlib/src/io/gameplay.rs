//! Externally collected gameplay: ingestion, episode files and statistics.
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::Value;

use super::fs::{list_files, timestamp, write_atomic, write_json_pretty};
use super::*;
use crate::dqn::{environment::GameAction, Transition};

/// Keys every recorded step must have.
pub const REQUIRED_KEYS: [&str; 5] = ["state", "action", "reward", "next_state", "done"];

/// Result of [`GameplayRecorder::record_step`].
#[derive(Debug, Clone, PartialEq)]
pub enum RecordOutcome {
    /// The step was added to the current episode.
    Buffered,
    /// The step ended the episode, which was saved to the given file.
    EpisodeSaved(PathBuf),
}

/// Summary statistics of the recorded episodes.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct GameplayStatistics {
    pub episodes: usize,
    pub total_steps: usize,
    pub avg_steps_per_episode: f64,
    pub avg_reward_per_episode: f64,
    /// Percentage of each action, keyed by the action index.
    pub action_distribution: BTreeMap<String, f64>,
}

const DEFAULT_LOG_TARGET: &str = "dqn::gameplay";

/// Parse a step record. Actions must be in `[0, num_actions)`.
fn parse_step(record: &Value, num_actions: usize) -> Result<Transition> {
    for key in REQUIRED_KEYS {
        if record.get(key).is_none() {
            return Err(DqnError::MissingField(key.to_string()));
        }
    }
    let state = observation_from_json(&record["state"])?;
    let next_state = observation_from_json(&record["next_state"])?;
    if state.shape() != next_state.shape() {
        return Err(DqnError::shape_mismatch(state.shape(), next_state.shape()));
    }
    let action = record["action"].as_u64().ok_or_else(|| {
        DqnError::InvalidRecord(format!(
            "action must be a non-negative integer, got {}",
            record["action"]
        ))
    })?;
    let action = match usize::try_from(action) {
        Ok(action) if action < num_actions => action,
        _ => {
            return Err(DqnError::InvalidRecord(format!(
                "action must be less than {}, got {}",
                num_actions, action
            )))
        }
    };
    let reward = record["reward"].as_f64().ok_or_else(|| {
        DqnError::InvalidRecord(format!("reward must be a number, got {}", record["reward"]))
    })? as f32;
    if !reward.is_finite() {
        return Err(DqnError::InvalidRecord(format!(
            "reward {} is out of range",
            record["reward"]
        )));
    }
    let done = record["done"].as_bool().ok_or_else(|| {
        DqnError::InvalidRecord(format!("done must be a boolean, got {}", record["done"]))
    })?;
    Ok(Transition::new(state, action, next_state, reward, done))
}

fn step_to_json(transition: &Transition) -> Value {
    serde_json::json!({
        "state": observation_to_json(&transition.state),
        "action": transition.action,
        "reward": transition.reward,
        "next_state": observation_to_json(&transition.next_state),
        "done": transition.done,
    })
}

/// Records gameplay steps coming from a client and splits them into episodes.
pub struct GameplayRecorder {
    data_dir: PathBuf,
    /// Finished episodes.
    episodes: Vec<Vec<Transition>>,
    current_episode: Vec<Transition>,
    /// Number of episodes saved by this recorder.
    episode_counter: usize,
    /// Recorded actions must be less than this.
    num_actions: usize,
    log_target: &'static str,
}

impl GameplayRecorder {
    /// Episode files are saved into `data_dir`, which is created if missing.
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&data_dir)?;
        Ok(Self {
            data_dir,
            episodes: Vec::new(),
            current_episode: Vec::new(),
            episode_counter: 0,
            num_actions: GameAction::COUNT,
            log_target: DEFAULT_LOG_TARGET,
        })
    }

    /// Accept actions in `[0, num_actions)` instead of the game's action set.
    pub fn with_num_actions(mut self, num_actions: usize) -> Self {
        self.num_actions = num_actions;
        self
    }

    /// Use a different log target for this recorder's messages.
    pub fn with_log_target(mut self, target: &'static str) -> Self {
        self.log_target = target;
        self
    }

    pub fn num_actions(&self) -> usize {
        self.num_actions
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Validate and buffer a step record. The episode is saved when `done` is true.
    ///
    /// Invalid records are rejected and logged; the current episode is kept.
    pub fn record_step(&mut self, record: &Value) -> Result<RecordOutcome> {
        let transition = match self.validate(record) {
            Ok(transition) => transition,
            Err(error) => {
                log::warn!(target: self.log_target, "Rejected gameplay step: {}", error);
                return Err(error);
            }
        };
        let done = transition.done;
        self.current_episode.push(transition);
        if done {
            let episode = std::mem::take(&mut self.current_episode);
            let path = self.save_episode(episode)?;
            Ok(RecordOutcome::EpisodeSaved(path))
        } else {
            Ok(RecordOutcome::Buffered)
        }
    }

    fn validate(&self, record: &Value) -> Result<Transition> {
        let transition = parse_step(record, self.num_actions)?;
        if let Some(first) = self.current_episode.first() {
            if first.state.shape() != transition.state.shape() {
                return Err(DqnError::shape_mismatch(
                    first.state.shape(),
                    transition.state.shape(),
                ));
            }
        }
        Ok(transition)
    }

    /// Keep a finished episode and save it as `episode_<n>_<timestamp>.json`.
    /// The episode is kept in memory even if saving fails.
    pub fn save_episode(&mut self, episode: Vec<Transition>) -> Result<PathBuf> {
        self.episode_counter += 1;
        let path = self.data_dir.join(format!(
            "episode_{}_{}.json",
            self.episode_counter,
            timestamp()
        ));
        let steps: Vec<Value> = episode.iter().map(step_to_json).collect();
        self.episodes.push(episode);
        match write_json_pretty(&path, &steps) {
            Ok(()) => {
                log::info!(
                    target: self.log_target,
                    "Saved episode {} to {}",
                    self.episode_counter,
                    path.display()
                );
                Ok(path)
            }
            Err(error) => {
                log::error!(target: self.log_target, "Error saving episode data: {}", error);
                Err(error)
            }
        }
    }

    /// Load every `episode_*.json` file in `dir` and return the number of loaded episodes.
    /// Files that aren't valid episodes are skipped with a warning.
    pub fn load_data<P: AsRef<Path>>(&mut self, dir: P) -> Result<usize> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            log::warn!(
                target: self.log_target,
                "Gameplay data directory {} doesn't exist",
                dir.display()
            );
            return Ok(0);
        }
        let mut loaded = 0;
        for path in list_files(dir, "episode_", ".json")? {
            match read_episode_file(&path, self.num_actions) {
                Ok(episode) => {
                    self.episodes.push(episode);
                    loaded += 1;
                }
                Err(error) => {
                    log::warn!(target: self.log_target, "Skipping {}: {}", path.display(), error)
                }
            }
        }
        log::info!(
            target: self.log_target,
            "Loaded {} episodes from {}",
            loaded,
            dir.display()
        );
        Ok(loaded)
    }

    /// Finished episodes.
    pub fn episodes(&self) -> &[Vec<Transition>] {
        &self.episodes
    }

    /// Steps of the episode that hasn't finished yet.
    pub fn current_episode(&self) -> &[Transition] {
        &self.current_episode
    }

    /// All transitions of the finished episodes in order.
    pub fn transitions(&self) -> impl Iterator<Item = &Transition> {
        self.episodes.iter().flatten()
    }

    pub fn statistics(&self) -> GameplayStatistics {
        let episodes = self.episodes.len();
        let total_steps: usize = self.episodes.iter().map(|episode| episode.len()).sum();
        let total_reward: f64 = self.transitions().map(|t| t.reward as f64).sum();
        let mut counts: BTreeMap<usize, usize> = BTreeMap::new();
        for transition in self.transitions() {
            *counts.entry(transition.action).or_default() += 1;
        }
        let action_distribution = counts
            .into_iter()
            .map(|(action, count)| {
                (
                    action.to_string(),
                    count as f64 / total_steps as f64 * 100.0,
                )
            })
            .collect();
        let (avg_steps_per_episode, avg_reward_per_episode) = if episodes > 0 {
            (
                total_steps as f64 / episodes as f64,
                total_reward / episodes as f64,
            )
        } else {
            (0.0, 0.0)
        };
        GameplayStatistics {
            episodes,
            total_steps,
            avg_steps_per_episode,
            avg_reward_per_episode,
            action_distribution,
        }
    }

    /// Save every finished episode into a single bincode file.
    pub fn save_binary<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        write_atomic(path.as_ref(), &bincode::serialize(&self.episodes)?)
    }

    /// Append the episodes of a file saved by [`GameplayRecorder::save_binary`].
    pub fn load_binary<P: AsRef<Path>>(&mut self, path: P) -> Result<usize> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(DqnError::ArtifactNotFound(path.to_path_buf()));
        }
        let episodes: Vec<Vec<Transition>> = bincode::deserialize(&std::fs::read(path)?)?;
        if let Some(transition) = episodes
            .iter()
            .flatten()
            .find(|t| t.action >= self.num_actions)
        {
            return Err(DqnError::InvalidAction {
                action: transition.action,
                num_actions: self.num_actions,
            });
        }
        let count = episodes.len();
        self.episodes.extend(episodes);
        Ok(count)
    }
}

/// Read a JSON episode file, a list of step records with actions in `[0, num_actions)`.
pub fn read_episode_file(path: &Path, num_actions: usize) -> Result<Vec<Transition>> {
    let content = std::fs::read_to_string(path)?;
    let value: Value = serde_json::from_str(&content)?;
    let records = value
        .as_array()
        .ok_or_else(|| DqnError::InvalidRecord("episode file must contain a list".to_string()))?;
    records
        .iter()
        .map(|record| parse_step(record, num_actions))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step(action: u64, reward: f64, done: bool) -> Value {
        json!({
            "state": [[0.0, 1.0], [0.5, 0.0]],
            "action": action,
            "reward": reward,
            "next_state": [[1.0, 0.0], [0.0, 0.5]],
            "done": done,
        })
    }

    #[test]
    fn episodes_are_split_and_saved() {
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = GameplayRecorder::new(dir.path()).unwrap();
        assert_eq!(recorder.record_step(&step(0, 1.0, false)).unwrap(), RecordOutcome::Buffered);
        assert_eq!(recorder.record_step(&step(2, 0.5, false)).unwrap(), RecordOutcome::Buffered);
        let path = match recorder.record_step(&step(2, -1.0, true)).unwrap() {
            RecordOutcome::EpisodeSaved(path) => path,
            other => panic!("unexpected outcome {other:?}"),
        };
        assert!(path
            .file_name()
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("episode_1_"));
        assert_eq!(recorder.episodes().len(), 1);
        assert!(recorder.current_episode().is_empty());

        let saved = read_episode_file(&path, GameAction::COUNT).unwrap();
        assert_eq!(saved, recorder.episodes()[0]);
        assert_eq!(saved[0].state.shape(), &[2, 2]);

        let mut other = GameplayRecorder::new(dir.path().join("other")).unwrap();
        assert_eq!(other.load_data(dir.path()).unwrap(), 1);
        assert_eq!(other.transitions().count(), 3);
    }

    #[test]
    fn invalid_records_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = GameplayRecorder::new(dir.path()).unwrap();
        recorder.record_step(&step(1, 0.0, false)).unwrap();

        let mut missing = step(1, 0.0, false);
        missing.as_object_mut().unwrap().remove("reward");
        assert!(matches!(
            recorder.record_step(&missing),
            Err(DqnError::MissingField(key)) if key == "reward"
        ));

        let mut negative = step(1, 0.0, false);
        negative["action"] = json!(-1);
        assert!(matches!(
            recorder.record_step(&negative),
            Err(DqnError::InvalidRecord(_))
        ));

        let mut ragged = step(1, 0.0, false);
        ragged["state"] = json!([[0.0, 1.0], [0.5]]);
        assert!(matches!(
            recorder.record_step(&ragged),
            Err(DqnError::InvalidRecord(_))
        ));

        let mut other_shape = step(1, 0.0, false);
        other_shape["state"] = json!([0.0, 1.0, 0.5, 0.0]);
        other_shape["next_state"] = json!([0.0, 1.0, 0.5, 0.0]);
        assert!(matches!(
            recorder.record_step(&other_shape),
            Err(DqnError::ShapeMismatch { .. })
        ));

        let mut disagreeing = step(1, 0.0, false);
        disagreeing["next_state"] = json!([0.0, 1.0]);
        assert!(matches!(
            recorder.record_step(&disagreeing),
            Err(DqnError::ShapeMismatch { .. })
        ));

        let mut out_of_range = step(1, 0.0, false);
        out_of_range["action"] = json!(6);
        assert!(matches!(
            recorder.record_step(&out_of_range),
            Err(DqnError::InvalidRecord(_))
        ));
        out_of_range["action"] = json!(u64::MAX);
        assert!(matches!(
            recorder.record_step(&out_of_range),
            Err(DqnError::InvalidRecord(_))
        ));

        // The episode keeps buffering.
        assert_eq!(recorder.current_episode().len(), 1);
        recorder.record_step(&step(3, 1.0, true)).unwrap();
        assert_eq!(recorder.episodes()[0].len(), 2);
    }

    #[test]
    fn unrepresentable_numbers_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = GameplayRecorder::new(dir.path()).unwrap();
        assert!(matches!(
            recorder.record_step(&step(1, 1e39, true)),
            Err(DqnError::InvalidRecord(_))
        ));
        let mut huge_state = step(1, 0.0, true);
        huge_state["state"] = json!([[0.0, 1e39], [0.5, 0.0]]);
        assert!(matches!(
            recorder.record_step(&huge_state),
            Err(DqnError::InvalidRecord(_))
        ));
        assert!(recorder.episodes().is_empty());
        assert!(list_files(dir.path(), "episode_", ".json").unwrap().is_empty());

        // Every saved episode can be read back.
        recorder.record_step(&step(1, 3.0e38, true)).unwrap();
        let mut other = GameplayRecorder::new(dir.path().join("other")).unwrap();
        assert_eq!(other.load_data(dir.path()).unwrap(), 1);
    }

    #[test]
    fn action_bound() {
        let dir = tempfile::tempdir().unwrap();
        let mut wide = GameplayRecorder::new(dir.path())
            .unwrap()
            .with_num_actions(10)
            .with_log_target("web");
        assert_eq!(wide.num_actions(), 10);
        wide.record_step(&step(8, 1.0, true)).unwrap();
        assert!(matches!(
            wide.record_step(&step(10, 1.0, true)),
            Err(DqnError::InvalidRecord(_))
        ));

        // Files and binary exports with actions beyond the bound aren't loaded.
        let mut narrow = GameplayRecorder::new(dir.path().join("narrow")).unwrap();
        assert_eq!(narrow.num_actions(), GameAction::COUNT);
        assert_eq!(narrow.load_data(dir.path()).unwrap(), 0);
        let path = dir.path().join("gameplay.bin");
        wide.save_binary(&path).unwrap();
        assert!(matches!(
            narrow.load_binary(&path),
            Err(DqnError::InvalidAction { action: 8, num_actions: 6 })
        ));
        assert!(narrow.episodes().is_empty());
    }

    #[test]
    fn statistics() {
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = GameplayRecorder::new(dir.path()).unwrap();
        let empty = recorder.statistics();
        assert_eq!(empty.episodes, 0);
        assert_eq!(empty.avg_steps_per_episode, 0.0);
        assert!(empty.action_distribution.is_empty());

        for (action, reward, done) in [(0, 1.0, false), (0, 1.0, false), (2, 2.0, true), (5, 4.0, true)] {
            recorder.record_step(&step(action, reward, done)).unwrap();
        }
        let stats = recorder.statistics();
        assert_eq!(stats.episodes, 2);
        assert_eq!(stats.total_steps, 4);
        assert_eq!(stats.avg_steps_per_episode, 2.0);
        assert_eq!(stats.avg_reward_per_episode, 4.0);
        assert_eq!(stats.action_distribution["0"], 50.0);
        assert_eq!(stats.action_distribution["2"], 25.0);
        assert_eq!(stats.action_distribution["5"], 25.0);
    }

    #[test]
    fn binary_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = GameplayRecorder::new(dir.path()).unwrap();
        recorder.record_step(&step(1, 0.5, false)).unwrap();
        recorder.record_step(&step(4, 1.5, true)).unwrap();
        let path = dir.path().join("gameplay.bin");
        recorder.save_binary(&path).unwrap();

        let mut loaded = GameplayRecorder::new(dir.path().join("copy")).unwrap();
        assert_eq!(loaded.load_binary(&path).unwrap(), 1);
        assert_eq!(loaded.episodes(), recorder.episodes());
    }
}
