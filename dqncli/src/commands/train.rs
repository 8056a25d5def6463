use std::time::Instant;

use dqnlib::{
    dqn::{environment::SpaceGameEnv, train_from_transitions, train_with_environment, EpisodeSettings},
    io::{fs::write_json_pretty, GameplayRecorder},
};

use super::*;

#[derive(clap::Args, Debug)]
pub struct TrainArgs {
    #[command(flatten)]
    run: RunArgs,
    #[command(flatten)]
    paths: PathArgs,
    /// Number of episodes in the simulated environment.
    #[arg(long, default_value_t = 10)]
    episodes: usize,
    /// Number of epochs when training on recorded gameplay.
    #[arg(long, default_value_t = 100)]
    epochs: usize,
    /// Train on the gameplay recorded in the data directory instead of the simulated environment.
    #[arg(long, default_value_t = false)]
    use_web_data: bool,
    /// Number of actions of the model trained on recorded gameplay.
    /// Recorded steps with other actions are skipped.
    #[arg(long, default_value_t = GameAction::COUNT)]
    num_actions: usize,
    /// Continue training from a checkpoint given as `<dir>/<name>`.
    #[arg(long)]
    load_model: Option<PathBuf>,
}

impl TrainArgs {
    pub fn run(self) {
        let config = self.run.load_config();
        self.paths.create_all();
        let device = self.run.device();

        println!("\nInitializing...");
        let training_start = Instant::now();
        RUNNING_STATE.store(2, atomic::Ordering::SeqCst);
        let (agent, name) = if self.use_web_data {
            self.train_on_gameplay(&config, device)
        } else {
            self.train_on_environment(&config, device)
        };
        RUNNING_STATE.store(0, atomic::Ordering::SeqCst);
        let duration = format_duration(&training_start.elapsed());
        println!("\n{} ({duration})", "Training finished.".green().bold());

        let name = match agent.save(&self.paths.save_dir, Some(name.as_str())) {
            Ok(name) => name,
            Err(err) => fatal_error!(1, "Cannot save the model: {}", err),
        };
        println!(
            "{:14}{}",
            "Saved Model:".bold(),
            self.paths.save_dir.join(&name).display()
        );

        let metrics_path = self.paths.plot_dir.join(format!("{name}_metrics.json"));
        match agent.metrics().save_json(&metrics_path) {
            Ok(()) => println!("{:14}{}", "Metrics:".bold(), metrics_path.display()),
            Err(err) => log::error!("Cannot export the metrics: {}", err),
        }

        let metrics = agent.metrics();
        println!("\n{}", "Summary:".bold().underline());
        println!("    {:16}{}", "Training steps:".bold(), agent.steps());
        println!("    {:16}{:.4}", "Epsilon:".bold(), agent.epsilon());
        if let Some(loss) = metrics.loss_history.last() {
            println!("    {:16}{:.4}", "Last loss:".bold(), loss);
        }
        if let Some(reward) = metrics.recent_average_reward(10) {
            println!("    {:16}{:.2}", "Avg. reward:".bold(), reward);
        }
    }

    fn train_on_environment(&self, config: &RunConfig, device: tch::Device) -> (Agent, String) {
        let mut agent = build_env_agent(config, device);
        if let Some(path) = &self.load_model {
            load_checkpoint(&mut agent, path);
        }
        let mut env = match SpaceGameEnv::new(config.environment.clone(), config.seed) {
            Ok(env) => env,
            Err(err) => fatal_error!(1, "Cannot create the environment: {}", err),
        };
        let settings = EpisodeSettings {
            episodes: self.episodes,
            data_dir: Some(self.paths.data_dir.clone()),
            ..Default::default()
        };

        println!("{}", "Starting training...".green());
        match train_with_environment(&mut agent, &mut env, &settings, &STOP_REQUESTED) {
            Ok(completed) => println!("Completed {completed} of {} episodes.", self.episodes),
            Err(err) => fatal_error!(1, "Training failed: {}", err),
        }
        (agent, CheckpointPaths::timestamped("dqn_env"))
    }

    fn train_on_gameplay(&self, config: &RunConfig, device: tch::Device) -> (Agent, String) {
        let mut recorder = match GameplayRecorder::new(&self.paths.data_dir) {
            Ok(recorder) => recorder.with_num_actions(self.num_actions),
            Err(err) => fatal_error!(1, "Cannot open the data directory: {}", err),
        };
        match recorder.load_data(&self.paths.data_dir) {
            Ok(0) => fatal_error!(
                1,
                "No data found in {}. Please collect data first with the collect command.",
                self.paths.data_dir.display()
            ),
            Ok(_) => {}
            Err(err) => fatal_error!(1, "Cannot load gameplay data: {}", err),
        }

        let stats = recorder.statistics();
        log::info!(
            "Loaded {} episodes with {} total steps",
            stats.episodes,
            stats.total_steps
        );
        log::info!("Average steps per episode: {:.2}", stats.avg_steps_per_episode);
        log::info!("Average reward per episode: {:.2}", stats.avg_reward_per_episode);
        log::info!("Action distribution: {:?}", stats.action_distribution);
        let distribution_path = self.paths.plot_dir.join("action_distribution.json");
        if let Err(err) = write_json_pretty(&distribution_path, &stats.action_distribution) {
            log::error!("Cannot export the action distribution: {}", err);
        }

        let transitions: Vec<_> = recorder.transitions().cloned().collect();
        let input_shape = match transitions.first() {
            Some(transition) => transition.state.shape().to_vec(),
            None => fatal_error!(1, "Recorded episodes contain no steps"),
        };
        let total = transitions.len();
        let transitions: Vec<_> = transitions
            .into_iter()
            .filter(|t| t.state.shape() == input_shape.as_slice())
            .collect();
        if transitions.len() < total {
            log::warn!(
                "Ignoring {} steps whose observations aren't {:?}",
                total - transitions.len(),
                input_shape
            );
        }
        let num_actions = recorder.num_actions();
        log::info!("Input shape: {:?}", input_shape);
        log::info!("Number of actions: {}", num_actions);

        let mut agent = build_agent(config, device, &input_shape, num_actions);
        if let Some(path) = &self.load_model {
            load_checkpoint(&mut agent, path);
        }

        println!("{}", "Starting training...".green());
        match train_from_transitions(&mut agent, transitions, self.epochs, &STOP_REQUESTED) {
            Ok(losses) => println!("Completed {} of {} epochs.", losses.len(), self.epochs),
            Err(err) => fatal_error!(1, "Training failed: {}", err),
        }
        (agent, CheckpointPaths::timestamped("dqn_web"))
    }
}
