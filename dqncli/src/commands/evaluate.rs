use dqnlib::{
    dqn::{environment::SpaceGameEnv, evaluate, EvaluationResult},
    io::fs::write_json_pretty,
};

use super::*;

#[derive(clap::Args, Debug)]
pub struct EvaluateArgs {
    #[command(flatten)]
    run: RunArgs,
    /// Checkpoint to evaluate, given as `<dir>/<name>`.
    #[arg(long)]
    load_model: PathBuf,
    /// Number of evaluation episodes.
    #[arg(long, default_value_t = 10)]
    episodes: usize,
    /// Write the results to this JSON file.
    #[arg(long)]
    output: Option<PathBuf>,
}

impl EvaluateArgs {
    pub fn run(self) {
        let config = self.run.load_config();
        let device = self.run.device();
        let mut agent = build_env_agent(&config, device);
        load_checkpoint(&mut agent, &self.load_model);

        let mut env = match SpaceGameEnv::new(config.environment.clone(), config.seed) {
            Ok(env) => env,
            Err(err) => fatal_error!(1, "Cannot create the environment: {}", err),
        };
        let result = match evaluate(&mut agent, &mut env, self.episodes) {
            Ok(result) => result,
            Err(err) => fatal_error!(1, "Evaluation failed: {}", err),
        };
        let EvaluationResult {
            episode_rewards,
            avg_reward,
            avg_length,
            ..
        } = &result;

        println!("\n{}", "Evaluation:".bold().underline());
        println!("    {:13}{}", "Episodes:".bold(), episode_rewards.len());
        println!("    {:13}{}", "Avg. Reward:".bold(), format!("{avg_reward:.2}").green());
        println!("    {:13}{avg_length:.2}", "Avg. Length:".bold());

        if let Some(path) = &self.output {
            match write_json_pretty(path, &result) {
                Ok(()) => println!("{:14}{}", "Results:".bold(), path.display()),
                Err(err) => fatal_error!(1, "Cannot save the results: {}", err),
            }
        }
    }
}
