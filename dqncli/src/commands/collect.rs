use dqnlib::io::GameplayRecorder;

use super::*;

#[derive(clap::Args, Debug)]
pub struct CollectArgs {
    /// Directory where the recorded episodes are saved.
    #[arg(long, default_value = "./data")]
    data_dir: PathBuf,
    /// Also export every recorded episode into a single binary file.
    #[arg(long)]
    export_binary: Option<PathBuf>,
}

impl CollectArgs {
    pub fn run(self) {
        let mut recorder = match GameplayRecorder::new(&self.data_dir) {
            Ok(recorder) => recorder,
            Err(err) => fatal_error!(1, "Cannot open the data directory: {}", err),
        };
        if let Err(err) = recorder.load_data(&self.data_dir) {
            fatal_error!(1, "Cannot load gameplay data: {}", err);
        }

        let stats = recorder.statistics();
        println!("{:14}{}", "Data Dir:".bold(), self.data_dir.display());
        println!("{:14}{}", "Episodes:".bold(), stats.episodes);
        println!("{:14}{}", "Total Steps:".bold(), stats.total_steps);
        if stats.episodes > 0 {
            println!("{:14}{:.2}", "Avg. Steps:".bold(), stats.avg_steps_per_episode);
            println!("{:14}{:.2}", "Avg. Reward:".bold(), stats.avg_reward_per_episode);
            for (action, percentage) in &stats.action_distribution {
                let name = action
                    .parse::<usize>()
                    .ok()
                    .and_then(GameAction::from_index)
                    .map(|action| format!("{action:?}"))
                    .unwrap_or_else(|| action.clone());
                println!("    {:12}{:>6.2}%", name, percentage);
            }
        }

        if let Some(path) = &self.export_binary {
            match recorder.save_binary(path) {
                Ok(()) => println!("{:14}{}", "Exported:".bold(), path.display()),
                Err(err) => fatal_error!(1, "Cannot export gameplay data: {}", err),
            }
        }

        println!("\n{}", "Collecting gameplay:".bold().underline());
        println!("1. Start the server with `--data-dir {}`.", self.data_dir.display());
        println!(
            "2. For each step of the game, POST {} to /api/record.",
            "{state, action, reward, next_state, done}".italic()
        );
        println!("3. Episodes are saved to the data directory when `done` is true.");
        println!("4. Train on them with `dqn train --use-web-data`.");
    }
}
