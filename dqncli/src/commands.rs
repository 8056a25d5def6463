use dqnlib::{
    dqn::{
        environment::{EnvironmentSettings, GameAction},
        Agent, ModelSettings,
    },
    io::{CheckpointPaths, RunConfig},
    load_torch_seed,
};

use super::*;

mod train;
pub use train::*;

mod evaluate;
pub use evaluate::*;

mod collect;
pub use collect::*;

/// All CLI commands available in this binary.
#[derive(clap::Subcommand, Debug)]
pub enum Command {
    /// Train a DQN agent in the simulated environment or on recorded gameplay.
    #[command(alias = "t")]
    Train(TrainArgs),

    /// Evaluate a trained agent with the greedy policy.
    #[command(alias = "eval")]
    Evaluate(EvaluateArgs),

    /// Prepare the gameplay data directory and summarize the recorded episodes.
    Collect(CollectArgs),
}

impl Command {
    pub fn run(self) {
        match self {
            Command::Train(args) => args.run(),
            Command::Evaluate(args) => args.run(),
            Command::Collect(args) => args.run(),
        }
    }
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModelType {
    /// Fully connected layers.
    #[value(alias = "linear")]
    Dense,
    /// Convolutional layers for screen observations.
    Conv,
}

/// Options shared by the commands that build an agent.
#[derive(clap::Args, Debug)]
pub struct RunArgs {
    /// Path to the run configuration YAML. Options below override it.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Learning rate.
    #[arg(long)]
    lr: Option<f64>,
    /// Discount factor.
    #[arg(long)]
    gamma: Option<f64>,
    #[arg(long)]
    batch_size: Option<usize>,
    /// Sizes of the hidden layers of the dense model.
    #[arg(long, num_args = 1..)]
    hidden_dims: Option<Vec<i64>>,
    #[arg(long, value_enum)]
    model_type: Option<ModelType>,
    /// Maximum number of steps in an episode of the simulated environment.
    #[arg(long)]
    env_steps: Option<usize>,
    /// Seed for the random number generators.
    #[arg(long)]
    seed: Option<u64>,
    /// Force Torch to use CPU. By default, CUDA will be used if available.
    #[arg(long, default_value_t = false)]
    cpu: bool,
}

impl RunArgs {
    /// Read the configuration file if given and apply the command line overrides.
    fn load_config(&self) -> RunConfig {
        let mut config = match &self.config {
            Some(path) => match RunConfig::read_yaml_file(path) {
                Ok(config) => config,
                Err(err) => fatal_error!(1, "Cannot read run configuration: {}", err),
            },
            None => RunConfig::default(),
        };
        if let Some(lr) = self.lr {
            config.agent.lr = lr;
        }
        if let Some(gamma) = self.gamma {
            config.agent.gamma = gamma;
        }
        if let Some(batch_size) = self.batch_size {
            config.agent.batch_size = batch_size;
        }
        if let Some(max_steps) = self.env_steps {
            config.environment.max_steps = max_steps;
        }
        if self.seed.is_some() {
            config.seed = self.seed;
        }
        config.model = match (self.model_type, &config.model) {
            (Some(ModelType::Conv), ModelSettings::Conv { input_scale }) => ModelSettings::Conv {
                input_scale: *input_scale,
            },
            (Some(ModelType::Conv), _) => ModelSettings::Conv { input_scale: 1.0 },
            (Some(ModelType::Dense), ModelSettings::Dense { hidden })
            | (None, ModelSettings::Dense { hidden }) => ModelSettings::Dense {
                hidden: self.hidden_dims.clone().unwrap_or_else(|| hidden.clone()),
            },
            (Some(ModelType::Dense), _) => match &self.hidden_dims {
                Some(hidden) => ModelSettings::Dense {
                    hidden: hidden.clone(),
                },
                None => ModelSettings::default(),
            },
            (None, model) => {
                if self.hidden_dims.is_some() {
                    log::warn!("--hidden-dims is ignored by the convolutional model");
                }
                model.clone()
            }
        };
        if let Err(err) = config.agent.validate() {
            fatal_error!(1, "{}", err);
        }
        if let Some(name) = &config.name {
            println!("{:14}{}", "Run Name:".bold(), name);
        }
        config
    }

    fn device(&self) -> tch::Device {
        let device = if self.cpu {
            tch::Device::Cpu
        } else {
            tch::Device::cuda_if_available()
        };
        println!(
            "Selected Torch device: {}",
            format!("{device:?}").bold().blue(),
        );
        device
    }
}

/// Options for the data, model and metric directories.
#[derive(clap::Args, Debug)]
pub struct PathArgs {
    /// Directory of the gameplay data and episode summaries.
    #[arg(long, default_value = "./data")]
    data_dir: PathBuf,
    /// Directory where the trained models are saved.
    #[arg(long, default_value = "./models")]
    save_dir: PathBuf,
    /// Directory where the metric histories are exported.
    #[arg(long, default_value = "./plots")]
    plot_dir: PathBuf,
}

impl PathArgs {
    fn create_all(&self) {
        for dir in [&self.data_dir, &self.save_dir, &self.plot_dir] {
            if let Err(err) = std::fs::create_dir_all(dir) {
                fatal_error!(1, "Cannot create directory {}: {}", dir.display(), err);
            }
        }
    }
}

/// Build an agent for the simulated environment from the configuration.
fn build_env_agent(config: &RunConfig, device: tch::Device) -> Agent {
    let EnvironmentSettings { height, width, .. } = config.environment;
    build_agent(config, device, &[height, width], GameAction::COUNT)
}

fn build_agent(
    config: &RunConfig,
    device: tch::Device,
    input_shape: &[usize],
    num_actions: usize,
) -> Agent {
    load_torch_seed(config.seed);
    match Agent::new(
        device,
        input_shape,
        num_actions,
        &config.model,
        config.agent.clone(),
        config.seed,
    ) {
        Ok(agent) => agent,
        Err(err) => fatal_error!(1, "Cannot create the agent: {}", err),
    }
}

/// Load a checkpoint given as `<dir>/<name>`.
fn load_checkpoint(agent: &mut Agent, model_path: &Path) {
    let result = CheckpointPaths::split_model_path(model_path)
        .and_then(|(dir, name)| agent.load(dir, &name));
    match result {
        Ok(()) => println!(
            "{:14}{}",
            "Loaded Model:".bold(),
            model_path.display()
        ),
        Err(err) => fatal_error!(1, "Cannot load model {}: {}", model_path.display(), err),
    }
}
