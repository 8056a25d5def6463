use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use dqnlib::{
    dqn::{environment::GameAction, QNetwork},
    io::{CheckpointPaths, GameplayRecorder, RunConfig},
};
use server::routes::{self, ServerState};

#[derive(Parser, Debug)]
#[command(author, version, about = "Gameplay recording and prediction server.")]
struct Options {
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
    #[arg(long, default_value_t = 5000)]
    port: u16,
    /// Checkpoint used for predictions, given as `<dir>/<name>`.
    #[arg(long)]
    model: Option<PathBuf>,
    /// Run configuration YAML that describes the model architecture.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Directory where the recorded episodes are saved.
    #[arg(long, default_value = "./data")]
    data_dir: PathBuf,
    /// Observation shape of the model. Defaults to the environment screen size.
    #[arg(long, num_args = 1..)]
    input_shape: Option<Vec<usize>>,
    /// Number of actions of the model. Recorded steps must use one of them.
    #[arg(long, default_value_t = GameAction::COUNT)]
    num_actions: usize,
}

/// Build the network described by the options and load the checkpoint weights.
fn load_predictor(options: &Options, model_path: &PathBuf) -> dqnlib::Result<QNetwork> {
    let config = match &options.config {
        Some(path) => RunConfig::read_yaml_file(path)?,
        None => RunConfig::default(),
    };
    let input_shape = match &options.input_shape {
        Some(shape) => shape.clone(),
        None => vec![config.environment.height, config.environment.width],
    };
    let mut network = QNetwork::new(
        tch::Device::cuda_if_available(),
        &input_shape,
        options.num_actions,
        &config.model,
    )?;
    let (dir, name) = CheckpointPaths::split_model_path(model_path)?;
    network.load(CheckpointPaths::new(&dir, &name).q_network)?;
    Ok(network)
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let options = Options::parse();

    let addrstr = format!("{}:{}", options.host, options.port);
    let addr: SocketAddr = match addrstr.parse() {
        Ok(addr) => addr,
        Err(e) => {
            log::error!("Cannot parse the address {addrstr}: {e}");
            return;
        }
    };

    let predictor = match &options.model {
        Some(path) => match load_predictor(&options, path) {
            Ok(network) => {
                log::info!("Loaded model from {}", path.display());
                Some(network)
            }
            Err(e) => {
                log::error!("Cannot load model {}: {e}", path.display());
                None
            }
        },
        None => {
            log::warn!("No model given, predictions are disabled");
            None
        }
    };
    let recorder = match GameplayRecorder::new(&options.data_dir) {
        Ok(recorder) => recorder.with_num_actions(options.num_actions),
        Err(e) => {
            log::error!("Cannot open the data directory {}: {e}", options.data_dir.display());
            return;
        }
    };

    let api = routes::api(ServerState::new(recorder, predictor).shared());
    log::info!("Listening on http://{addr}");
    let server = warp::serve(api).run(addr);
    server.await;
}
