use std::sync::{Arc, Mutex, MutexGuard};

use dqnlib::{
    dqn::{greedy_action, QNetwork},
    io::{observation_from_json, GameplayRecorder, RecordOutcome},
    DqnError,
};
use log::{error, warn};
use serde_json::{json, Value};
use warp::{filters::BoxedFilter, Filter, Reply};
use warp::{http::StatusCode, reply};

/// Maximum size of a request body. Observations are sent as nested lists.
const BODY_LIMIT: u64 = 16 * 1024 * 1024;

/// State shared by every request handler.
pub struct ServerState {
    pub recorder: GameplayRecorder,
    /// Online network for predictions. `None` if no model is loaded.
    pub predictor: Option<QNetwork>,
}

pub type SharedState = Arc<Mutex<ServerState>>;

impl ServerState {
    pub fn new(recorder: GameplayRecorder, predictor: Option<QNetwork>) -> Self {
        Self {
            recorder,
            predictor,
        }
    }

    pub fn shared(self) -> SharedState {
        Arc::new(Mutex::new(self))
    }
}

fn lock(state: &SharedState) -> MutexGuard<'_, ServerState> {
    // A panicking handler doesn't leave the recorder in an invalid state.
    state
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn failure<E: ToString>(error: E, status: StatusCode) -> (Value, StatusCode) {
    (json!({"success": false, "error": error.to_string()}), status)
}

/// Greedy action for the given state.
pub fn predict(state: &ServerState, req: &Value) -> (Value, StatusCode) {
    let network = match &state.predictor {
        Some(network) => network,
        None => return failure("Model not loaded", StatusCode::SERVICE_UNAVAILABLE),
    };
    let observation = match req.get("state") {
        Some(value) => match observation_from_json(value) {
            Ok(observation) => observation,
            Err(e) => return failure(e, StatusCode::BAD_REQUEST),
        },
        None => return failure("Missing state", StatusCode::BAD_REQUEST),
    };
    let q_values = match network.q_values(&observation) {
        Ok(q_values) => q_values,
        Err(e @ DqnError::ShapeMismatch { .. }) => return failure(e, StatusCode::BAD_REQUEST),
        Err(e) => {
            error!("Error while predicting an action: {e}");
            return failure(e, StatusCode::INTERNAL_SERVER_ERROR);
        }
    };
    match greedy_action(&q_values) {
        Some(action) => (json!({"success": true, "action": action}), StatusCode::OK),
        None => failure("Model has no outputs", StatusCode::INTERNAL_SERVER_ERROR),
    }
}

/// Record a gameplay step.
pub fn record(state: &mut ServerState, req: &Value) -> (Value, StatusCode) {
    match state.recorder.record_step(req) {
        Ok(RecordOutcome::Buffered) => (json!({"success": true}), StatusCode::OK),
        Ok(RecordOutcome::EpisodeSaved(path)) => (
            json!({"success": true, "episode_saved": path.display().to_string()}),
            StatusCode::OK,
        ),
        Err(DqnError::MissingField(key)) => {
            failure(format!("Missing {key}"), StatusCode::BAD_REQUEST)
        }
        Err(e @ DqnError::Io(_)) => failure(e, StatusCode::INTERNAL_SERVER_ERROR),
        Err(e) => failure(e, StatusCode::BAD_REQUEST),
    }
}

/// Statistics of the recorded gameplay.
pub fn stats(state: &ServerState) -> (Value, StatusCode) {
    match serde_json::to_value(state.recorder.statistics()) {
        Ok(statistics) => (
            json!({"success": true, "statistics": statistics}),
            StatusCode::OK,
        ),
        Err(e) => {
            warn!("Cannot serialize statistics: {e}");
            failure(e, StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

fn to_reply((body, status): (Value, StatusCode)) -> reply::WithStatus<reply::Json> {
    reply::with_status(reply::json(&body), status)
}

/// Every route combined for a single network
pub fn api(state: SharedState) -> BoxedFilter<(impl Reply,)> {
    let with_state = warp::any().map(move || state.clone());
    let predict_route = warp::path!("api" / "predict")
        .and(warp::post())
        .and(warp::body::content_length_limit(BODY_LIMIT))
        .and(warp::body::json())
        .and(with_state.clone())
        .map(|req: Value, state: SharedState| to_reply(predict(&lock(&state), &req)));
    let record_route = warp::path!("api" / "record")
        .and(warp::post())
        .and(warp::body::content_length_limit(BODY_LIMIT))
        .and(warp::body::json())
        .and(with_state.clone())
        .map(|req: Value, state: SharedState| to_reply(record(&mut lock(&state), &req)));
    let stats_route = warp::path!("api" / "stats")
        .and(warp::get())
        .and(with_state)
        .map(|state: SharedState| to_reply(stats(&lock(&state))));
    predict_route.or(record_route).or(stats_route).boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use dqnlib::dqn::ModelSettings;

    fn state(dir: &std::path::Path, with_model: bool) -> ServerState {
        let predictor = with_model.then(|| {
            QNetwork::new(
                tch::Device::Cpu,
                &[4],
                3,
                &ModelSettings::Dense { hidden: vec![8] },
            )
            .unwrap()
        });
        ServerState::new(GameplayRecorder::new(dir).unwrap(), predictor)
    }

    fn step(done: bool) -> Value {
        json!({
            "state": [0.0, 0.1, 0.2, 0.3],
            "action": 2,
            "reward": 1.0,
            "next_state": [0.1, 0.2, 0.3, 0.4],
            "done": done,
        })
    }

    #[test]
    fn prediction() {
        let dir = tempfile::tempdir().unwrap();
        let (body, status) = predict(&state(dir.path(), false), &step(false));
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "Model not loaded");

        let loaded = state(dir.path(), true);
        let (body, status) = predict(&loaded, &json!({"state": [0.5, 0.5, 0.5, 0.5]}));
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert!(body["action"].as_u64().unwrap() < 3);

        let (body, _) = predict(&loaded, &json!({}));
        assert_eq!(body["error"], "Missing state");
        let (body, status) = predict(&loaded, &json!({"state": [0.5, 0.5]}));
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
    }

    #[test]
    fn recording() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = state(dir.path(), false);
        let (body, status) = record(&mut state, &step(false));
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"success": true}));

        let mut missing = step(false);
        missing.as_object_mut().unwrap().remove("action");
        let (body, status) = record(&mut state, &missing);
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Missing action");

        let mut out_of_range = step(false);
        out_of_range["action"] = json!(u64::MAX);
        let (body, status) = record(&mut state, &out_of_range);
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        out_of_range["reward"] = json!(1e39);
        out_of_range["action"] = json!(1);
        let (_, status) = record(&mut state, &out_of_range);
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (body, _) = record(&mut state, &step(true));
        assert!(body["episode_saved"].is_string());

        let (body, _) = stats(&state);
        assert_eq!(body["statistics"]["episodes"], 1);
        assert_eq!(body["statistics"]["total_steps"], 2);
        assert_eq!(body["statistics"]["action_distribution"]["2"], 100.0);
    }

    #[tokio::test]
    async fn routes() {
        let dir = tempfile::tempdir().unwrap();
        let api = api(state(dir.path(), false).shared());

        let response = warp::test::request()
            .method("POST")
            .path("/api/record")
            .json(&step(true))
            .reply(&api)
            .await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = warp::test::request()
            .method("GET")
            .path("/api/stats")
            .reply(&api)
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["statistics"]["episodes"], 1);

        let response = warp::test::request()
            .method("POST")
            .path("/api/predict")
            .json(&json!({"state": [0.0]}))
            .reply(&api)
            .await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
