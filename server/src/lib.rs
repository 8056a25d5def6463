//! HTTP API for recording gameplay and serving predictions of a trained model.
pub mod routes;
