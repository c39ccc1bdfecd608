//! Matches road-defect detections to road segments and turns the per-segment
//! defect history into maintenance priorities and tasks.

pub mod aggregator;
pub mod config;
pub mod engine;
pub mod entity;
pub mod error;
pub mod geometry;
pub mod io;
pub mod mapmatcher;
pub mod model;
pub mod priority;
pub mod road_index;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod sweep;
pub mod validator;

pub use engine::Engine;
pub use error::{EngineError, Result};

pub mod proto {
    tonic::include_proto!("roadwatch");
}
