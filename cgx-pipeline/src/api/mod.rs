//! HTTP API handlers for cgx-pipeline
//!
//! A thin trigger/status surface over the pipeline and its stored solutions.

pub mod clusters;
pub mod health;
pub mod pipeline;
pub mod sse;

pub use clusters::cluster_routes;
pub use health::health_routes;
pub use pipeline::pipeline_routes;
pub use sse::pipeline_event_stream;
