//! HTTP surface (C7) and background job queue for the information market.
//!
//! Exposes the command table of §4.7/§6 over axum and runs the inspection
//! engine and matcher fan-out as background jobs behind a bounded channel.

pub mod api;
pub mod error;
pub mod jobs;
pub mod server;

pub use api::AppState;
pub use jobs::{spawn_worker_pool, Job, JobRegistry};
pub use server::{build_router, start_server};
