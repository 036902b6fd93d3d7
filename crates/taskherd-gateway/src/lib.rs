//! # Taskherd Gateway
//!
//! JSON API over the task service: create, launch and stop tasks, browse
//! execution reports and poll their logs while a run is in progress.

pub mod routes;
pub mod server;

pub use server::{AppState, build_router, start};
