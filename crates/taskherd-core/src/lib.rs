//! # Taskherd Core
//!
//! Configuration and the error taxonomy shared by every Taskherd crate.

pub mod config;
pub mod error;

pub use config::TaskherdConfig;
pub use error::{Result, TaskherdError};
