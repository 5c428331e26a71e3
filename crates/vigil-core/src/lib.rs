//! `vigil-core`: configuration and error types shared by the Vigil crates.

pub mod config;
pub mod error;

pub use config::{MonitorConfig, SchedulerConfig, VigilConfig};
pub use error::{Result, VigilError};
