pub mod config;
pub mod logging;
pub mod paths;

pub use config::{AppConfig, ServerEntry};
