pub mod config;
pub mod duration;
pub mod types;

pub use config::{ConfigError, EngineSettings, HelmsmanConfig};
pub use duration::{humanize, parse_duration};
pub use types::*;
