pub mod client;
pub mod config;
pub mod error;
pub mod params;

pub use client::MoodleClient;
pub use config::{Environment, MoodleConfig, WritePolicy};
pub use error::MoodleError;
