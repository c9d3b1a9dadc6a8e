pub mod align;
pub mod audio;
pub mod config;
pub mod diarize;
pub mod engine;
pub mod error;
pub mod logging;
pub mod models;
pub mod pipeline;
pub mod server;
pub mod staging;
pub mod transcript;

pub use config::{Config, ConfigManager};
pub use error::GatewayError;
pub use pipeline::{TranscribeOptions, TranscriptionPipeline};
pub use server::{build_router, AppState};
