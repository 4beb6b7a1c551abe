//! Configuration schema and persistent store

pub mod schema;
pub mod store;

pub use schema::{AppConfig, EncoderConfig, EncoderPreset, VideoConfig};
pub use store::ConfigStore;
