//! hdmi-capture - HDMI capture and hardware H.264 streaming
//!
//! Watches the HDMI receiver for a usable signal, captures frames into DMA
//! buffers and feeds them to an H.264 encode channel.

pub mod config;
pub mod error;
pub mod events;
pub mod utils;
pub mod video;

pub use error::{AppError, Result};
