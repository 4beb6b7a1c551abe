//! H.264 encoder gateway
//!
//! - Bitrate selection from the user quality factor
//! - Encode channel lifecycle with a packet read-back thread
//! - Software x264 engine (feature `x264`)

pub mod bitrate;
pub mod channel;
#[cfg(feature = "x264")]
pub mod x264_engine;

pub use bitrate::{compute_bitrate, max_bitrate};
pub use channel::{channel_attr, ChannelState, H264Channel};
#[cfg(feature = "x264")]
pub use x264_engine::X264Engine;
