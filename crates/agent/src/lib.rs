//! Streamsight analysis worker.
//!
//! A worker holds one WebSocket link to the coordinator, accepts at most one
//! analysis session at a time, decodes the assigned stream, runs object
//! detection on each frame at playback pace, and publishes per-frame box
//! events back over the same link.
//!
//! Module map:
//!
//! - [`messages`]: coordinator wire protocol
//! - [`agent`]: worker state machine and message dispatch
//! - [`session`]: per-session decode / detect / publish loop
//! - [`control`]: control signals shared between the agent and a session
//! - [`source`]: frame sources (ffmpeg decode, yt-dlp resolution)
//! - [`detector`]: object detector client
//! - [`publish`]: outbound event sink
//! - [`client`], [`reconnect`], [`connection`]: coordinator link

pub mod agent;
pub mod client;
pub mod config;
pub mod connection;
pub mod control;
pub mod detector;
pub mod messages;
pub mod publish;
pub mod reconnect;
pub mod session;
pub mod source;
