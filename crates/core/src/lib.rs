//! Pure domain logic shared by the streamsight worker agent and the pool
//! supervisor.
//!
//! Nothing in this crate performs network I/O; collaborators live in
//! `streamsight-agent` and `streamsight-pool`.

pub mod detection;
pub mod error;
pub mod ffprobe;
pub mod frame;
pub mod pacer;
pub mod types;
pub mod worker;
