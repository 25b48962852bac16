//! Streamsight worker pool supervisor.
//!
//! Keeps a fixed number of `streamsight-agent` processes alive: starts
//! them with a stagger, respawns any that exit under their original worker
//! id, and propagates shutdown to all of them.

pub mod cli;
pub mod process;
pub mod supervisor;
