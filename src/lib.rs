//! needledrop — Core library for the turntable scrobbling pipeline.
//!
//! Samples a turntable's line input in fixed windows, identifies what is
//! playing through a chain of recognition providers, collapses repeated
//! recognitions of one spin into a single play, and submits confirmed
//! plays to a listening-history service through a durable retry queue.

pub mod audd;
pub mod capture;
pub mod config;
pub mod dedup;
pub mod pipeline;
pub mod queue;
pub mod recognizer;
pub mod shazam;
pub mod status;
pub mod submitter;
pub mod track;
pub mod window;
