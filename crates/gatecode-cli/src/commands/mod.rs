//! Command handlers

pub mod code;
pub mod config;
pub mod status;
pub mod watch;
