//! Ambient infrastructure shared by the HomeCon sync binaries: command line /
//! environment configuration and console logging.

pub mod config;
pub mod logging;
