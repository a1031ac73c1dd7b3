//! Configuration parsing for the SSU daemon
//!
//! This module handles parsing of the daemon's INI-style configuration file.

mod parser;

pub use parser::{PeerConfig, SsuConfig, TransportConfig};
