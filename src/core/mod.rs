//! Configuration and time shared by every engine.
//!
//! - `config` - Configuration parsing and validation
//! - `time` - Deterministic time utilities

pub mod config;
pub mod time;

pub use config::*;
pub use time::*;
