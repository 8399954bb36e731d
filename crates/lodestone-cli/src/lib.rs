//! Library side of the `lodestone` command-line tool
//!
//! The binary in `bin/lodestone.rs` only parses arguments, initializes
//! logging and hands the command to [`commands::App`].

#![warn(missing_docs)]

pub mod cli;
pub mod commands;
pub mod config;
pub mod output;

pub use cli::{Cli, Command, GlobalArgs, LogFormat, OutputFormat};
pub use commands::App;
pub use config::{AppConfig, FileConfig, Overrides};
