//! Bootstrap module for server initialization

pub mod config;

pub use config::load_config;
