//! `stripescan`: an offline analyzer for Apache Traffic Server's on-disk
//! HTTP cache format. Reads configuration, cache spans, stripes and
//! directories, and enumerates the objects a cache actually holds without
//! the serving proxy running.

pub mod cache;
pub mod cli;
pub mod config;
pub mod display;
pub mod error;
pub mod primitives;

pub use config::Config;
pub use error::{CacheError, Result};
