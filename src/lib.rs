#![allow(clippy::uninlined_format_args)]

pub mod app;
pub mod cli;
pub mod config;
pub mod data;
pub mod mastodon;
pub mod recap;
pub mod storage;
pub mod thread;
pub mod timeline;
pub mod tracing_setup;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use app::run;
