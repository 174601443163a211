//! # RemoteBox
//!
//! Application layer over the `rbox-*` crates: configuration file, logging
//! setup and the server registry used by the `rbox` binary.

pub mod app;
pub mod config;
pub mod logging;

pub use app::App;
pub use config::AppConfig;
