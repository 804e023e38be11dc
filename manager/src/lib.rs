//! Botyard Library
//!
//! Core modules of the botyard bot manager.

pub mod app;
pub mod buildlog;
pub mod compose;
pub mod deploy;
pub mod detect;
pub mod errors;
pub mod filesys;
pub mod logs;
pub mod models;
pub mod platform;
pub mod server;
pub mod storage;
pub mod telemetry;
pub mod utils;
pub mod workers;
