//! Per-bot build/deploy progress logs

pub mod collector;

pub use collector::{BuildLog, BuildLogEntry, LogCollector, Severity, DEFAULT_CAPACITY};
