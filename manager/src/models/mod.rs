//! Data models

pub mod bot;
