//! Persistent state

pub mod bots;
pub mod credentials;
pub mod layout;
pub mod settings;
