//! Background workers

pub mod jobs;
pub mod reconciler;
