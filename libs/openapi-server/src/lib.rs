//! HTTP API models for the botyard manager

pub mod models;
