//! Bot build and deployment

pub mod compose;
pub mod docker;
pub mod executor;
pub mod fsm;
pub mod git;
pub mod lifecycle;
pub mod process;
pub mod runtime;
pub mod standalone;
