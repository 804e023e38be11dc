//! Finite state machine for bot lifecycle status

use crate::errors::BotError;
use crate::models::bot::BotStatus;

/// Lifecycle event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BotEvent {
    /// Begin a build
    Build,

    /// Build finished
    BuildSucceeded,

    /// Begin deploying
    Start,

    /// Containers are up
    StartSucceeded,

    /// Begin tearing down
    Stop,

    /// Containers are gone
    StopSucceeded,

    /// The in-flight operation failed
    Failed(String),

    /// Status observed from the runtime, overriding whatever was recorded
    Observed(BotStatus),
}

/// Status after applying `event` to `status`
pub fn transition(status: BotStatus, event: &BotEvent) -> Result<BotStatus, BotError> {
    use BotStatus::*;

    let next = match (status, event) {
        (Stopped | Error, BotEvent::Build) => Building,
        (Building, BotEvent::BuildSucceeded) => Stopped,

        (Stopped | Error, BotEvent::Start) => Starting,
        (Starting, BotEvent::StartSucceeded) => Running,

        (Running | Error, BotEvent::Stop) => Stopping,
        (Stopping, BotEvent::StopSucceeded) => Stopped,

        (Building | Starting | Stopping, BotEvent::Failed(_)) => Error,

        (_, BotEvent::Observed(observed)) => *observed,

        (Running, BotEvent::Build) => {
            return Err(BotError::Conflict(
                "Bot is running; stop it before building".to_string(),
            ))
        }
        (Running, BotEvent::Start) => {
            return Err(BotError::Conflict("Bot is already running".to_string()))
        }
        (state, event) if state.is_transient() => {
            return Err(BotError::Conflict(format!(
                "Bot is {}; cannot apply {:?} until it finishes",
                state, event
            )))
        }
        (state, event) => {
            return Err(BotError::Conflict(format!(
                "Invalid transition: {} -> {:?}",
                state, event
            )))
        }
    };
    Ok(next)
}
