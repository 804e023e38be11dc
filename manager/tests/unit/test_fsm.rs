//! Status transition unit tests

use botyard::deploy::fsm::{transition, BotEvent};
use botyard::errors::BotError;
use botyard::models::bot::BotStatus;

fn apply(status: BotStatus, events: &[BotEvent]) -> Result<BotStatus, BotError> {
    events
        .iter()
        .try_fold(status, |status, event| transition(status, event))
}

#[test]
fn test_build_then_start_then_stop() {
    let status = apply(BotStatus::Stopped, &[BotEvent::Build]).unwrap();
    assert_eq!(status, BotStatus::Building);

    let status = apply(status, &[BotEvent::BuildSucceeded]).unwrap();
    assert_eq!(status, BotStatus::Stopped);

    let status = apply(status, &[BotEvent::Start, BotEvent::StartSucceeded]).unwrap();
    assert_eq!(status, BotStatus::Running);

    let status = apply(status, &[BotEvent::Stop, BotEvent::StopSucceeded]).unwrap();
    assert_eq!(status, BotStatus::Stopped);
}

#[test]
fn test_failure_lands_in_error() {
    for begin in [BotEvent::Build, BotEvent::Start] {
        let status = apply(
            BotStatus::Stopped,
            &[begin, BotEvent::Failed("compose up failed".to_string())],
        )
        .unwrap();
        assert_eq!(status, BotStatus::Error);
    }
}

#[test]
fn test_recovery_from_error() {
    for event in [BotEvent::Build, BotEvent::Start, BotEvent::Stop] {
        assert!(transition(BotStatus::Error, &event).is_ok(), "{:?}", event);
    }
}

#[test]
fn test_rejects_overlapping_operations() {
    let err = transition(BotStatus::Building, &BotEvent::Start).unwrap_err();
    assert!(matches!(err, BotError::Conflict(_)));

    let err = transition(BotStatus::Running, &BotEvent::Start).unwrap_err();
    assert!(matches!(err, BotError::Conflict(_)));

    assert!(transition(BotStatus::Stopped, &BotEvent::StopSucceeded).is_err());
    assert!(transition(BotStatus::Stopped, &BotEvent::Failed("x".into())).is_err());
}

#[test]
fn test_observed_status_overrides() {
    for from in [BotStatus::Starting, BotStatus::Stopped, BotStatus::Error] {
        let status = transition(from, &BotEvent::Observed(BotStatus::Running)).unwrap();
        assert_eq!(status, BotStatus::Running);
    }
}
