//! Build log buffering and streaming

use tokio::sync::broadcast;

use botyard::buildlog::{BuildLog, LogCollector, Severity};

#[test]
fn test_capacity_drops_oldest() {
    let log = BuildLog::new("b1", 3);
    for i in 0..5 {
        log.info(format!("line {}", i));
    }
    let messages: Vec<_> = log.snapshot().into_iter().map(|e| e.message).collect();
    assert_eq!(messages, vec!["line 2", "line 3", "line 4"]);
}

#[tokio::test]
async fn test_subscriber_sees_entries_after_snapshot() {
    let log = BuildLog::new("b1", 10);
    log.system("started");

    let (backlog, receiver) = log.snapshot_and_subscribe();
    let mut receiver = receiver.unwrap();
    assert_eq!(backlog.len(), 1);

    log.success("done");
    let entry = receiver.recv().await.unwrap();
    assert_eq!(entry.message, "done");
    assert_eq!(entry.severity, Severity::Success);
}

#[tokio::test]
async fn test_destroy_closes_subscribers() {
    let collector = LogCollector::new(10);
    let log = collector.get("b1");
    let mut receiver = log.subscribe().unwrap();
    assert_eq!(log.subscriber_count(), 1);

    collector.destroy("b1");
    assert!(matches!(
        receiver.recv().await,
        Err(broadcast::error::RecvError::Closed)
    ));
    assert!(log.subscribe().is_none());
    assert!(collector.is_empty());
}

#[test]
fn test_collector_shares_logs_per_bot() {
    let collector = LogCollector::new(10);
    collector.get("a").info("one");
    collector.get("a").warning("two");
    collector.get("b").error("other");

    assert_eq!(collector.get("a").len(), 2);
    assert_eq!(collector.get("b").len(), 1);

    collector.get("a").clear();
    assert!(collector.get("a").is_empty());
}
