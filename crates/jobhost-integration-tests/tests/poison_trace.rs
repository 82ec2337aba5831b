//! Integration tests for poison-message handling across a mixed batch

mod common;

use common::{account, poisoning_listener, queue_name, seed, RecordingExceptionHandler, TrackingFunction};
use jobhost_core::Listener;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Verify that a failing message is attempted exactly `max_dequeue_count`
/// times before landing in the poison queue, while its neighbours run once.
#[tokio::test(start_paused = true)]
async fn test_failing_message_is_poisoned_after_max_attempts() {
    let account = account();
    let name = queue_name("orders");
    seed(&account, &name, &["a", "b", "fail-c", "d", "e"]).await;

    let handler = RecordingExceptionHandler::default();
    let function = TrackingFunction::new(Duration::from_millis(500));
    let listener = poisoning_listener(&account, &name, &function, &handler, 2, 3);

    listener.start(&CancellationToken::new()).await.unwrap();
    tokio::time::sleep(Duration::from_secs(60)).await;
    listener.stop(&CancellationToken::new()).await.unwrap();
    listener.dispose().await;

    assert_eq!(function.attempts("fail-c"), 3);
    for body in ["a", "b", "d", "e"] {
        assert_eq!(function.attempts(body), 1, "body {}", body);
    }

    let mut completed = function.completed();
    completed.sort();
    assert_eq!(completed, vec!["a", "b", "d", "e"]);

    assert!(account.peek_all(&name).is_empty());
    let poisoned = account.peek_all(&name.poison_queue_name());
    assert_eq!(poisoned.len(), 1);
    assert_eq!(poisoned[0].body_as_string(), "fail-c");

    assert_eq!(function.overlaps(), 0);
    assert!(handler.errors().is_empty());
}

/// Verify that every message of a large backlog is handled exactly once
/// when nothing fails.
#[tokio::test(start_paused = true)]
async fn test_backlog_drains_once_each() {
    let account = account();
    let name = queue_name("backlog");
    let bodies: Vec<String> = (0..40).map(|i| format!("item-{:02}", i)).collect();
    let refs: Vec<&str> = bodies.iter().map(String::as_str).collect();
    seed(&account, &name, &refs).await;

    let handler = RecordingExceptionHandler::default();
    let function = TrackingFunction::new(Duration::from_millis(200));
    let listener = poisoning_listener(&account, &name, &function, &handler, 8, 5);

    listener.start(&CancellationToken::new()).await.unwrap();
    tokio::time::sleep(Duration::from_secs(30)).await;
    listener.stop(&CancellationToken::new()).await.unwrap();

    let mut completed = function.completed();
    completed.sort();
    assert_eq!(completed, bodies);
    assert!(function.max_running() <= 8);
    assert_eq!(listener.processed_count(), 40);
    assert!(account.peek_all(&name).is_empty());
}
