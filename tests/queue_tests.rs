mod common;

use common::{build_harness, drain_frames, frames_of_type, next_frame};
use serde_json::json;
use std::sync::atomic::Ordering;

use tandem_server::models::MessageStatus;

/// Cold enqueue: the prompt waits in `pending`, a spawn is kicked, and once
/// the sandbox connects the message dispatches and completes.
#[tokio::test]
async fn cold_enqueue_spawns_sandbox_then_dispatches() {
    let h = build_harness().await;
    h.init_session().await;
    let mut client_rx = h.connect_client("ws-1").await;

    let message = h.enqueue("hi").await;
    tokio::time::sleep(std::time::Duration::from_millis(30)).await;

    // No sandbox socket yet: the message stays pending and clients hear that
    // a sandbox is coming.
    let stored = h.actor.repo.get_message(&message.id).await.unwrap().unwrap();
    assert_eq!(stored.status, MessageStatus::Pending);
    let frames = drain_frames(&mut client_rx);
    assert!(!frames_of_type(&frames, "sandbox_spawning").is_empty());

    // Sandbox connects: dispatch fires.
    let mut sandbox_rx = h.connect_sandbox().await;
    let prompt = next_frame(&mut sandbox_rx).await;
    assert_eq!(prompt["type"], "prompt");
    assert_eq!(prompt["message_id"], message.id.as_str());
    assert_eq!(prompt["content"], "hi");

    let stored = h.actor.repo.get_message(&message.id).await.unwrap().unwrap();
    assert_eq!(stored.status, MessageStatus::Processing);
    assert!(stored.started_at.is_some());

    let frames = drain_frames(&mut client_rx);
    let processing: Vec<_> = frames_of_type(&frames, "processing_status");
    assert!(processing.iter().any(|f| f["is_processing"] == true));

    // Sandbox reports completion.
    h.send_sandbox_event(json!({
        "type": "execution_complete",
        "message_id": message.id,
        "success": true,
    }))
    .await;

    let stored = h.actor.repo.get_message(&message.id).await.unwrap().unwrap();
    assert_eq!(stored.status, MessageStatus::Completed);
    assert!(stored.completed_at.is_some());

    // Exactly one canonical completion event.
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM events WHERE event_type = 'execution_complete'",
    )
    .fetch_one(h.actor.repo.pool())
    .await
    .unwrap();
    assert_eq!(count, 1);

    let frames = drain_frames(&mut client_rx);
    let processing: Vec<_> = frames_of_type(&frames, "processing_status");
    assert!(processing.iter().any(|f| f["is_processing"] == false));

    // The idle watchdog is armed.
    assert!(h.actor.next_alarm_deadline().is_some());
}

/// Stop while processing fails the message and a late real completion from
/// the sandbox does not flip it back.
#[tokio::test]
async fn stop_fails_message_and_late_completion_does_not_flip_it() {
    let h = build_harness().await;
    h.init_session().await;
    let mut client_rx = h.connect_client("ws-1").await;
    let mut sandbox_rx = h.connect_sandbox().await;

    let message = h.enqueue("long running work").await;
    let prompt = next_frame(&mut sandbox_rx).await;
    assert_eq!(prompt["type"], "prompt");
    drain_frames(&mut client_rx);

    h.actor.stop_execution().await.unwrap();

    let stored = h.actor.repo.get_message(&message.id).await.unwrap().unwrap();
    assert_eq!(stored.status, MessageStatus::Failed);

    // Synthetic completion event first, then the processing flag clears.
    let frames = drain_frames(&mut client_rx);
    let event_idx = frames
        .iter()
        .position(|f| {
            f["type"] == "sandbox_event" && f["event"]["type"] == "execution_complete"
        })
        .expect("synthetic completion broadcast");
    let status_idx = frames
        .iter()
        .position(|f| f["type"] == "processing_status" && f["is_processing"] == false)
        .expect("processing_status broadcast");
    assert!(event_idx < status_idx);

    // The sandbox was told to stop.
    let stop = next_frame(&mut sandbox_rx).await;
    assert_eq!(stop["type"], "stop");

    // A late real completion keeps the stop outcome.
    h.send_sandbox_event(json!({
        "type": "execution_complete",
        "message_id": message.id,
        "success": true,
    }))
    .await;
    let stored = h.actor.repo.get_message(&message.id).await.unwrap().unwrap();
    assert_eq!(stored.status, MessageStatus::Failed);

    // Still exactly one canonical completion event (upsert, not append).
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM events WHERE event_type = 'execution_complete'",
    )
    .fetch_one(h.actor.repo.pool())
    .await
    .unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
async fn repeated_stop_with_no_processing_message_is_a_noop() {
    let h = build_harness().await;
    h.init_session().await;

    h.actor.stop_execution().await.unwrap();
    h.actor.stop_execution().await.unwrap();

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM events")
        .fetch_one(h.actor.repo.pool())
        .await
        .unwrap();
    // Only the user_message mirror would exist, and nothing was enqueued.
    assert_eq!(count, 0);
}

/// Strict FIFO with at most one message processing at a time.
#[tokio::test]
async fn fifo_dispatch_processes_one_message_at_a_time() {
    let h = build_harness().await;
    h.init_session().await;
    let mut sandbox_rx = h.connect_sandbox().await;

    let first = h.enqueue("first").await;
    let second = h.enqueue("second").await;

    let prompt = next_frame(&mut sandbox_rx).await;
    assert_eq!(prompt["message_id"], first.id.as_str());

    // Second stays pending while the first processes.
    let processing_count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM messages WHERE status = 'processing'",
    )
    .fetch_one(h.actor.repo.pool())
    .await
    .unwrap();
    assert_eq!(processing_count, 1);

    h.send_sandbox_event(json!({
        "type": "execution_complete",
        "message_id": first.id,
        "success": true,
    }))
    .await;

    // Completion drains the queue onto the second message.
    let prompt = next_frame(&mut sandbox_rx).await;
    assert_eq!(prompt["message_id"], second.id.as_str());

    let processing_count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM messages WHERE status = 'processing'",
    )
    .fetch_one(h.actor.repo.pool())
    .await
    .unwrap();
    assert_eq!(processing_count, 1);
}

#[tokio::test]
async fn enqueue_mirrors_a_user_message_event_for_replay() {
    let h = build_harness().await;
    h.init_session().await;

    let message = h.enqueue("please fix the login flow").await;

    let replay = h.actor.repo.get_events_for_replay(10).await.unwrap();
    let mirror = replay
        .iter()
        .find(|e| e.event_type == "user_message")
        .expect("user_message mirror");
    assert_eq!(mirror.message_id.as_deref(), Some(message.id.as_str()));
    assert!(mirror.data_json.contains("please fix the login flow"));
}

#[tokio::test]
async fn invalid_model_override_is_dropped_not_rejected() {
    let h = build_harness().await;
    h.init_session().await;

    let message = h
        .actor
        .enqueue_prompt(tandem_server::session::queue::PromptRequest {
            user_id: "u-owner".into(),
            content: "hi".into(),
            source: tandem_server::models::MessageSource::Web,
            model: Some("not-a-model".into()),
            reasoning_effort: Some("ultra".into()),
            attachments: None,
            callback_context: None,
            request_id: None,
            origin_ws_id: None,
        })
        .await
        .unwrap();

    assert_eq!(message.model, None);
    assert_eq!(message.reasoning_effort, None);
}

#[tokio::test]
async fn archived_session_refuses_prompts() {
    let h = build_harness().await;
    h.init_session().await;
    h.actor.archive("u-owner").await.unwrap();

    let result = h
        .actor
        .enqueue_prompt(tandem_server::session::queue::PromptRequest {
            user_id: "u-owner".into(),
            content: "hi".into(),
            source: tandem_server::models::MessageSource::Web,
            model: None,
            reasoning_effort: None,
            attachments: None,
            callback_context: None,
            request_id: None,
            origin_ws_id: None,
        })
        .await;
    assert!(result.is_err());

    // Unarchive restores the write path.
    h.actor.unarchive("u-owner").await.unwrap();
    h.enqueue("hi again").await;
}

#[tokio::test]
async fn first_prompt_titles_the_session() {
    let h = build_harness().await;
    h.init_session().await;

    h.enqueue("Fix the login bug\nmore detail").await;
    let session = h.actor.repo.get_session().await.unwrap().unwrap();
    assert_eq!(session.title.as_deref(), Some("Fix the login bug"));

    h.enqueue("Different title").await;
    let session = h.actor.repo.get_session().await.unwrap().unwrap();
    assert_eq!(session.title.as_deref(), Some("Fix the login bug"));
}

#[tokio::test]
async fn completion_callback_fires_when_context_present() {
    let h = build_harness().await;
    h.init_session().await;
    let mut sandbox_rx = h.connect_sandbox().await;

    let message = h
        .actor
        .enqueue_prompt(tandem_server::session::queue::PromptRequest {
            user_id: "u-owner".into(),
            content: "from slack".into(),
            source: tandem_server::models::MessageSource::Slack,
            model: None,
            reasoning_effort: None,
            attachments: None,
            callback_context: Some(json!({ "channel": "C123", "thread_ts": "1.2" })),
            request_id: None,
            origin_ws_id: None,
        })
        .await
        .unwrap();
    let _ = next_frame(&mut sandbox_rx).await;

    h.send_sandbox_event(json!({
        "type": "execution_complete",
        "message_id": message.id,
        "success": true,
    }))
    .await;
    tokio::time::sleep(std::time::Duration::from_millis(30)).await;

    assert_eq!(h.callbacks.completions.load(Ordering::SeqCst), 1);
}
