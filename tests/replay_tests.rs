mod common;

use common::build_harness;
use serde_json::json;

use tandem_server::models::{EventCursor, ParticipantRole};
use tandem_server::session::presence::HistoryResult;

async fn seed_events(h: &common::Harness, non_heartbeat: i64, heartbeats: i64) {
    for i in 0..non_heartbeat {
        sqlx::query(
            "INSERT INTO events (id, event_type, data_json, created_at)
             VALUES (?1, 'tool_call', ?2, ?3)",
        )
        .bind(format!("e{i:04}"))
        .bind(json!({ "seq": i }).to_string())
        .bind(1_000 + i)
        .execute(h.actor.repo.pool())
        .await
        .unwrap();
    }
    for i in 0..heartbeats {
        sqlx::query(
            "INSERT INTO events (id, event_type, data_json, created_at)
             VALUES (?1, 'heartbeat', '{}', ?2)",
        )
        .bind(format!("h{i:04}"))
        .bind(1_500 + i)
        .execute(h.actor.repo.pool())
        .await
        .unwrap();
    }
}

/// Replay on subscribe: newest 500 non-heartbeat events in chronological
/// order, with a continuation cursor and no heartbeats.
#[tokio::test]
async fn replay_is_chronological_and_bounded() {
    let h = build_harness().await;
    h.init_session().await;
    seed_events(&h, 600, 50).await;

    let participant = h
        .actor
        .repo
        .ensure_participant("u-owner", ParticipantRole::Owner)
        .await
        .unwrap();
    let payload = h.actor.build_subscribed_payload(&participant).await.unwrap();

    let events = payload["replay"]["events"].as_array().unwrap();
    assert_eq!(events.len(), 500);
    assert_eq!(payload["replay"]["has_more"], true);

    // Chronological: the oldest delivered is e0100, the newest e0599.
    assert_eq!(events.first().unwrap()["id"], "e0100");
    assert_eq!(events.last().unwrap()["id"], "e0599");
    assert!(events.iter().all(|e| e["type"] != "heartbeat"));

    // Cursor points at the oldest delivered event.
    assert_eq!(payload["replay"]["cursor"]["id"], "e0100");
    assert_eq!(payload["replay"]["cursor"]["timestamp"], 1_100);
}

#[tokio::test]
async fn replay_skips_malformed_stored_events() {
    let h = build_harness().await;
    h.init_session().await;

    sqlx::query(
        "INSERT INTO events (id, event_type, data_json, created_at)
         VALUES ('bad', 'tool_call', '{broken', 1), ('good', 'tool_call', '{}', 2)",
    )
    .execute(h.actor.repo.pool())
    .await
    .unwrap();

    let participant = h
        .actor
        .repo
        .ensure_participant("u-owner", ParticipantRole::Owner)
        .await
        .unwrap();
    let payload = h.actor.build_subscribed_payload(&participant).await.unwrap();

    let events = payload["replay"]["events"].as_array().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["id"], "good");
}

#[tokio::test]
async fn subscribe_payload_carries_state_and_spawn_error() {
    let h = build_harness().await;
    h.init_session().await;
    h.actor.repo.record_spawn_error("no capacity").await.unwrap();

    let participant = h
        .actor
        .repo
        .ensure_participant("u-owner", ParticipantRole::Owner)
        .await
        .unwrap();
    let payload = h.actor.build_subscribed_payload(&participant).await.unwrap();

    assert_eq!(payload["type"], "subscribed");
    assert_eq!(payload["session_id"], "sess-test-1");
    assert_eq!(payload["participant_id"], participant.id.as_str());
    assert_eq!(payload["state"]["session"]["repo_owner"], "acme");
    assert_eq!(payload["spawn_error"], "no capacity");
    // Token material never reaches clients.
    assert!(payload["state"]["sandbox"].get("auth_token_hash").is_none());
}

// ============================================================================
// History pagination
// ============================================================================

#[tokio::test]
async fn history_pages_walk_backwards_with_cursor() {
    let h = build_harness().await;
    h.init_session().await;
    seed_events(&h, 10, 5).await;

    let cursor = EventCursor {
        timestamp: 1_005,
        id: "e0005".into(),
    };
    let result = h
        .actor
        .fetch_history("ws-1", &cursor, Some(3))
        .await
        .unwrap();

    let HistoryResult::Page(page) = result else {
        panic!("expected a page");
    };
    let items = page["items"].as_array().unwrap();
    assert_eq!(items.len(), 3);
    assert_eq!(items.first().unwrap()["id"], "e0002");
    assert_eq!(items.last().unwrap()["id"], "e0004");
    assert_eq!(page["has_more"], true);
    assert_eq!(page["cursor"]["id"], "e0002");
}

#[tokio::test]
async fn history_requests_are_rate_limited_per_client() {
    let h = build_harness().await;
    h.init_session().await;
    seed_events(&h, 5, 0).await;

    let cursor = EventCursor {
        timestamp: i64::MAX,
        id: "\u{10FFFF}".into(),
    };

    let first = h.actor.fetch_history("ws-1", &cursor, None).await.unwrap();
    assert!(matches!(first, HistoryResult::Page(_)));

    let second = h.actor.fetch_history("ws-1", &cursor, None).await.unwrap();
    assert!(matches!(second, HistoryResult::RateLimited));

    // A different client is not throttled by ws-1's request.
    let other = h.actor.fetch_history("ws-2", &cursor, None).await.unwrap();
    assert!(matches!(other, HistoryResult::Page(_)));

    // After the floor passes, ws-1 may fetch again.
    tokio::time::sleep(std::time::Duration::from_millis(250)).await;
    let third = h.actor.fetch_history("ws-1", &cursor, None).await.unwrap();
    assert!(matches!(third, HistoryResult::Page(_)));
}

#[tokio::test]
async fn history_limit_clamps_to_bounds() {
    let h = build_harness().await;
    h.init_session().await;
    seed_events(&h, 5, 0).await;

    let cursor = EventCursor {
        timestamp: i64::MAX,
        id: "\u{10FFFF}".into(),
    };
    let result = h
        .actor
        .fetch_history("ws-1", &cursor, Some(0))
        .await
        .unwrap();

    let HistoryResult::Page(page) = result else {
        panic!("expected a page");
    };
    // Limit 0 clamps to 1.
    assert_eq!(page["items"].as_array().unwrap().len(), 1);
}

// ============================================================================
// WS token round trip
// ============================================================================

#[tokio::test]
async fn ws_token_round_trip_resolves_participant_by_hash() {
    let h = build_harness().await;
    h.init_session().await;

    let rotated = h.actor.rotate_ws_token("u-owner").await.unwrap();
    let token = rotated["token"].as_str().unwrap();

    let participant = h.actor.authenticate_ws_token(token).await.unwrap();
    assert_eq!(participant.user_id, "u-owner");

    // The plaintext is never stored.
    let stored: Option<String> =
        sqlx::query_scalar("SELECT ws_auth_token_hash FROM participants WHERE user_id = 'u-owner'")
            .fetch_one(h.actor.repo.pool())
            .await
            .unwrap();
    assert_ne!(stored.as_deref(), Some(token));
}

#[tokio::test]
async fn tampered_ws_token_is_rejected() {
    let h = build_harness().await;
    h.init_session().await;

    let rotated = h.actor.rotate_ws_token("u-owner").await.unwrap();
    let mut token = rotated["token"].as_str().unwrap().to_owned();
    token.push('x');

    assert!(h.actor.authenticate_ws_token(&token).await.is_err());
}

#[tokio::test]
async fn expired_ws_token_is_rejected() {
    let h = build_harness().await;
    h.init_session().await;

    let rotated = h.actor.rotate_ws_token("u-owner").await.unwrap();
    let token = rotated["token"].as_str().unwrap().to_owned();

    // Age the token past the 24h lifetime.
    sqlx::query("UPDATE participants SET ws_token_created_at = ?1 WHERE user_id = 'u-owner'")
        .bind(tandem_server::models::now_ms() - 25 * 60 * 60 * 1000)
        .execute(h.actor.repo.pool())
        .await
        .unwrap();

    assert!(h.actor.authenticate_ws_token(&token).await.is_err());
}

#[tokio::test]
async fn rotation_invalidates_the_previous_token() {
    let h = build_harness().await;
    h.init_session().await;

    let first = h.actor.rotate_ws_token("u-owner").await.unwrap();
    let old_token = first["token"].as_str().unwrap().to_owned();
    h.actor.rotate_ws_token("u-owner").await.unwrap();

    assert!(h.actor.authenticate_ws_token(&old_token).await.is_err());
}
