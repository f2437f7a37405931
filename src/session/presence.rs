use serde_json::{json, Value};

use crate::error::AppResult;
use crate::models::{now_ms, EventCursor, Participant, ParticipantDto, SandboxDto};
use crate::websocket::protocol::server_frames;
use crate::websocket::registry::BroadcastMode;

use super::SessionActor;

/// Replay delivered on subscribe is capped at the newest 500 events.
pub const REPLAY_LIMIT: i64 = 500;

/// Per-client floor between history fetches.
pub const HISTORY_RATE_LIMIT_MS: i64 = 200;

pub const HISTORY_MAX_LIMIT: i64 = 500;
pub const HISTORY_DEFAULT_LIMIT: i64 = 100;

/// Result of a history fetch; rate-limited requests are a protocol answer,
/// not an error.
#[derive(Debug)]
pub enum HistoryResult {
    Page(Value),
    RateLimited,
}

impl SessionActor {
    // ========================================================================
    // Subscribe payload
    // ========================================================================

    /// The single `subscribed` message: session state, the caller's identity,
    /// and a bounded chronological replay with a continuation cursor.
    pub async fn build_subscribed_payload(&self, participant: &Participant) -> AppResult<Value> {
        let session = self.require_session().await?;
        let sandbox = self.repo.get_sandbox().await?;
        let spawn_error = sandbox.as_ref().and_then(|s| s.last_spawn_error.clone());

        // One extra row answers has_more without a count query.
        let mut events = self.repo.get_events_for_replay(REPLAY_LIMIT + 1).await?;
        let has_more = events.len() as i64 > REPLAY_LIMIT;
        if has_more {
            events.remove(0);
        }

        let cursor = events.first().map(|oldest| {
            json!({ "timestamp": oldest.created_at, "id": oldest.id })
        });
        // Malformed stored payloads are skipped, never fatal to the replay.
        let replayed: Vec<Value> = events
            .into_iter()
            .filter_map(|e| e.into_dto())
            .filter_map(|dto| serde_json::to_value(dto).ok())
            .collect();

        Ok(json!({
            "type": "subscribed",
            "session_id": self.session_id,
            "state": {
                "session": session,
                "sandbox": sandbox.map(SandboxDto::from),
            },
            "participant_id": participant.id,
            "participant": ParticipantDto::from(participant.clone()),
            "replay": {
                "events": replayed,
                "has_more": has_more,
                "cursor": cursor,
            },
            "spawn_error": spawn_error,
        }))
    }

    // ========================================================================
    // Presence fan-out
    // ========================================================================

    /// Full roster to everyone; sent when the authenticated set changes.
    pub async fn broadcast_presence_sync(&self) {
        let clients = self.registry.authenticated_clients().await;
        let roster: Vec<Value> = clients
            .iter()
            .map(|(_, info)| {
                json!({
                    "participant_id": info.participant_id,
                    "client_id": info.client_id,
                    "status": "online",
                })
            })
            .collect();

        self.registry
            .broadcast(
                BroadcastMode::AuthenticatedOnly,
                &server_frames::presence_sync(&Value::Array(roster)),
                &self.repo,
            )
            .await;
    }

    pub async fn broadcast_presence_update(&self, participant_id: &str, status: &str) {
        self.registry
            .broadcast(
                BroadcastMode::AuthenticatedOnly,
                &server_frames::presence_update(participant_id, status),
                &self.repo,
            )
            .await;
    }

    pub async fn broadcast_presence_leave(&self, participant_id: &str) {
        self.registry
            .broadcast(
                BroadcastMode::AuthenticatedOnly,
                &server_frames::presence_leave(participant_id),
                &self.repo,
            )
            .await;
    }

    // ========================================================================
    // History pagination
    // ========================================================================

    /// Page of events older than the cursor. Limits clamp to `[1, 500]`;
    /// callers faster than one request per 200 ms get `RateLimited`.
    pub async fn fetch_history(
        &self,
        ws_id: &str,
        cursor: &EventCursor,
        limit: Option<i64>,
    ) -> AppResult<HistoryResult> {
        let now = now_ms();
        {
            let mut limits = self.history_limits.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(last) = limits.get(ws_id) {
                if now - last < HISTORY_RATE_LIMIT_MS {
                    return Ok(HistoryResult::RateLimited);
                }
            }
            limits.insert(ws_id.to_owned(), now);
        }

        let limit = limit
            .unwrap_or(HISTORY_DEFAULT_LIMIT)
            .clamp(1, HISTORY_MAX_LIMIT);
        let (events, has_more) = self.repo.get_events_history_page(cursor, limit).await?;

        let next_cursor = events
            .first()
            .map(|oldest| json!({ "timestamp": oldest.created_at, "id": oldest.id }));
        let items: Vec<Value> = events
            .into_iter()
            .filter_map(|e| e.into_dto())
            .filter_map(|dto| serde_json::to_value(dto).ok())
            .collect();

        Ok(HistoryResult::Page(server_frames::history_page(
            &Value::Array(items),
            has_more,
            next_cursor.as_ref(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_limit_clamps() {
        assert_eq!(0_i64.clamp(1, HISTORY_MAX_LIMIT), 1);
        assert_eq!(10_000_i64.clamp(1, HISTORY_MAX_LIMIT), 500);
        assert_eq!((-5_i64).clamp(1, HISTORY_MAX_LIMIT), 1);
    }
}
