use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, RwLock};

use crate::models::now_ms;
use crate::repository::Repository;

use super::protocol::{close_codes, server_frames};

/// Outbound traffic for one socket. The socket's writer task turns these into
/// WebSocket frames; a `Close` also ends the writer.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text(String),
    Close { code: u16, reason: String },
}

pub type SocketSender = mpsc::UnboundedSender<Outbound>;

/// Identity of an authenticated client socket.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub participant_id: String,
    pub client_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastMode {
    AllClients,
    AuthenticatedOnly,
}

#[derive(Default)]
struct RegistryInner {
    /// Every accepted client socket, authenticated or not, keyed by ws id.
    clients: HashMap<String, SocketSender>,
    /// In-memory identity cache. Lost on restart; rebuilt from persisted
    /// mappings on demand.
    client_info: HashMap<String, ClientInfo>,
    /// Incrementally-built set of authenticated ws ids.
    authenticated: HashSet<String>,
    /// Set once a full scan has reconciled `authenticated` against persisted
    /// mappings; later broadcasts take the fast path.
    authenticated_complete: bool,
    /// At most one active sandbox socket.
    sandbox: Option<(String, SocketSender)>,
}

/// Sole owner of WebSocket bookkeeping for one session: accepts sockets,
/// routes sends, fans out broadcasts, and recovers client identity from the
/// store after a restart. Sends never fail loudly — a closed channel is a
/// disconnect in progress, not an error.
#[derive(Clone, Default)]
pub struct WebSocketRegistry {
    inner: Arc<RwLock<RegistryInner>>,
}

impl WebSocketRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Accept / remove
    // ========================================================================

    pub async fn accept_client(&self, ws_id: &str, tx: SocketSender) {
        let mut inner = self.inner.write().await;
        inner.clients.insert(ws_id.to_owned(), tx);
    }

    pub async fn remove_client(&self, ws_id: &str) {
        let mut inner = self.inner.write().await;
        inner.clients.remove(ws_id);
        inner.client_info.remove(ws_id);
        inner.authenticated.remove(ws_id);
    }

    /// Install the active sandbox socket. A previously cached socket is closed
    /// with a normal close so the old sandbox stops writing. Returns whether a
    /// replacement happened.
    pub async fn accept_sandbox(&self, sandbox_id: &str, tx: SocketSender) -> bool {
        let mut inner = self.inner.write().await;
        let replaced = match inner.sandbox.take() {
            Some((_, old_tx)) => {
                let _ = old_tx.send(Outbound::Close {
                    code: close_codes::NORMAL,
                    reason: "New sandbox connecting".into(),
                });
                true
            }
            None => false,
        };
        inner.sandbox = Some((sandbox_id.to_owned(), tx));
        replaced
    }

    /// Clear the sandbox slot, but only when `tx` is still the active socket.
    /// A close that races with a replacement must not tear down the new one.
    pub async fn clear_sandbox_if_match(&self, tx: &SocketSender) {
        let mut inner = self.inner.write().await;
        if let Some((_, active)) = &inner.sandbox {
            if active.same_channel(tx) {
                inner.sandbox = None;
            }
        }
    }

    pub async fn sandbox_sender(&self) -> Option<SocketSender> {
        let inner = self.inner.read().await;
        inner
            .sandbox
            .as_ref()
            .filter(|(_, tx)| !tx.is_closed())
            .map(|(_, tx)| tx.clone())
    }

    pub async fn sandbox_connected(&self) -> bool {
        self.sandbox_sender().await.is_some()
    }

    // ========================================================================
    // Client identity
    // ========================================================================

    pub async fn set_client(&self, ws_id: &str, info: ClientInfo) {
        let mut inner = self.inner.write().await;
        inner.client_info.insert(ws_id.to_owned(), info);
        inner.authenticated.insert(ws_id.to_owned());
    }

    pub async fn get_client(&self, ws_id: &str) -> Option<ClientInfo> {
        self.inner.read().await.client_info.get(ws_id).cloned()
    }

    /// Identity lookup that falls back to the persisted mapping when the
    /// in-memory cache was lost to a restart. The recovered identity is
    /// re-cached.
    pub async fn recover_client(&self, ws_id: &str, repo: &Repository) -> Option<ClientInfo> {
        if let Some(info) = self.get_client(ws_id).await {
            return Some(info);
        }

        let mapping = repo.get_ws_mapping(ws_id).await.ok()??;
        let info = ClientInfo {
            participant_id: mapping.participant_id,
            client_id: mapping.client_id,
        };
        self.set_client(ws_id, info.clone()).await;
        Some(info)
    }

    pub async fn authenticated_clients(&self) -> Vec<(String, ClientInfo)> {
        let inner = self.inner.read().await;
        inner
            .client_info
            .iter()
            .map(|(ws_id, info)| (ws_id.clone(), info.clone()))
            .collect()
    }

    pub async fn connected_client_count(&self) -> usize {
        self.inner.read().await.clients.len()
    }

    // ========================================================================
    // Sends
    // ========================================================================

    /// Send to one client. Returns `false` (never errors) when the socket is
    /// gone or its channel already closed.
    pub async fn send_to_client(&self, ws_id: &str, msg: &Value) -> bool {
        let inner = self.inner.read().await;
        match inner.clients.get(ws_id) {
            Some(tx) => tx.send(Outbound::Text(msg.to_string())).is_ok(),
            None => false,
        }
    }

    pub async fn send_to_sandbox(&self, msg: &Value) -> bool {
        let inner = self.inner.read().await;
        match &inner.sandbox {
            Some((_, tx)) => tx.send(Outbound::Text(msg.to_string())).is_ok(),
            None => false,
        }
    }

    pub async fn close_client(&self, ws_id: &str, code: u16, reason: &str) {
        let inner = self.inner.read().await;
        if let Some(tx) = inner.clients.get(ws_id) {
            let _ = tx.send(Outbound::Close {
                code,
                reason: reason.to_owned(),
            });
        }
    }

    pub async fn close_sandbox(&self, code: u16, reason: &str) {
        let mut inner = self.inner.write().await;
        if let Some((_, tx)) = inner.sandbox.take() {
            let _ = tx.send(Outbound::Close {
                code,
                reason: reason.to_owned(),
            });
        }
    }

    /// Fan a frame out to client sockets. The payload is serialized once.
    /// Sandbox sockets are never reached from here.
    ///
    /// `AuthenticatedOnly` consults the incrementally-built authenticated
    /// set; the first broadcast after a restart reconciles it against the
    /// persisted mappings, and later broadcasts skip the store entirely.
    pub async fn broadcast(&self, mode: BroadcastMode, msg: &Value, repo: &Repository) {
        let serialized = msg.to_string();

        if mode == BroadcastMode::AuthenticatedOnly {
            self.backfill_authenticated(repo).await;
        }

        let inner = self.inner.read().await;
        for (ws_id, tx) in &inner.clients {
            if mode == BroadcastMode::AuthenticatedOnly && !inner.authenticated.contains(ws_id) {
                continue;
            }
            let _ = tx.send(Outbound::Text(serialized.clone()));
        }
    }

    async fn backfill_authenticated(&self, repo: &Repository) {
        if self.inner.read().await.authenticated_complete {
            return;
        }

        // Full scan: a socket counts as authenticated when it has in-memory
        // identity or a persisted mapping from before the restart.
        let ws_ids: Vec<String> = {
            let inner = self.inner.read().await;
            inner
                .clients
                .keys()
                .filter(|id| !inner.authenticated.contains(*id))
                .cloned()
                .collect()
        };

        let mut recovered = Vec::new();
        for ws_id in ws_ids {
            if let Ok(Some(_)) = repo.get_ws_mapping(&ws_id).await {
                recovered.push(ws_id);
            }
        }

        let mut inner = self.inner.write().await;
        for ws_id in recovered {
            inner.authenticated.insert(ws_id);
        }
        inner.authenticated_complete = true;
    }

    // ========================================================================
    // Auth timeout watchdog
    // ========================================================================

    /// Give a fresh client socket `timeout` to authenticate. If the window
    /// elapses with neither in-memory identity nor a persisted mapping, the
    /// socket is closed with 4008.
    pub async fn enforce_auth_timeout(&self, ws_id: &str, timeout: Duration, repo: &Repository) {
        tokio::time::sleep(timeout).await;

        let still_connected = self.inner.read().await.clients.contains_key(ws_id);
        if !still_connected {
            return;
        }
        if self.get_client(ws_id).await.is_some() {
            return;
        }
        if let Ok(Some(_)) = repo.get_ws_mapping(ws_id).await {
            return;
        }

        tracing::debug!(ws_id, "Closing unauthenticated socket after timeout");
        self.close_client(ws_id, close_codes::AUTH_TIMEOUT, "Authentication timeout")
            .await;
    }

    /// Answer a ping without involving the caller's state.
    pub async fn pong(&self, ws_id: &str) {
        let frame = server_frames::pong(now_ms());
        self.send_to_client(ws_id, &frame).await;
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use serde_json::json;

    fn make_channel() -> (SocketSender, mpsc::UnboundedReceiver<Outbound>) {
        mpsc::unbounded_channel()
    }

    async fn test_repo() -> Repository {
        let pool = db::create_memory_pool().await.unwrap();
        db::run_migrations(&pool).await.unwrap();
        Repository::new(pool)
    }

    fn text_of(outbound: Outbound) -> String {
        match outbound {
            Outbound::Text(t) => t,
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn send_to_missing_client_returns_false() {
        let registry = WebSocketRegistry::new();
        assert!(!registry.send_to_client("nope", &json!({"x": 1})).await);
    }

    #[tokio::test]
    async fn send_to_client_delivers() {
        let registry = WebSocketRegistry::new();
        let (tx, mut rx) = make_channel();
        registry.accept_client("ws1", tx).await;

        assert!(registry.send_to_client("ws1", &json!({"type": "pong"})).await);
        let text = text_of(rx.recv().await.unwrap());
        assert!(text.contains("pong"));
    }

    #[tokio::test]
    async fn sandbox_replacement_closes_previous_socket() {
        let registry = WebSocketRegistry::new();
        let (tx1, mut rx1) = make_channel();
        let (tx2, _rx2) = make_channel();

        assert!(!registry.accept_sandbox("sb1", tx1).await);
        assert!(registry.accept_sandbox("sb1", tx2).await);

        match rx1.recv().await.unwrap() {
            Outbound::Close { code, reason } => {
                assert_eq!(code, close_codes::NORMAL);
                assert_eq!(reason, "New sandbox connecting");
            }
            other => panic!("expected close, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn clear_sandbox_only_when_still_active() {
        let registry = WebSocketRegistry::new();
        let (tx1, _rx1) = make_channel();
        let (tx2, _rx2) = make_channel();

        registry.accept_sandbox("sb1", tx1.clone()).await;
        registry.accept_sandbox("sb1", tx2.clone()).await;

        // The replaced socket's teardown must not remove the new socket.
        registry.clear_sandbox_if_match(&tx1).await;
        assert!(registry.sandbox_connected().await);

        registry.clear_sandbox_if_match(&tx2).await;
        assert!(!registry.sandbox_connected().await);
    }

    #[tokio::test]
    async fn broadcast_all_reaches_unauthenticated_clients_but_not_sandbox() {
        let registry = WebSocketRegistry::new();
        let repo = test_repo().await;
        let (client_tx, mut client_rx) = make_channel();
        let (sandbox_tx, mut sandbox_rx) = make_channel();

        registry.accept_client("ws1", client_tx).await;
        registry.accept_sandbox("sb1", sandbox_tx).await;

        registry
            .broadcast(BroadcastMode::AllClients, &json!({"type": "sandbox_status"}), &repo)
            .await;

        assert!(client_rx.recv().await.is_some());
        assert!(sandbox_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn authenticated_broadcast_skips_anonymous_sockets() {
        let registry = WebSocketRegistry::new();
        let repo = test_repo().await;
        let (anon_tx, mut anon_rx) = make_channel();
        let (auth_tx, mut auth_rx) = make_channel();

        registry.accept_client("anon", anon_tx).await;
        registry.accept_client("auth", auth_tx).await;
        registry
            .set_client(
                "auth",
                ClientInfo {
                    participant_id: "p1".into(),
                    client_id: "c1".into(),
                },
            )
            .await;

        registry
            .broadcast(
                BroadcastMode::AuthenticatedOnly,
                &json!({"type": "presence_sync"}),
                &repo,
            )
            .await;

        assert!(auth_rx.recv().await.is_some());
        assert!(anon_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn backfill_recovers_persisted_mappings() {
        let registry = WebSocketRegistry::new();
        let repo = test_repo().await;
        repo.persist_ws_mapping("ws-old", "p1", "c1").await.unwrap();

        // Socket reconnects after a restart: no in-memory identity, but the
        // mapping survives in the store.
        let (tx, mut rx) = make_channel();
        registry.accept_client("ws-old", tx).await;

        registry
            .broadcast(
                BroadcastMode::AuthenticatedOnly,
                &json!({"type": "presence_sync"}),
                &repo,
            )
            .await;
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn recover_client_rebuilds_cache_from_store() {
        let registry = WebSocketRegistry::new();
        let repo = test_repo().await;
        repo.persist_ws_mapping("ws1", "p9", "c9").await.unwrap();

        let info = registry.recover_client("ws1", &repo).await.unwrap();
        assert_eq!(info.participant_id, "p9");
        // Second lookup hits the cache.
        assert!(registry.get_client("ws1").await.is_some());
    }

    #[tokio::test]
    async fn auth_timeout_closes_anonymous_socket() {
        let registry = WebSocketRegistry::new();
        let repo = test_repo().await;
        let (tx, mut rx) = make_channel();
        registry.accept_client("ws1", tx).await;

        registry
            .enforce_auth_timeout("ws1", Duration::from_millis(10), &repo)
            .await;

        match rx.recv().await.unwrap() {
            Outbound::Close { code, .. } => assert_eq!(code, close_codes::AUTH_TIMEOUT),
            other => panic!("expected close, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn auth_timeout_spares_authenticated_socket() {
        let registry = WebSocketRegistry::new();
        let repo = test_repo().await;
        let (tx, mut rx) = make_channel();
        registry.accept_client("ws1", tx).await;
        registry
            .set_client(
                "ws1",
                ClientInfo {
                    participant_id: "p1".into(),
                    client_id: "c1".into(),
                },
            )
            .await;

        registry
            .enforce_auth_timeout("ws1", Duration::from_millis(10), &repo)
            .await;
        assert!(rx.try_recv().is_err());
    }
}
