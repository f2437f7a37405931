use std::sync::Arc;

use crate::config::Config;
use crate::session::SessionRegistry;

/// Shared application state passed to all handlers and extractors.
///
/// Both fields are `Arc`s, so cloning `AppState` for each request is
/// inexpensive. Per-session state lives inside the actors held by
/// `SessionRegistry`, never here.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub sessions: Arc<SessionRegistry>,
}
