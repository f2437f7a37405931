use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use crate::providers::CallbackService;

/// Best-effort fan-out to downstream integration bots (Slack, Linear, …).
///
/// Every notification runs on a detached task and only logs on failure —
/// callback delivery must never fail or slow the caller.
#[derive(Clone)]
pub struct CallbackBridge {
    service: Arc<dyn CallbackService>,
}

impl CallbackBridge {
    pub fn new(service: Arc<dyn CallbackService>) -> Self {
        Self { service }
    }

    pub fn fire_tool_call(&self, callback_context: Value, tool_call: Value) {
        let service = self.service.clone();
        tokio::spawn(async move {
            if let Err(e) = service.notify_tool_call(&callback_context, &tool_call).await {
                warn!(error = %e, "Tool-call callback delivery failed");
            }
        });
    }

    pub fn fire_execution_complete(&self, callback_context: Value, success: bool) {
        let service = self.service.clone();
        tokio::spawn(async move {
            if let Err(e) = service
                .notify_execution_complete(&callback_context, success)
                .await
            {
                warn!(error = %e, "Execution-complete callback delivery failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::providers::ProviderError;

    struct CountingService {
        delivered: AtomicUsize,
    }

    #[async_trait]
    impl CallbackService for CountingService {
        async fn notify_tool_call(
            &self,
            _ctx: &Value,
            _tool: &Value,
        ) -> Result<(), ProviderError> {
            self.delivered.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn notify_execution_complete(
            &self,
            _ctx: &Value,
            _success: bool,
        ) -> Result<(), ProviderError> {
            Err(ProviderError::transient("down"))
        }
    }

    #[tokio::test]
    async fn delivery_runs_in_background() {
        let service = Arc::new(CountingService {
            delivered: AtomicUsize::new(0),
        });
        let bridge = CallbackBridge::new(service.clone());

        bridge.fire_tool_call(serde_json::json!({}), serde_json::json!({}));
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(service.delivered.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_delivery_does_not_panic() {
        let service = Arc::new(CountingService {
            delivered: AtomicUsize::new(0),
        });
        let bridge = CallbackBridge::new(service);
        bridge.fire_execution_complete(serde_json::json!({}), true);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
}
