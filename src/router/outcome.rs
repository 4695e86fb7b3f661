//! Request outcome recording: propagates dead markers to the store and
//! always forwards a log record to the access log sink, regardless of
//! whether the store write succeeds.

use super::types::RequestDecision;
use crate::accesslog::LogSink;
use crate::store::{StoreError, StoreFacade};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

pub struct OutcomeRecorder {
    store: Arc<dyn StoreFacade>,
    access_log: Arc<LogSink>,
    dead_ttl: Duration,
}

impl OutcomeRecorder {
    pub fn new(store: Arc<dyn StoreFacade>, access_log: Arc<LogSink>, dead_ttl: Duration) -> Self {
        Self {
            store,
            access_log,
            dead_ttl,
        }
    }

    /// `log_supplier` is only invoked when logging is enabled, keeping the
    /// request path allocation-free when the sink is disabled. A failed
    /// `mark_dead` is returned to the caller, but logging still proceeds
    /// unconditionally either way.
    pub async fn end<F>(
        &self,
        decision: &RequestDecision,
        is_dead: bool,
        log_supplier: Option<F>,
    ) -> Result<(), StoreError>
    where
        F: FnOnce() -> crate::accesslog::LogRecord,
    {
        let mut mark_dead_result = Ok(());

        if is_dead {
            if let Some(url) = &decision.chosen_url {
                if let Some(index) = decision.chosen_index {
                    let result = self
                        .store
                        .mark_dead(
                            &decision.host_used,
                            url,
                            index,
                            decision.backend_list_len as u32,
                            self.dead_ttl,
                        )
                        .await;
                    if let Err(e) = &result {
                        self.log_mark_dead_failure(decision, url, e);
                    }
                    mark_dead_result = result;
                }
            }
        }

        if self.access_log.is_enabled() {
            if let Some(supplier) = log_supplier {
                self.access_log.submit(supplier());
            }
        }

        mark_dead_result
    }

    fn log_mark_dead_failure(&self, decision: &RequestDecision, url: &str, err: &StoreError) {
        crate::dedlog::err(
            Some(err),
            Some(&format!("host={} backend={}", decision.host_used, url)),
            "failed to mark backend dead",
        );
        warn!(
            component = "router",
            scope = "outcome",
            event = "mark_dead_failed",
            host = %decision.host_used,
            backend = %url,
            error = %err,
            "mark_dead failed, logging still proceeds"
        );
    }
}
