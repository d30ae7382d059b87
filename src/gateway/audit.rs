use std::sync::Arc;
use tracing::{debug, warn};

use crate::store::{AuditEntry, AuditSink};

/// Fire-and-forget front for an [`AuditSink`]. A failing sink is logged and
/// never changes the outcome of the invocation being audited.
#[derive(Clone)]
pub struct AuditLogger {
    sink: Arc<dyn AuditSink>,
}

impl AuditLogger {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self { sink }
    }

    pub fn record(&self, entry: &AuditEntry) {
        match self.sink.insert(entry) {
            Ok(()) => debug!(
                "Audited {} {}/{} -> {}",
                entry.request_id,
                entry.server_label,
                entry.tool_name,
                entry.result.as_str()
            ),
            Err(e) => {
                crate::server::metrics::record_audit_failure();
                warn!(
                    "Failed to write audit entry {} ({}): {:#}",
                    entry.request_id,
                    entry.result.as_str(),
                    e
                );
            }
        }
    }
}
