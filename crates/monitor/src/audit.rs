//! Audit sink that writes records to the `audit` tracing target.
//!
//! Route the target to durable storage with a subscriber filter, e.g.
//! `RUST_LOG=audit=info`.

use gateway::{AuditRecord, AuditSink};

/// Emits each [`AuditRecord`] as one structured `tracing` event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, record: AuditRecord) {
        match serde_json::to_string(&record) {
            Ok(json) => tracing::info!(
                target: "audit",
                operation = %record.operation,
                data_source = %record.data_source,
                approved = record.approved,
                duration_ms = record.duration_ms,
                record = %json,
                "guarded action"
            ),
            Err(e) => tracing::warn!(error = %e, "audit record could not be encoded"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::{Arc, Mutex};

    use gateway::{OperationKind, Timestamp};
    use tracing_subscriber::fmt::MakeWriter;

    use super::*;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Captured {
        type Writer = Captured;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[test]
    fn records_are_emitted_on_the_audit_target() {
        let captured = Captured::default();
        let subscriber = tracing_subscriber::fmt()
            .json()
            .with_writer(captured.clone())
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            TracingAuditSink.record(AuditRecord {
                timestamp: Timestamp::now(),
                operation: OperationKind::MarketExploration,
                data_source: "mcp_navigate".to_string(),
                result_count: 1,
                approved: true,
                error: None,
                duration_ms: 42,
            });
        });

        let output = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains(r#""target":"audit""#));
        assert!(output.contains("mcp_navigate"));
        assert!(output.contains("market_exploration"));
    }
}
