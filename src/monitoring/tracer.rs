/*!
 * Structured Tracing
 * Subscriber setup and correlated spans for multi-step instance operations
 */

use crate::core::types::InstanceId;
use std::time::Instant;
use tracing::{debug, info, span, warn, Level, Span};
use tracing_subscriber::{
    fmt::format::FmtSpan, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};
use uuid::Uuid;

/// Operations slower than this are reported at warn level
const SLOW_OPERATION_MS: u128 = 1_000;

/// Initialize structured tracing
///
/// Environment variables:
/// - RUST_LOG: Set log level (default: info)
/// - FLEET_TRACE_JSON: Enable JSON output (default: false)
///
/// Safe to call more than once; later calls are ignored.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let use_json = std::env::var("FLEET_TRACE_JSON")
        .map(|v| v == "1" || v == "true")
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(env_filter);

    let initialized = if use_json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_names(true)
                    .with_line_number(true)
                    .with_file(true)
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .try_init()
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_names(true)
                    .with_span_events(FmtSpan::CLOSE)
                    .compact(),
            )
            .try_init()
    };

    if initialized.is_ok() {
        info!(json = use_json, "Structured tracing initialized");
    }
}

/// Correlation id shared by every event of one multi-step operation
pub fn generate_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

/// Span covering one lifecycle operation on one instance
///
/// Records the outcome and duration when dropped.
pub struct InstanceSpan {
    span: Span,
    start: Instant,
    operation: &'static str,
    correlation_id: String,
}

impl InstanceSpan {
    pub fn new(operation: &'static str, id: &InstanceId) -> Self {
        let correlation_id = generate_correlation_id();
        let span = span!(
            Level::INFO,
            "instance_op",
            correlation_id = %correlation_id,
            operation,
            instance_id = %id,
            result = tracing::field::Empty,
            error = tracing::field::Empty,
        );
        Self {
            span,
            start: Instant::now(),
            operation,
            correlation_id,
        }
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// The underlying span, for `Instrument::instrument`
    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn record_result(&self, success: bool) {
        self.span
            .record("result", if success { "success" } else { "error" });
    }

    pub fn record_error(&self, error: &str) {
        self.span.record("error", error);
        self.span.record("result", "error");
    }
}

impl Drop for InstanceSpan {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed();
        let _entered = self.span.enter();
        if elapsed.as_millis() > SLOW_OPERATION_MS {
            warn!(
                operation = self.operation,
                duration_ms = elapsed.as_millis() as u64,
                slow = true,
                "slow instance operation"
            );
        } else {
            debug!(
                operation = self.operation,
                duration_ms = elapsed.as_millis() as u64,
                "instance operation completed"
            );
        }
    }
}

/// Helper to open an instance span
#[inline]
pub fn instance_span(operation: &'static str, id: &InstanceId) -> InstanceSpan {
    InstanceSpan::new(operation, id)
}
