//! Observability infrastructure for Wharf.
//!
//! Structured logging with consistent spans. This module provides
//! initialization helpers and span constructors used across all Wharf
//! components.

use std::sync::Once;

use tracing::Span;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

/// Initializes the logging subsystem.
///
/// Call once at application startup. Safe to call multiple times;
/// subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: controls log levels (e.g. `info`, `wharf_flow=debug`)
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Creates a span for one upload's lifecycle with standard fields.
#[must_use]
pub fn upload_span(operation: &str, warehouse: &str, upload_id: i64) -> Span {
    tracing::info_span!(
        "upload",
        op = operation,
        warehouse = warehouse,
        upload_id = upload_id,
    )
}

/// Creates a span for scheduler operations.
#[must_use]
pub fn scheduler_span(operation: &str, warehouse: &str) -> Span {
    tracing::info_span!("scheduler", op = operation, warehouse = warehouse)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_logging_is_idempotent() {
        init_logging(LogFormat::Pretty);
        init_logging(LogFormat::Pretty);
    }

    #[test]
    fn span_helpers_create_spans() {
        let span = upload_span("export", "POSTGRES:src:dst", 7);
        let _guard = span.enter();
        tracing::info!("test message in span");
    }
}
