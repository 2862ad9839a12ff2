//! Logging module for topicflow
//!
//! Structured logging through the tracing crate: JSON output in production
//! and pretty output during development. The span macros here give every
//! consumed and produced message a span carrying its address.

use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Registry,
};

use crate::error::{Error, Result};

/// Initialize the logging system
///
/// `RUST_LOG` takes precedence over `log_level` when it is set.
pub fn init_tracing(log_level: &str, environment: &str) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("topicflow={},rdkafka=warn", log_level)));

    if environment == "production" {
        let formatting_layer = fmt::layer()
            .json()
            .with_file(true)
            .with_line_number(true)
            .with_thread_ids(true)
            .with_target(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_current_span(true);

        Registry::default()
            .with(env_filter)
            .with(formatting_layer)
            .try_init()
            .map_err(|e| Error::invalid_config(format!("failed to initialize tracing: {}", e)))?;
    } else {
        let formatting_layer = fmt::layer()
            .pretty()
            .with_file(true)
            .with_line_number(true)
            .with_target(true)
            .with_span_events(FmtSpan::CLOSE);

        Registry::default()
            .with(env_filter)
            .with(formatting_layer)
            .try_init()
            .map_err(|e| Error::invalid_config(format!("failed to initialize tracing: {}", e)))?;
    }

    tracing::info!(
        environment = environment,
        log_level = log_level,
        "Logging initialized"
    );

    Ok(())
}

/// Create a span for handling a consumed message
#[macro_export]
macro_rules! kafka_span {
    ($group_id:expr, $topic:expr, $partition:expr, $offset:expr) => {
        tracing::info_span!(
            "kafka_message",
            group_id = %$group_id,
            topic = %$topic,
            partition = $partition,
            offset = $offset,
            retry = tracing::field::Empty,
            processing_time_ms = tracing::field::Empty,
        )
    };
}

/// Create a span for producing a message
#[macro_export]
macro_rules! produce_span {
    ($topic:expr) => {
        tracing::debug_span!(
            "kafka_produce",
            topic = %$topic,
            partition = tracing::field::Empty,
            offset = tracing::field::Empty,
        )
    };
}

/// Log an error with context
#[macro_export]
macro_rules! log_error {
    ($error:expr, $msg:expr) => {
        tracing::error!(
            error = %$error,
            error_type = ?$error,
            $msg
        )
    };
    ($error:expr, $msg:expr, $($key:ident = $value:expr),* $(,)?) => {
        tracing::error!(
            error = %$error,
            error_type = ?$error,
            $($key = tracing::field::display(&$value),)*
            $msg
        )
    };
}

/// Times an operation and logs how long it took
pub struct Timer {
    start: std::time::Instant,
    operation: String,
}

impl Timer {
    pub fn start(operation: impl Into<String>) -> Self {
        Timer {
            start: std::time::Instant::now(),
            operation: operation.into(),
        }
    }

    /// Stop the timer and log the duration at debug level
    pub fn stop(self) -> std::time::Duration {
        let duration = self.start.elapsed();
        tracing::debug!(
            operation = %self.operation,
            duration_ms = duration.as_millis(),
            "Operation completed"
        );
        duration
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer() {
        let timer = Timer::start("handle");
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert!(timer.stop().as_millis() >= 10);
    }

    #[test]
    fn test_spans_accept_message_fields() {
        let span = crate::kafka_span!("group", "orders", 1, 42i64);
        span.record("retry", "Linear: Wait 1s (max 3 retries)");
        span.record("processing_time_ms", 5u64);

        let span = crate::produce_span!("orders");
        span.record("offset", 7i64);
    }
}
