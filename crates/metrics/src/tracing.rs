use feature_ledger_types::{FeatureType, PricingMode};
use std::sync::Arc;
use tracing::{field::Visit, Event, Level, Subscriber};
use tracing_subscriber::{
    fmt,
    layer::{Context, SubscriberExt},
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::collector::MetricsCollector;

/// Filter used when `RUST_LOG` is not set
pub const DEFAULT_LOG_FILTER: &str = "info,feature_ledger=debug";

/// Initialize JSON tracing with metrics integration
pub fn init_tracing(collector: Arc<MetricsCollector>) -> Result<(), TracingError> {
    init_tracing_with_filter(collector, DEFAULT_LOG_FILTER)
}

/// Same as [`init_tracing`] with an explicit fallback filter
pub fn init_tracing_with_filter(
    collector: Arc<MetricsCollector>,
    default_filter: &str,
) -> Result<(), TracingError> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_level(true)
        .json();

    let metrics_layer = MetricsLayer::new(collector);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(metrics_layer)
        .try_init()
        .map_err(|e| TracingError::InitError(e.to_string()))?;

    Ok(())
}

/// Tracing layer that counts error events carrying an `error_code` field
pub struct MetricsLayer {
    collector: Arc<MetricsCollector>,
}

impl MetricsLayer {
    pub fn new(collector: Arc<MetricsCollector>) -> Self {
        Self { collector }
    }
}

impl<S> Layer<S> for MetricsLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() != Level::ERROR {
            return;
        }

        let mut visitor = ErrorCodeVisitor::default();
        event.record(&mut visitor);

        if let Some(code) = visitor.error_code.as_deref() {
            self.collector.record_error(code);
        }
    }
}

#[derive(Default)]
struct ErrorCodeVisitor {
    error_code: Option<String>,
}

impl Visit for ErrorCodeVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "error_code" {
            self.error_code = Some(format!("{value:?}").trim_matches('"').to_string());
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "error_code" {
            self.error_code = Some(value.to_string());
        }
    }
}

/// Correlation ID for tracking one request through the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationId(uuid::Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Span context for one execution request
#[derive(Debug, Clone)]
pub struct ExecutionSpan {
    pub correlation_id: CorrelationId,
    pub user_id: String,
    pub idempotency_key: String,
    pub feature_type: FeatureType,
    pub pricing_mode: PricingMode,
}

impl ExecutionSpan {
    pub fn new(
        user_id: impl Into<String>,
        idempotency_key: impl Into<String>,
        feature_type: FeatureType,
        pricing_mode: PricingMode,
    ) -> Self {
        Self {
            correlation_id: CorrelationId::new(),
            user_id: user_id.into(),
            idempotency_key: idempotency_key.into(),
            feature_type,
            pricing_mode,
        }
    }

    /// Build the tracing span; attach it to a future with `Instrument`
    pub fn span(&self) -> tracing::Span {
        tracing::info_span!(
            "execution",
            correlation_id = %self.correlation_id,
            user_id = %self.user_id,
            idempotency_key = %self.idempotency_key,
            feature = %self.feature_type,
            mode = %self.pricing_mode,
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TracingError {
    #[error("tracing initialization error: {0}")]
    InitError(String),
}
