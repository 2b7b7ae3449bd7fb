use async_trait::async_trait;
use feature_ledger_types::{FeatureResult, FeatureType};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::FeatureError;

/// Everything a feature implementation receives
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRequest {
    pub execution_id: String,
    pub feature_type: FeatureType,
    pub target_id: String,
    /// Caller context (locale, client version, ...) passed through untouched
    pub request_meta: Value,
    pub input_params: Value,
}

/// Runs a paid feature
#[async_trait]
pub trait FeatureExecutor: Send + Sync {
    async fn execute(&self, request: &FeatureRequest) -> Result<FeatureResult, FeatureError>;
}

/// Implementation of a single feature type
#[async_trait]
pub trait FeatureHandler: Send + Sync {
    async fn run(&self, request: &FeatureRequest) -> Result<FeatureResult, FeatureError>;
}

/// [`FeatureExecutor`] that dispatches on feature type to registered handlers
#[derive(Default, Clone)]
pub struct FeatureRegistry {
    handlers: HashMap<FeatureType, Arc<dyn FeatureHandler>>,
    timeout: Option<Duration>,
}

impl FeatureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, feature: FeatureType, handler: Arc<dyn FeatureHandler>) -> Self {
        self.handlers.insert(feature, handler);
        self
    }

    /// Fail runs that take longer than `timeout`
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn supports(&self, feature: FeatureType) -> bool {
        self.handlers.contains_key(&feature)
    }
}

#[async_trait]
impl FeatureExecutor for FeatureRegistry {
    async fn execute(&self, request: &FeatureRequest) -> Result<FeatureResult, FeatureError> {
        let handler = self
            .handlers
            .get(&request.feature_type)
            .ok_or(FeatureError::Unsupported(request.feature_type))?;

        debug!(
            execution_id = %request.execution_id,
            feature = %request.feature_type,
            "running feature"
        );

        match self.timeout {
            None => handler.run(request).await,
            Some(limit) => match tokio::time::timeout(limit, handler.run(request)).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(
                        execution_id = %request.execution_id,
                        timeout_ms = limit.as_millis() as u64,
                        "feature timed out"
                    );
                    Err(FeatureError::Timeout(limit.as_millis() as u64))
                }
            },
        }
    }
}
