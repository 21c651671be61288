use std::sync::{
    Arc, Mutex, PoisonError, RwLock,
    atomic::{AtomicBool, Ordering},
};

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    capabilities::Platform,
    redaction::{REDACTED, is_sensitive_key, redact_json_value},
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AnalyticsError {
    #[error("analytics has not been initialized")]
    NotInitialized,
    #[error("event properties must be a JSON object, got {0}")]
    InvalidProperties(&'static str),
}

/// A captured event, already tagged and redacted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalyticsEvent {
    pub name: String,
    pub platform: Platform,
    pub distinct_id: Option<String>,
    pub properties: Map<String, Value>,
}

pub trait AnalyticsSink: Send + Sync {
    fn capture(&self, event: AnalyticsEvent);
}

/// Sink that emits events as tracing records.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAnalyticsSink;

impl AnalyticsSink for TracingAnalyticsSink {
    fn capture(&self, event: AnalyticsEvent) {
        info!(
            event = %event.name,
            platform = event.platform.as_str(),
            properties = %serde_json::Value::Object(event.properties),
            "analytics event"
        );
    }
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryAnalyticsSink {
    events: Arc<Mutex<Vec<AnalyticsEvent>>>,
}

impl InMemoryAnalyticsSink {
    pub fn events(&self) -> Vec<AnalyticsEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl AnalyticsSink for InMemoryAnalyticsSink {
    fn capture(&self, event: AnalyticsEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

/// Analytics client: platform tagging, identity and property redaction in
/// front of a sink.
pub struct Analytics {
    sink: Arc<dyn AnalyticsSink>,
    platform: Platform,
    initialized: AtomicBool,
    distinct_id: RwLock<Option<String>>,
}

impl Analytics {
    pub fn new(sink: Arc<dyn AnalyticsSink>, platform: Platform) -> Self {
        Self {
            sink,
            platform,
            initialized: AtomicBool::new(false),
            distinct_id: RwLock::new(None),
        }
    }

    /// Returns `false` when already initialized.
    pub fn init(&self) -> bool {
        let first = !self.initialized.swap(true, Ordering::SeqCst);
        if first {
            info!(platform = self.platform.as_str(), "analytics initialized");
        } else {
            debug!("analytics already initialized");
        }
        first
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn identify(&self, user_id: impl Into<String>) {
        *self
            .distinct_id
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(user_id.into());
    }

    /// Forget the identified user (sign-out).
    pub fn reset(&self) {
        *self
            .distinct_id
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn track(&self, name: &str, properties: Value) -> Result<(), AnalyticsError> {
        if !self.is_initialized() {
            return Err(AnalyticsError::NotInitialized);
        }
        let mut properties = match properties {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            Value::Bool(_) => return Err(AnalyticsError::InvalidProperties("bool")),
            Value::Number(_) => return Err(AnalyticsError::InvalidProperties("number")),
            Value::String(_) => return Err(AnalyticsError::InvalidProperties("string")),
            Value::Array(_) => return Err(AnalyticsError::InvalidProperties("array")),
        };
        properties.values_mut().for_each(redact_json_value);
        for (key, value) in properties.iter_mut() {
            if is_sensitive_key(key) {
                *value = Value::String(REDACTED.to_owned());
            }
        }

        let distinct_id = self
            .distinct_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        self.sink.capture(AnalyticsEvent {
            name: name.to_owned(),
            platform: self.platform,
            distinct_id,
            properties,
        });
        Ok(())
    }
}
