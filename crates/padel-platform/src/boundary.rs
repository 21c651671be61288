use std::{
    any::Any,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
};

use padel_core::AppError;
use tracing::warn;

use crate::reporter::{ErrorReporter, ReportContext};

/// What a boundary rendered.
#[derive(Debug, Clone, PartialEq)]
pub enum Rendered<V> {
    View(V),
    Fallback(BoundaryFallback),
}

/// Fallback shown in place of a failed subtree.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundaryFallback {
    pub boundary: String,
    pub error: AppError,
    pub can_retry: bool,
}

/// Supervises a render closure. Both `Err` results and panics are caught,
/// reported once, and latched until `reset`.
pub struct ErrorBoundary {
    name: String,
    reporter: Arc<dyn ErrorReporter>,
    failure: Option<AppError>,
}

impl ErrorBoundary {
    pub fn new(name: impl Into<String>, reporter: Arc<dyn ErrorReporter>) -> Self {
        Self {
            name: name.into(),
            reporter,
            failure: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn error(&self) -> Option<&AppError> {
        self.failure.as_ref()
    }

    pub fn render<V, F>(&mut self, render: F) -> Rendered<V>
    where
        F: FnOnce() -> Result<V, AppError>,
    {
        if let Some(err) = &self.failure {
            return Rendered::Fallback(self.fallback(err.clone()));
        }

        let err = match catch_unwind(AssertUnwindSafe(render)) {
            Ok(Ok(view)) => return Rendered::View(view),
            Ok(Err(err)) => err,
            Err(payload) => AppError::unknown(panic_message(payload.as_ref())),
        };

        warn!(boundary = %self.name, code = err.code.as_str(), "boundary caught failure");
        self.reporter
            .report(&err, &ReportContext::new(self.name.clone(), err.status));
        self.failure = Some(err.clone());
        Rendered::Fallback(self.fallback(err))
    }

    /// Clear the latched failure so the next `render` runs the closure again.
    pub fn reset(&mut self) {
        self.failure = None;
    }

    fn fallback(&self, error: AppError) -> BoundaryFallback {
        BoundaryFallback {
            boundary: self.name.clone(),
            can_retry: !error.requires_sign_out(),
            error,
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "render panicked".to_owned()
    }
}
