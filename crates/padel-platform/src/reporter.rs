use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, PoisonError},
};

use padel_core::{AppError, HttpMethod};
use serde::Serialize;
use tracing::{debug, error};

/// Where a reported error came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportContext {
    pub endpoint: String,
    pub status: Option<u16>,
}

impl ReportContext {
    pub fn new(endpoint: impl Into<String>, status: Option<u16>) -> Self {
        Self {
            endpoint: endpoint.into(),
            status,
        }
    }
}

/// One network attempt, recorded whether it succeeded or not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Breadcrumb {
    pub method: HttpMethod,
    pub url: String,
    pub status: Option<u16>,
    pub duration_ms: u64,
}

/// Error-reporting sink. Implementations must not block.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, error: &AppError, context: &ReportContext);

    fn add_breadcrumb(&self, breadcrumb: Breadcrumb);
}

/// Reporter that only emits tracing events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingErrorReporter;

impl ErrorReporter for TracingErrorReporter {
    fn report(&self, err: &AppError, context: &ReportContext) {
        error!(
            code = err.code.as_str(),
            status = ?context.status,
            endpoint = %context.endpoint,
            message = %err.message,
            "request failed"
        );
    }

    fn add_breadcrumb(&self, breadcrumb: Breadcrumb) {
        debug!(
            method = %breadcrumb.method,
            url = %breadcrumb.url,
            status = ?breadcrumb.status,
            duration_ms = breadcrumb.duration_ms,
            "breadcrumb"
        );
    }
}

const DEFAULT_BREADCRUMB_CAPACITY: usize = 100;

#[derive(Debug, Default)]
struct Recorded {
    reports: Vec<(AppError, ReportContext)>,
    breadcrumbs: VecDeque<Breadcrumb>,
}

/// Reporter that keeps everything in memory. Breadcrumbs are a bounded ring.
#[derive(Debug, Clone)]
pub struct InMemoryErrorReporter {
    recorded: Arc<Mutex<Recorded>>,
    breadcrumb_capacity: usize,
}

impl InMemoryErrorReporter {
    pub fn with_capacity(breadcrumb_capacity: usize) -> Self {
        Self {
            recorded: Arc::default(),
            breadcrumb_capacity: breadcrumb_capacity.max(1),
        }
    }

    pub fn reports(&self) -> Vec<(AppError, ReportContext)> {
        self.lock().reports.clone()
    }

    pub fn breadcrumbs(&self) -> Vec<Breadcrumb> {
        self.lock().breadcrumbs.iter().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Recorded> {
        self.recorded.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for InMemoryErrorReporter {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_BREADCRUMB_CAPACITY)
    }
}

impl ErrorReporter for InMemoryErrorReporter {
    fn report(&self, err: &AppError, context: &ReportContext) {
        self.lock().reports.push((err.clone(), context.clone()));
    }

    fn add_breadcrumb(&self, breadcrumb: Breadcrumb) {
        let mut recorded = self.lock();
        if recorded.breadcrumbs.len() == self.breadcrumb_capacity {
            recorded.breadcrumbs.pop_front();
        }
        recorded.breadcrumbs.push_back(breadcrumb);
    }
}
