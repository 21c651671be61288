//! Process-scoped services around the data layer: error reporting,
//! analytics, host capabilities and render supervision.

pub mod analytics;
pub mod boundary;
pub mod capabilities;
pub mod context;
pub mod redaction;
pub mod reporter;

pub use analytics::{
    Analytics, AnalyticsError, AnalyticsEvent, AnalyticsSink, InMemoryAnalyticsSink,
    TracingAnalyticsSink,
};
pub use boundary::{BoundaryFallback, ErrorBoundary, Rendered};
pub use capabilities::{Capabilities, ConnectivityProbe, NetworkInfo, Platform};
pub use context::AppContext;
pub use redaction::{REDACTED, redact_json_value};
pub use reporter::{
    Breadcrumb, ErrorReporter, InMemoryErrorReporter, ReportContext, TracingErrorReporter,
};
