use std::sync::Arc;

use crate::{
    analytics::{Analytics, AnalyticsSink},
    capabilities::{Capabilities, ConnectivityProbe},
    reporter::ErrorReporter,
};

/// Process-wide services, built once at startup and shared by `Arc`.
pub struct AppContext {
    reporter: Arc<dyn ErrorReporter>,
    analytics: Analytics,
    capabilities: Capabilities,
    connectivity: ConnectivityProbe,
}

impl AppContext {
    pub fn new(
        capabilities: Capabilities,
        reporter: Arc<dyn ErrorReporter>,
        analytics_sink: Arc<dyn AnalyticsSink>,
    ) -> Arc<Self> {
        let analytics = Analytics::new(analytics_sink, capabilities.platform);
        Arc::new(Self {
            reporter,
            analytics,
            capabilities,
            connectivity: ConnectivityProbe::default(),
        })
    }

    pub fn reporter(&self) -> Arc<dyn ErrorReporter> {
        Arc::clone(&self.reporter)
    }

    pub fn analytics(&self) -> &Analytics {
        &self.analytics
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn connectivity(&self) -> &ConnectivityProbe {
        &self.connectivity
    }
}
