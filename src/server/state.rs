use std::sync::Arc;
use std::time::Instant;

use crate::metrics::ServiceMetrics;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub metrics: Arc<ServiceMetrics>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(metrics: Arc<ServiceMetrics>) -> Self {
        Self {
            metrics,
            started_at: Instant::now(),
        }
    }

    /// Seconds since the process started serving
    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
