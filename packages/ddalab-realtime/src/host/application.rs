// Capability interface for downstream real-time analysis applications

use crate::state::{DeviceProfile, DeviceSnapshot};
use ndarray::ArrayView2;
use serde::Serialize;
use std::sync::Arc;

/// Opaque per-(device, application) analysis payload
pub type AnalysisResult = serde_json::Value;

/// Registration order is dispatch order
pub type ApplicationSet = Arc<[Arc<dyn RealtimeApplication>]>;

/// A downstream analyzer driven by the analysis scheduler
///
/// `analyze` runs on the scheduler's blocking worker, sequentially per device
/// unless parallel device analysis is enabled. Returning `Ok(None)` leaves the
/// previous result for the device in place.
pub trait RealtimeApplication: Send + Sync {
    fn app_id(&self) -> &str;

    fn display_name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// `window` holds the trailing analysis window (samples, channels) of raw counts
    fn analyze(
        &self,
        device_id: &str,
        snapshot: &DeviceSnapshot,
        window: ArrayView2<'_, i16>,
    ) -> anyhow::Result<Option<AnalysisResult>>;

    /// Called once when the host registers the application
    fn on_registered(&self) {}

    fn before_analysis_cycle(&self) {}

    fn after_analysis_cycle(&self) {}

    /// Called under the state lock whenever a device gets a new profile
    fn on_profile_initialized(&self, _device_id: &str, _profile: &DeviceProfile) {}
}

/// Static metadata describing a registered application
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApplicationSummary {
    pub app_id: String,
    pub display_name: String,
    pub description: String,
}

impl ApplicationSummary {
    pub fn of(app: &dyn RealtimeApplication) -> Self {
        Self {
            app_id: app.app_id().to_string(),
            display_name: app.display_name().to_string(),
            description: app.description().to_string(),
        }
    }
}
