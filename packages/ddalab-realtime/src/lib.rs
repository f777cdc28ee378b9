//! DDALAB realtime analyzer
//!
//! Consumes compressed EEG telemetry frames from the message bus, keeps a
//! rolling buffer and channel quality classification per device, and runs
//! registered analysis applications over the trailing window on a fixed
//! interval.

pub mod applications;
pub mod bus;
pub mod cli;
pub mod config;
pub mod host;
pub mod state;
pub mod telemetry;

pub use config::{ConfigError, RealtimeConfig};
pub use host::{
    AnalysisResult, ApplicationSummary, HealthReport, RealtimeApplication, RealtimeHost,
};
pub use state::{DeviceProfile, DeviceSnapshot, DeviceStateStore};
pub use telemetry::{decode_frame, ChannelType, FrameEncoder, RawFrame};
