pub mod profile;
pub mod store;

pub use profile::{DeviceProfile, DeviceSnapshot, UserState, SAMPLING_RATE_TOLERANCE};
pub use store::{DeviceStateStore, IngestOutcome, StateError};
