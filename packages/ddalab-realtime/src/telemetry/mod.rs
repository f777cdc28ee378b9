pub mod buffer;
pub mod frame;
pub mod quality;

pub use buffer::{BufferError, SampleRing};
pub use frame::{
    decode_frame, record_size, ChannelType, DecodeError, FrameEncoder, MotionSample, RawFrame,
    FRAME_VERSION,
};
pub use quality::{
    ChannelQualityMeta, ChannelQualityTracker, ChannelStatus, QualityReport, QualityThresholds,
    UNKNOWN_IMPEDANCE_CODE,
};
