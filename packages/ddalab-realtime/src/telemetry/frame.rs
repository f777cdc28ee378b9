// Version 4 telemetry frame codec
//
// Layout (little-endian):
//   header      version:u8, channel_count:u8, reserved:[u8; 2]
//   descriptors channel_count x { name:[u8; 8] (NUL padded), type:u8, reserved:u8 }
//   records     repeated until the input is exhausted:
//               channel_count x i16 signal, 3 x i16 accel, 3 x i16 gyro,
//               channel_count x u8 impedance code
//
// A trailing partial record is discarded. Decoding never panics on malformed
// input; every failure is reported through `DecodeError`.

use byteorder::{ByteOrder, LittleEndian};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

/// The only frame version this decoder accepts
pub const FRAME_VERSION: u8 = 0x04;

/// version + channel_count + 2 reserved bytes
pub const FRAME_HEADER_SIZE: usize = 4;

/// 8-byte name + type code + reserved byte
pub const CHANNEL_DESCRIPTOR_SIZE: usize = 10;

const CHANNEL_NAME_SIZE: usize = 8;

/// Accelerometer (6 bytes) followed by gyroscope (6 bytes)
const MOTION_BLOCK_SIZE: usize = 12;

#[derive(Debug, Error, PartialEq)]
pub enum DecodeError {
    #[error("Payload is too short for header: {actual} bytes")]
    TruncatedHeader { actual: usize },

    #[error("Unsupported payload version: {0}")]
    UnsupportedVersion(u8),

    #[error("Payload is too short for channel descriptors. Expected: {expected}, Actual: {actual}")]
    TruncatedDescriptors { expected: usize, actual: usize },

    #[error("Channel {index} has a name that is not valid UTF-8")]
    InvalidChannelName { index: usize },

    #[error("Duplicate channel name in descriptors: {0}")]
    DuplicateChannel(String),
}

/// Semantic channel type carried in the descriptor type code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    /// Scalp EEG signal (code 0)
    Eeg,
    /// Muscle / EMG (code 1)
    Emg,
    /// Ocular / EOG (code 2)
    Eog,
    /// Trigger line (code 3)
    Stim,
    /// Anything else, including unknown codes (code 255)
    Misc,
}

impl ChannelType {
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => Self::Eeg,
            1 => Self::Emg,
            2 => Self::Eog,
            3 => Self::Stim,
            _ => Self::Misc,
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            Self::Eeg => 0,
            Self::Emg => 1,
            Self::Eog => 2,
            Self::Stim => 3,
            Self::Misc => 255,
        }
    }

    /// Channels of these types participate in quality statistics and analysis
    pub fn is_analysis_eligible(&self) -> bool {
        matches!(self, Self::Eeg | Self::Emg | Self::Eog)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Eeg => "eeg",
            Self::Emg => "emg",
            Self::Eog => "eog",
            Self::Stim => "stim",
            Self::Misc => "misc",
        }
    }
}

/// Raw accelerometer / gyroscope counts for one sample record
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MotionSample {
    pub accel: [i16; 3],
    pub gyro: [i16; 3],
}

/// One decoded frame
///
/// `signals` and `impedances` are shaped (samples, channels), oldest sample first.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    pub channel_names: Vec<String>,
    pub channel_types: Vec<ChannelType>,
    pub signals: Array2<i16>,
    pub impedances: Array2<u8>,
    pub motion: Vec<MotionSample>,
}

impl RawFrame {
    pub fn num_samples(&self) -> usize {
        self.signals.nrows()
    }

    pub fn num_channels(&self) -> usize {
        self.channel_names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.num_samples() == 0
    }
}

/// Size in bytes of one sample record for `num_channels` channels
pub fn record_size(num_channels: usize) -> usize {
    num_channels * 2 + MOTION_BLOCK_SIZE + num_channels
}

/// Decode a decompressed version 4 frame
pub fn decode_frame(data: &[u8]) -> Result<RawFrame, DecodeError> {
    if data.len() < FRAME_HEADER_SIZE {
        return Err(DecodeError::TruncatedHeader { actual: data.len() });
    }

    let version = data[0];
    if version != FRAME_VERSION {
        return Err(DecodeError::UnsupportedVersion(version));
    }

    let num_channels = data[1] as usize;
    let header_size = FRAME_HEADER_SIZE + num_channels * CHANNEL_DESCRIPTOR_SIZE;
    if data.len() < header_size {
        return Err(DecodeError::TruncatedDescriptors {
            expected: header_size,
            actual: data.len(),
        });
    }

    let mut channel_names = Vec::with_capacity(num_channels);
    let mut channel_types = Vec::with_capacity(num_channels);
    let mut seen = HashSet::with_capacity(num_channels);

    for (index, descriptor) in data[FRAME_HEADER_SIZE..header_size]
        .chunks_exact(CHANNEL_DESCRIPTOR_SIZE)
        .enumerate()
    {
        let name_bytes = &descriptor[..CHANNEL_NAME_SIZE];
        let name_len = name_bytes
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(CHANNEL_NAME_SIZE);
        let name = std::str::from_utf8(&name_bytes[..name_len])
            .map_err(|_| DecodeError::InvalidChannelName { index })?
            .to_string();

        if !seen.insert(name.clone()) {
            return Err(DecodeError::DuplicateChannel(name));
        }

        channel_names.push(name);
        channel_types.push(ChannelType::from_code(descriptor[CHANNEL_NAME_SIZE]));
    }

    let record_size = record_size(num_channels);
    let records = &data[header_size..];
    let num_samples = records.len() / record_size;

    let mut signals = Array2::<i16>::zeros((num_samples, num_channels));
    let mut impedances = Array2::<u8>::zeros((num_samples, num_channels));
    let mut motion = Vec::with_capacity(num_samples);

    // chunks_exact leaves the partial trailing record out
    for (row, record) in records.chunks_exact(record_size).enumerate() {
        let (signal_bytes, rest) = record.split_at(num_channels * 2);
        let (motion_bytes, impedance_bytes) = rest.split_at(MOTION_BLOCK_SIZE);

        for (col, value) in signal_bytes.chunks_exact(2).enumerate() {
            signals[[row, col]] = LittleEndian::read_i16(value);
        }

        let mut axes = [0i16; 6];
        LittleEndian::read_i16_into(motion_bytes, &mut axes);
        motion.push(MotionSample {
            accel: [axes[0], axes[1], axes[2]],
            gyro: [axes[3], axes[4], axes[5]],
        });

        for (col, &code) in impedance_bytes.iter().enumerate() {
            impedances[[row, col]] = code;
        }
    }

    Ok(RawFrame {
        channel_names,
        channel_types,
        signals,
        impedances,
        motion,
    })
}

/// Builds version 4 frames, for device simulators and tests
#[derive(Debug, Clone, Default)]
pub struct FrameEncoder {
    channels: Vec<(String, ChannelType)>,
    records: Vec<u8>,
}

impl FrameEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a channel descriptor. Names longer than 8 bytes are truncated.
    pub fn channel(mut self, name: &str, channel_type: ChannelType) -> Self {
        self.channels.push((name.to_string(), channel_type));
        self
    }

    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    /// Append one sample record; missing signal or impedance values are zero-filled
    pub fn sample(mut self, signals: &[i16], impedances: &[u8], motion: MotionSample) -> Self {
        let n = self.channels.len();
        let mut buf = [0u8; 2];
        for col in 0..n {
            LittleEndian::write_i16(&mut buf, signals.get(col).copied().unwrap_or(0));
            self.records.extend_from_slice(&buf);
        }
        for value in motion.accel.iter().chain(motion.gyro.iter()) {
            LittleEndian::write_i16(&mut buf, *value);
            self.records.extend_from_slice(&buf);
        }
        for col in 0..n {
            self.records.push(impedances.get(col).copied().unwrap_or(0));
        }
        self
    }

    /// Append raw bytes after the records, e.g. a partial record
    pub fn trailing_bytes(mut self, bytes: &[u8]) -> Self {
        self.records.extend_from_slice(bytes);
        self
    }

    pub fn encode(&self) -> Vec<u8> {
        let n = self.channels.len();
        let mut out =
            Vec::with_capacity(FRAME_HEADER_SIZE + n * CHANNEL_DESCRIPTOR_SIZE + self.records.len());
        out.push(FRAME_VERSION);
        out.push(n as u8);
        out.extend_from_slice(&[0, 0]);

        for (name, channel_type) in &self.channels {
            let mut name_field = [0u8; CHANNEL_NAME_SIZE];
            let bytes = name.as_bytes();
            let len = bytes.len().min(CHANNEL_NAME_SIZE);
            name_field[..len].copy_from_slice(&bytes[..len]);
            out.extend_from_slice(&name_field);
            out.push(channel_type.code());
            out.push(0);
        }

        out.extend_from_slice(&self.records);
        out
    }
}
