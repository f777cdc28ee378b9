// Message header decoding
//
// Publishers attach device metadata as message headers. Numeric fields arrive
// with whatever type the publisher's client library picked (integers, floats,
// decimals or numeric strings), so every value is normalized to f64 here.

use serde::Serialize;
use std::collections::HashMap;
use thiserror::Error;

pub const DEVICE_ID_HEADER: &str = "user_id";
pub const SAMPLING_RATE_HEADER: &str = "sampling_rate";
pub const SCALE_FACTOR_HEADER: &str = "lsb_to_volts";
pub const SCALE_FACTOR_TEXT_HEADER: &str = "lsb_to_volts_str";

/// Transport-neutral header value
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    /// `value / 10^scale`
    Decimal { scale: u8, value: i64 },
    Text(String),
    Bytes(Vec<u8>),
    /// Tables, arrays, timestamps and anything else without a scalar reading
    Unsupported,
}

impl HeaderValue {
    /// Numeric reading of the value; booleans, bytes and unparseable text yield `None`
    pub fn as_f64(&self) -> Option<f64> {
        let value = match self {
            HeaderValue::Int(v) => *v as f64,
            HeaderValue::UInt(v) => *v as f64,
            HeaderValue::Float(v) => *v,
            HeaderValue::Decimal { scale, value } => *value as f64 / 10f64.powi(i32::from(*scale)),
            HeaderValue::Text(text) => text.trim().parse::<f64>().ok()?,
            HeaderValue::Bool(_) | HeaderValue::Bytes(_) | HeaderValue::Unsupported => {
                return None
            }
        };
        value.is_finite().then_some(value)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::Text(text) => Some(text.as_str()),
            HeaderValue::Bytes(bytes) => std::str::from_utf8(bytes).ok(),
            _ => None,
        }
    }
}

/// First non-zero numeric candidate; 0.0 if only zeros parsed; `None` if nothing parsed
pub fn coerce_float(candidates: &[Option<&HeaderValue>]) -> Option<f64> {
    let mut zero_seen = false;
    for value in candidates.iter().flatten().filter_map(|v| v.as_f64()) {
        if value != 0.0 {
            return Some(value);
        }
        zero_seen = true;
    }
    zero_seen.then_some(0.0)
}

#[derive(Debug, Error, PartialEq)]
pub enum MetadataError {
    #[error("Missing user_id header")]
    MissingDeviceId,

    #[error("user_id header is not a non-empty string")]
    InvalidDeviceId,

    #[error("Missing or non-numeric sampling_rate header")]
    MissingSamplingRate,

    #[error("Sampling rate must be positive, got {0}")]
    InvalidSamplingRate(f64),

    #[error("Missing or unparseable lsb_to_volts header")]
    MissingScaleFactor,
}

/// Device metadata carried with every frame
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageMetadata {
    pub device_id: String,
    pub sampling_rate: f64,
    pub scale_factor: f64,
}

impl MessageMetadata {
    pub fn from_headers(headers: &HashMap<String, HeaderValue>) -> Result<Self, MetadataError> {
        let device_id = headers
            .get(DEVICE_ID_HEADER)
            .ok_or(MetadataError::MissingDeviceId)?
            .as_str()
            .filter(|id| !id.is_empty())
            .ok_or(MetadataError::InvalidDeviceId)?
            .to_string();

        let sampling_rate = coerce_float(&[headers.get(SAMPLING_RATE_HEADER)])
            .ok_or(MetadataError::MissingSamplingRate)?;
        if sampling_rate <= 0.0 {
            return Err(MetadataError::InvalidSamplingRate(sampling_rate));
        }

        let scale_factor = coerce_float(&[
            headers.get(SCALE_FACTOR_HEADER),
            headers.get(SCALE_FACTOR_TEXT_HEADER),
        ])
        .ok_or(MetadataError::MissingScaleFactor)?;

        Ok(Self {
            device_id,
            sampling_rate,
            scale_factor,
        })
    }
}
