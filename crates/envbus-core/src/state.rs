use bytes::{BufMut, Bytes, BytesMut};

use crate::errors::CodecError;

/// Default observation edge length in pixels.
pub const DEFAULT_OBS_SIZE: usize = 84;

/// Largest accepted observation edge length.
pub const MAX_OBS_SIZE: usize = 4096;

/// The standard state payload published by workers.
///
/// Layout: `3 * obs_size^2` RGB bytes, one `done` byte (non-zero when the
/// episode just ended), then the reward as ASCII decimal text.
#[derive(Clone, Debug, PartialEq)]
pub struct StateFrame {
    pub pixels: Bytes,
    pub done: bool,
    pub reward: f64,
}

impl StateFrame {
    /// Number of observation bytes for a square RGB image.
    pub fn pixel_len(obs_size: usize) -> Result<usize, CodecError> {
        let out_of_range = CodecError::ObsSizeOutOfRange {
            obs_size,
            max: MAX_OBS_SIZE,
        };
        if obs_size == 0 || obs_size > MAX_OBS_SIZE {
            return Err(out_of_range);
        }
        obs_size
            .checked_mul(obs_size)
            .and_then(|n| n.checked_mul(3))
            .ok_or(out_of_range)
    }

    /// An all-black observation with zero reward.
    pub fn blank(obs_size: usize) -> Result<Self, CodecError> {
        Ok(Self {
            pixels: Bytes::from(vec![0u8; Self::pixel_len(obs_size)?]),
            done: false,
            reward: 0.0,
        })
    }

    pub fn encode(&self) -> Bytes {
        let reward = self.reward.to_string();
        let mut buf = BytesMut::with_capacity(self.pixels.len() + 1 + reward.len());
        buf.put_slice(&self.pixels);
        buf.put_u8(u8::from(self.done));
        buf.put_slice(reward.as_bytes());
        buf.freeze()
    }

    pub fn decode(data: &[u8], obs_size: usize) -> Result<Self, CodecError> {
        let pixel_len = Self::pixel_len(obs_size)?;
        let min = pixel_len + 2;
        if data.len() < min {
            return Err(CodecError::StateTooSmall {
                actual: data.len(),
                min,
            });
        }
        let tail = &data[pixel_len + 1..];
        let text = std::str::from_utf8(tail).map_err(|_| {
            CodecError::InvalidReward(String::from_utf8_lossy(tail).into_owned())
        })?;
        let reward = text
            .trim()
            .parse::<f64>()
            .map_err(|_| CodecError::InvalidReward(text.to_string()))?;
        Ok(Self {
            pixels: Bytes::copy_from_slice(&data[..pixel_len]),
            done: data[pixel_len] != 0,
            reward,
        })
    }
}
