use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Exclusive upper bound of the environment id space (48 bits).
pub const ENV_ID_SPACE: u64 = 1 << 48;

/// Width of a rendered environment id in hex digits.
pub const ENV_ID_LEN: usize = 12;

/// Identifies one environment's channel namespace on the bus.
///
/// Generated ids are 12 lowercase hex digits, zero-padded. Ids parsed off
/// the wire are kept verbatim since other workers may render them differently.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvId(String);

impl EnvId {
    /// Draw a fresh id from `rng`. Collisions are not detected.
    pub fn generate<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self::from_value(rng.gen_range(0..ENV_ID_SPACE))
    }

    /// Render a 48-bit value. Bits above the id space are discarded.
    pub fn from_value(value: u64) -> Self {
        Self(format!("{:012x}", value & (ENV_ID_SPACE - 1)))
    }

    pub fn from_raw(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Numeric value, if the id is well-formed hex.
    pub fn value(&self) -> Option<u64> {
        u64::from_str_radix(&self.0, 16).ok()
    }
}

impl fmt::Display for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for EnvId {
    type Err = std::convert::Infallible;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.to_owned()))
    }
}

impl AsRef<str> for EnvId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
