use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Largest observation edge length a master will decode.
pub const MAX_OBS_SIZE: usize = 4096;

/// Root settings object.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EnvbusSettings {
    pub bus: BusSettings,
    pub session: SessionSettings,
    pub master: MasterSettings,
    pub logging: LoggingSettings,
}

impl EnvbusSettings {
    /// Reject values the protocol cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.bus.address.trim().is_empty() {
            return Err(SettingsError::InvalidValue("bus address is empty".into()));
        }
        if self.bus.channel_prefix.is_empty() {
            return Err(SettingsError::InvalidValue("channel prefix is empty".into()));
        }
        if self.session.subscribe_timeout_ms == 0 || self.session.action_timeout_ms == 0 {
            return Err(SettingsError::InvalidValue("timeouts must be positive".into()));
        }
        if !(1..=MAX_OBS_SIZE).contains(&self.master.obs_size) {
            return Err(SettingsError::InvalidValue(format!(
                "obs size {} is outside 1..={MAX_OBS_SIZE}",
                self.master.obs_size
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BusSettings {
    pub address: String,
    pub channel_prefix: String,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            address: "redis://127.0.0.1:6379".into(),
            channel_prefix: "qwop-worker".into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionSettings {
    pub subscribe_timeout_ms: u64,
    pub action_timeout_ms: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            subscribe_timeout_ms: 10_000,
            action_timeout_ms: 300_000,
        }
    }
}

impl SessionSettings {
    pub fn subscribe_timeout(&self) -> Duration {
        Duration::from_millis(self.subscribe_timeout_ms)
    }

    pub fn action_timeout(&self) -> Duration {
        Duration::from_millis(self.action_timeout_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MasterSettings {
    /// Edge length of the square RGB observation in state frames.
    pub obs_size: usize,
}

impl Default for MasterSettings {
    fn default() -> Self {
        Self { obs_size: 84 }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_constants() {
        let s = EnvbusSettings::default();
        assert_eq!(s.session.subscribe_timeout(), Duration::from_secs(10));
        assert_eq!(s.session.action_timeout(), Duration::from_secs(300));
        assert_eq!(s.bus.channel_prefix, "qwop-worker");
        assert_eq!(s.master.obs_size, 84);
        s.validate().unwrap();
    }

    #[test]
    fn camel_case_keys() {
        let json = serde_json::to_value(EnvbusSettings::default()).unwrap();
        assert!(json["bus"]["channelPrefix"].is_string());
        assert!(json["session"]["actionTimeoutMs"].is_u64());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let s: EnvbusSettings = serde_json::from_str(r#"{"bus":{"address":"h:1"}}"#).unwrap();
        assert_eq!(s.bus.address, "h:1");
        assert_eq!(s.bus.channel_prefix, "qwop-worker");
    }

    #[test]
    fn validate_rejects_empty_prefix_and_zero_timeouts() {
        let mut s = EnvbusSettings::default();
        s.bus.channel_prefix.clear();
        assert!(s.validate().is_err());

        let mut s = EnvbusSettings::default();
        s.session.action_timeout_ms = 0;
        assert!(s.validate().is_err());
    }

    #[test]
    fn validate_bounds_obs_size() {
        let mut s = EnvbusSettings::default();
        s.master.obs_size = MAX_OBS_SIZE;
        s.validate().unwrap();

        s.master.obs_size = MAX_OBS_SIZE + 1;
        let err = s.validate().unwrap_err();
        assert!(err.to_string().contains("obs size 4097"), "got: {err}");

        s.master.obs_size = 0;
        assert!(s.validate().is_err());
    }
}
