use crate::ids::EnvId;

/// Builds channel names scoped to one deployment prefix.
///
/// Every name is a plain `:`-joined string:
/// `<prefix>:act:<env>`, `<prefix>:state:<env>` and the shared
/// `<prefix>:master-ready` broadcast.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Channels {
    prefix: String,
}

impl Channels {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Inbound actions for one environment.
    pub fn act(&self, env_id: &EnvId) -> String {
        format!("{}:act:{}", self.prefix, env_id)
    }

    /// Outbound state for one environment.
    pub fn state(&self, env_id: &EnvId) -> String {
        format!("{}:state:{}", self.prefix, env_id)
    }

    /// Broadcast announcing that a master has (re)started.
    pub fn master_ready(&self) -> String {
        format!("{}:master-ready", self.prefix)
    }

    /// Pattern matching the state channel of every environment.
    pub fn state_pattern(&self) -> String {
        format!("{}:state:*", self.prefix)
    }
}

/// Extract the environment id from a per-environment channel name
/// (its last `:`-separated segment).
pub fn env_id_from_channel(channel: &str) -> Option<EnvId> {
    channel
        .rsplit(':')
        .next()
        .filter(|s| !s.is_empty() && s.len() != channel.len())
        .map(EnvId::from_raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_names() {
        let channels = Channels::new("p");
        let env = EnvId::from_raw("abc123abc123");
        assert_eq!(channels.act(&env), "p:act:abc123abc123");
        assert_eq!(channels.master_ready(), "p:master-ready");
        assert_eq!(channels.state(&env), "p:state:abc123abc123");
        assert_eq!(channels.state_pattern(), "p:state:*");
    }

    #[test]
    fn prefix_may_contain_separators() {
        let channels = Channels::new("exp:7");
        let env = EnvId::from_value(1);
        assert_eq!(channels.act(&env), "exp:7:act:000000000001");
    }

    #[test]
    fn env_id_is_last_segment() {
        let id = env_id_from_channel("qwop-worker:state:00ff00ff00ff").unwrap();
        assert_eq!(id.as_str(), "00ff00ff00ff");
    }

    #[test]
    fn env_id_requires_separator_and_segment() {
        assert!(env_id_from_channel("nosep").is_none());
        assert!(env_id_from_channel("p:state:").is_none());
    }
}
