use parking_lot::RwLock;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "envbus_session" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// Emit one JSON object per line instead of compact text.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("a global subscriber is already installed: {0}")]
    AlreadyInitialized(String),
    #[error("filter reload failed: {0}")]
    Reload(String),
}

/// Handle to the installed subscriber; keeps runtime level control.
pub struct TelemetryGuard {
    base_level: Level,
    level_filter: RwLock<Vec<(String, Level)>>,
    handle: reload::Handle<EnvFilter, Registry>,
}

impl TelemetryGuard {
    /// Change the log level for a specific module at runtime.
    pub fn set_module_level(&self, module: &str, level: Level) -> Result<(), TelemetryError> {
        let directives = {
            let mut levels = self.level_filter.write();
            if let Some(entry) = levels.iter_mut().find(|(m, _)| m == module) {
                entry.1 = level;
            } else {
                levels.push((module.to_string(), level));
            }
            filter_directives(self.base_level, &levels)
        };
        self.handle
            .reload(EnvFilter::new(directives))
            .map_err(|e| TelemetryError::Reload(e.to_string()))
    }

    /// Get current per-module log level overrides.
    pub fn module_levels(&self) -> Vec<(String, Level)> {
        self.level_filter.read().clone()
    }
}

/// Build an `EnvFilter` directive string such as `info,envbus_session=debug`.
pub fn filter_directives(base: Level, module_levels: &[(String, Level)]) -> String {
    let mut filter = base.to_string().to_lowercase();
    for (module, level) in module_levels {
        filter.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
    }
    filter
}

/// Install the global subscriber. Call once at startup.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    let directives = filter_directives(config.log_level, &config.module_levels);
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&directives));
    let (filter_layer, handle) = reload::Layer::new(env_filter);

    let registry = tracing_subscriber::registry().with(filter_layer);
    let installed = if config.json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_current_span(true),
            )
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().compact().with_target(true))
            .try_init()
    };
    installed.map_err(|e| TelemetryError::AlreadyInitialized(e.to_string()))?;

    Ok(TelemetryGuard {
        base_level: config.log_level,
        level_filter: RwLock::new(config.module_levels),
        handle,
    })
}

/// Parse a level name such as `debug` or `WARN`.
pub fn parse_level(name: &str) -> Option<Level> {
    name.trim().parse().ok()
}
