use parking_lot::RwLock;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("invalid log filter {directives:?}: {detail}")]
    Filter { directives: String, detail: String },
    #[error("telemetry already initialized: {0}")]
    Init(String),
}

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "shardstore_store" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// One JSON object per event instead of human-readable lines.
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

impl TelemetryConfig {
    /// `EnvFilter` directives for this config, e.g. `info,shardstore_store=debug`.
    pub fn filter_directives(&self) -> String {
        directives(self.log_level, &self.module_levels)
    }
}

fn directives(base: Level, module_levels: &[(String, Level)]) -> String {
    let mut filter_str = base.to_string().to_lowercase();
    for (module, level) in module_levels {
        filter_str.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
    }
    filter_str
}

fn build_filter(directives: &str) -> Result<EnvFilter, TelemetryError> {
    EnvFilter::try_new(directives).map_err(|e| TelemetryError::Filter {
        directives: directives.to_string(),
        detail: e.to_string(),
    })
}

/// Keeps the runtime-adjustable log filter.
pub struct TelemetryGuard {
    handle: reload::Handle<EnvFilter, Registry>,
    log_level: Level,
    module_levels: RwLock<Vec<(String, Level)>>,
}

impl TelemetryGuard {
    /// Change the log level for a specific module at runtime.
    pub fn set_module_level(&self, module: &str, level: Level) -> Result<(), TelemetryError> {
        let mut levels = self.module_levels.write();
        if let Some(entry) = levels.iter_mut().find(|(m, _)| m == module) {
            entry.1 = level;
        } else {
            levels.push((module.to_string(), level));
        }
        let filter = build_filter(&directives(self.log_level, &levels))?;
        self.handle
            .reload(filter)
            .map_err(|e| TelemetryError::Init(e.to_string()))
    }

    /// Get current per-module log level overrides.
    pub fn module_levels(&self) -> Vec<(String, Level)> {
        self.module_levels.read().clone()
    }
}

/// Initialize the telemetry subsystem. Call once at startup.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => build_filter(&config.filter_directives())?,
    };
    let (filter_layer, handle) = reload::Layer::new(env_filter);

    let json_layer = config.json.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_writer(std::io::stderr)
    });
    let text_layer = (!config.json).then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_writer(std::io::stderr)
    });

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(json_layer)
        .with(text_layer)
        .try_init()
        .map_err(|e| TelemetryError::Init(e.to_string()))?;

    Ok(TelemetryGuard {
        handle,
        log_level: config.log_level,
        module_levels: RwLock::new(config.module_levels),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_directives() {
        assert_eq!(TelemetryConfig::default().filter_directives(), "info");
    }

    #[test]
    fn module_directives() {
        let config = TelemetryConfig {
            log_level: Level::WARN,
            module_levels: vec![
                ("shardstore_store".into(), Level::DEBUG),
                ("sqlx".into(), Level::ERROR),
            ],
            json: true,
        };
        assert_eq!(
            config.filter_directives(),
            "warn,shardstore_store=debug,sqlx=error"
        );
        assert!(build_filter(&config.filter_directives()).is_ok());
    }

    #[test]
    fn invalid_directives_are_rejected() {
        let err = build_filter("shardstore_store=loud").unwrap_err();
        assert!(matches!(err, TelemetryError::Filter { .. }));
    }
}
