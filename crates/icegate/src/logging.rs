//! Logging setup.

use serde::Deserialize;
use tracing_subscriber::{fmt, EnvFilter};

/// Log settings from the `log:` block of the config file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogSettings {
    /// Default directive, overridable through `RUST_LOG`.
    #[serde(default = "default_level")]
    pub level: String,
    /// Emit JSON lines instead of the human format.
    #[serde(default)]
    pub json: bool,
    /// Include file and line information.
    #[serde(default)]
    pub file_info: bool,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
            file_info: false,
        }
    }
}

/// Install the global subscriber. Call once, before anything logs.
pub fn init(settings: &LogSettings) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.level.clone()));

    let builder = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_file(settings.file_info)
        .with_line_number(settings.file_info);

    if settings.json {
        builder.json().init();
    } else {
        builder.init();
    }
}
