use crate::config::{Config, RustEnv};
use log::{LevelFilter, SetLoggerError};
use simplelog::{self, ConfigBuilder};

/// Modules to filter out from logging when not in Trace mode.
/// The websocket stack logs every frame at debug level, which buries the
/// subscription lifecycle lines.
const FILTERED_MODULES: &[&str] = &["tokio_tungstenite", "tungstenite", "mio"];

pub struct Logger {}

impl Logger {
    /// Initializes the global logger with configuration based on the provided Config.
    ///
    /// When the log level is set to Trace, all logs including dependency logs are shown.
    /// For all other log levels, verbose dependency logs are filtered out.
    pub fn init_logger(config: &Config) {
        Self::try_init_logger(config).expect("Failed to start simplelog");
    }

    /// Same as [`Logger::init_logger`] but reports a logger that is already installed.
    pub fn try_init_logger(config: &Config) -> Result<(), SetLoggerError> {
        let log_level_filter = Self::convert_level_filter(config.log_level_filter);
        let apply_filters = Self::should_filter_dependencies(config.log_level_filter);
        let log_config = Self::build_log_config(apply_filters, &config.runtime_env());

        simplelog::TermLogger::init(
            log_level_filter,
            log_config,
            simplelog::TerminalMode::Mixed,
            Self::color_choice(&config.runtime_env()),
        )
    }

    fn convert_level_filter(level: LevelFilter) -> simplelog::LevelFilter {
        match level {
            LevelFilter::Off => simplelog::LevelFilter::Off,
            LevelFilter::Error => simplelog::LevelFilter::Error,
            LevelFilter::Warn => simplelog::LevelFilter::Warn,
            LevelFilter::Info => simplelog::LevelFilter::Info,
            LevelFilter::Debug => simplelog::LevelFilter::Debug,
            LevelFilter::Trace => simplelog::LevelFilter::Trace,
        }
    }

    /// Returns `false` for Trace level (show all logs), `true` for all other levels.
    fn should_filter_dependencies(level: LevelFilter) -> bool {
        level != LevelFilter::Trace
    }

    /// Production output usually lands in a journal, where escape codes are noise.
    fn color_choice(env: &RustEnv) -> simplelog::ColorChoice {
        match env {
            RustEnv::Production => simplelog::ColorChoice::Never,
            RustEnv::Development | RustEnv::Staging => simplelog::ColorChoice::Auto,
        }
    }

    /// Builds a simplelog Config with optional module filtering.
    ///
    /// Outside production the module path is printed so that transport and
    /// registry lines can be told apart.
    fn build_log_config(apply_filters: bool, env: &RustEnv) -> simplelog::Config {
        let mut builder = ConfigBuilder::new();
        builder.set_time_format_rfc3339();

        if *env != RustEnv::Production {
            builder.set_target_level(simplelog::LevelFilter::Error);
        }

        if apply_filters {
            for module in FILTERED_MODULES {
                builder.add_filter_ignore_str(module);
            }
        }

        builder.build()
    }
}
