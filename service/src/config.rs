use clap::builder::TypedValueParser as _;
use clap::Parser;
use dotenvy::dotenv;
use log::LevelFilter;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Default websocket endpoint of the HomeCon backend.
pub const DEFAULT_BACKEND_URL: &str = "ws://127.0.0.1:9099";

/// Largest text frame accepted from the backend (a full `state_list` of a
/// large installation fits comfortably).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

#[derive(Clone, Debug, PartialEq)]
pub enum RustEnv {
    Development,
    Production,
    Staging,
}

#[derive(Debug, PartialEq, Eq)]
pub struct RustEnvParseError;

impl FromStr for RustEnv {
    type Err = RustEnvParseError;
    fn from_str(level: &str) -> Result<RustEnv, Self::Err> {
        match level.to_lowercase().as_str() {
            "development" => Ok(RustEnv::Development),
            "production" => Ok(RustEnv::Production),
            "staging" => Ok(RustEnv::Staging),
            _ => Err(RustEnvParseError),
        }
    }
}

impl fmt::Display for RustEnv {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RustEnv::Development => write!(f, "development"),
            RustEnv::Production => write!(f, "production"),
            RustEnv::Staging => write!(f, "staging"),
        }
    }
}

#[derive(Clone, Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Websocket URL of the HomeCon backend.
    #[arg(short, long, env, default_value = DEFAULT_BACKEND_URL)]
    backend_url: String,

    /// Delay in milliseconds before the first reconnection attempt. Doubles on
    /// every failed attempt.
    #[arg(long, env, default_value_t = 500)]
    pub reconnect_base_delay_ms: u64,

    /// Ceiling in milliseconds for the reconnection backoff. Attempts continue
    /// indefinitely at this interval.
    #[arg(long, env, default_value_t = 30_000)]
    pub reconnect_max_delay_ms: u64,

    /// Seconds of inbound silence before a keepalive ping is sent (0 disables keepalive).
    #[arg(long, env, default_value_t = 30)]
    pub keepalive_interval_secs: u64,

    /// Seconds to wait for any frame after a keepalive ping before the
    /// connection is considered dropped.
    #[arg(long, env, default_value_t = 10)]
    pub pong_timeout_secs: u64,

    /// Timeout in seconds for establishing the websocket connection.
    #[arg(long, env, default_value_t = 10)]
    pub connect_timeout_secs: u64,

    /// Timeout in seconds for a one-shot fetch to receive its first value.
    #[arg(long, env, default_value_t = 5)]
    pub fetch_timeout_secs: u64,

    /// Largest inbound text frame in bytes; larger frames are skipped.
    #[arg(long, env, default_value_t = DEFAULT_MAX_FRAME_BYTES)]
    pub max_frame_bytes: usize,

    /// Apply written values to the local cache before the backend confirms them.
    #[arg(long, env, default_value_t = false)]
    pub optimistic_writes: bool,

    /// Identities to watch on start, as `event` or `event:key` (e.g. `state_list,state:7`).
    #[arg(
        short,
        long,
        env,
        value_delimiter = ',',
        use_value_delimiter = true,
        default_value = "state_list"
    )]
    pub watch: Vec<String>,

    /// Set the log level verbosity threshold (level) to control what gets displayed on console output
    #[arg(
        short,
        long,
        env,
        default_value_t = LevelFilter::Info,
        value_parser = clap::builder::PossibleValuesParser::new(["OFF", "ERROR", "WARN", "INFO", "DEBUG", "TRACE"])
            .map(|s| s.parse::<LevelFilter>().unwrap()),
        )]
    pub log_level_filter: LevelFilter,

    /// Set the Rust runtime environment to use.
    #[arg(
    short,
    long,
    env,
    default_value_t = RustEnv::Development,
    value_parser = clap::builder::PossibleValuesParser::new([
        "DEVELOPMENT", "PRODUCTION", "STAGING",
        "development", "production", "staging"
    ])
        .map(|s| s.parse::<RustEnv>().unwrap()),
    )]
    pub runtime_env: RustEnv,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    pub fn new() -> Self {
        // Load .env file first
        dotenv().ok();
        // Then parse the command line parameters and flags
        Config::parse()
    }

    pub fn backend_url(&self) -> &str {
        &self.backend_url
    }

    pub fn set_backend_url(mut self, backend_url: String) -> Self {
        self.backend_url = backend_url;
        self
    }

    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }

    /// Returns `None` when keepalive is disabled.
    pub fn keepalive_interval(&self) -> Option<Duration> {
        (self.keepalive_interval_secs > 0).then(|| Duration::from_secs(self.keepalive_interval_secs))
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_secs(self.pong_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn runtime_env(&self) -> RustEnv {
        self.runtime_env.clone()
    }

    pub fn is_production(&self) -> bool {
        self.runtime_env() == RustEnv::Production
    }
}
