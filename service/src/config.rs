use clap::builder::TypedValueParser as _;
use clap::Parser;
use dotenvy::dotenv;
use log::LevelFilter;
use std::time::Duration;

pub const DEFAULT_API_BASE_URL: &str = "http://localhost:8000/api/v1";

#[derive(Clone, Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Base URL of the ticket service API. Streams are served under `{base}/sse/{topic}`.
    #[arg(short = 'u', long, env, default_value = DEFAULT_API_BASE_URL)]
    api_base_url: String,

    /// Bearer token used to authenticate the event streams.
    #[arg(long, env, hide_env_values = true)]
    access_token: Option<String>,

    /// Maximum number of consecutive reconnect attempts per stream (0 = unlimited)
    #[arg(long, env, default_value_t = 0)]
    pub max_reconnect_attempts: u32,

    /// Delay in milliseconds before the first reconnect attempt; doubles on every attempt
    #[arg(long, env, default_value_t = 1000)]
    pub initial_reconnect_delay_ms: u64,

    /// Upper bound in milliseconds for the reconnect delay
    #[arg(long, env, default_value_t = 30000)]
    pub max_reconnect_delay_ms: u64,

    /// Milliseconds without any traffic after which a stream is considered dead
    #[arg(long, env, default_value_t = 45000)]
    pub heartbeat_timeout_ms: u64,

    /// Only print events concerning this ticket
    #[arg(short, long, env)]
    ticket_id: Option<String>,

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

    pub fn api_base_url(&self) -> &str {
        &self.api_base_url
    }

    pub fn access_token(&self) -> Option<String> {
        self.access_token.clone().filter(|token| !token.is_empty())
    }

    pub fn set_access_token(mut self, access_token: String) -> Self {
        self.access_token = Some(access_token);
        self
    }

    pub fn ticket_id(&self) -> Option<&str> {
        self.ticket_id.as_deref()
    }

    pub fn initial_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.initial_reconnect_delay_ms)
    }

    pub fn max_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.max_reconnect_delay_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }
}
