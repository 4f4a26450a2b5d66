use crate::config::Config;
use log::{LevelFilter, SetLoggerError};
use simplelog::{ColorChoice, ConfigBuilder, TermLogger, TerminalMode};

/// Libraries under the SSE transport, each with the most verbose level at
/// which its records are still hidden. The stream client itself becomes
/// useful at Debug; the HTTP and TLS layers below it only at Trace.
const DEPENDENCY_VISIBILITY: &[(&str, LevelFilter)] = &[
    ("eventsource_client", LevelFilter::Info),
    ("hyper", LevelFilter::Debug),
    ("hyper_rustls", LevelFilter::Debug),
    ("hyper_timeout", LevelFilter::Debug),
    ("rustls", LevelFilter::Debug),
    ("mio", LevelFilter::Debug),
];

pub struct Logger;

impl Logger {
    /// Start the terminal logger at the configured level.
    ///
    /// Records go to stderr so the event feed on stdout stays clean when piped.
    pub fn init_logger(config: &Config) -> Result<(), SetLoggerError> {
        let level = config.log_level_filter;
        TermLogger::init(
            level,
            Self::build_log_config(level),
            TerminalMode::Stderr,
            ColorChoice::Auto,
        )
    }

    /// Dependencies whose records are suppressed at `level`.
    pub fn hidden_dependencies(level: LevelFilter) -> Vec<&'static str> {
        DEPENDENCY_VISIBILITY
            .iter()
            .filter(|(_, hidden_up_to)| level <= *hidden_up_to)
            .map(|(module, _)| *module)
            .collect()
    }

    fn build_log_config(level: LevelFilter) -> simplelog::Config {
        let mut builder = ConfigBuilder::new();
        builder.set_time_format_rfc3339();
        // Module paths tell the two topic drivers and the hub apart
        builder.set_target_level(LevelFilter::Debug);

        for module in Self::hidden_dependencies(level) {
            builder.add_filter_ignore_str(module);
        }

        builder.build()
    }
}
