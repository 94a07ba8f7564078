use clap::Parser;

use infrastructure::constants::DEFAULT_CONFIG_PATH;
use infrastructure::logging::{LogFormat, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "lobby",
    about = "L4 load balancer control plane for Linux",
    version = env!("CARGO_PKG_VERSION"),
    disable_version_flag = true,
)]
pub struct Cli {
    /// Path to the YAML configuration file
    #[arg(short = 'c', long = "config", default_value = DEFAULT_CONFIG_PATH)]
    pub config: String,

    /// Verbosity: critical, warning, info, debug or verboseDebug
    #[arg(short = 'l', long = "log-level", default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    /// Log format: json or text
    #[arg(long = "log-format", default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Print version and exit
    #[arg(short = 'v', long = "version")]
    pub version: bool,
}

pub fn parse() -> Cli {
    Cli::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cli = Cli::parse_from(["lobby"]);
        assert_eq!(cli.config, DEFAULT_CONFIG_PATH);
        assert_eq!(cli.log_level, LogLevel::Info);
        assert_eq!(cli.log_format, LogFormat::Text);
        assert!(!cli.version);
    }

    #[test]
    fn flags_parse() {
        let cli = Cli::parse_from(["lobby", "-c", "/tmp/lb.yaml", "-l", "verboseDebug", "-v"]);
        assert_eq!(cli.config, "/tmp/lb.yaml");
        assert_eq!(cli.log_level, LogLevel::VerboseDebug);
        assert!(cli.version);
    }

    #[test]
    fn log_level_is_case_insensitive() {
        let cli = Cli::parse_from(["lobby", "-l", "WARNING"]);
        assert_eq!(cli.log_level, LogLevel::Warning);
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
