use clap::Parser;
use std::path::PathBuf;

/// telecast: live telemetry and log streaming gateway
#[derive(Parser, Debug)]
#[command(name = "telecast")]
#[command(version)]
#[command(
    about = "Cache container telemetry feeds and stream them to clients over WebSocket",
    long_about = "telecast subscribes to the telemetry feeds of each configured container,\nkeeps the latest value of every feed in memory, and streams feed updates and\nservice logs to clients over WebSocket.\n\nUsage:\n  telecast                              Start with telecast.toml in the current directory\n  telecast --config /etc/telecast.toml  Use a specific config file\n  telecast --port 8080                  Override the configured port"
)]
pub struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, env = "TELECAST_CONFIG", default_value = "telecast.toml")]
    pub config: PathBuf,

    /// Port to bind the HTTP server to (overrides the config file)
    #[arg(long, env = "TELECAST_PORT")]
    pub port: Option<u16>,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub log_json: bool,
}

impl Cli {
    /// Parse CLI arguments from the environment
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let cli = Cli::try_parse_from(["telecast"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("telecast.toml"));
        assert!(!cli.log_json);
    }

    #[test]
    fn test_override_config() {
        let cli = Cli::try_parse_from(["telecast", "--config", "/etc/telecast.toml"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("/etc/telecast.toml"));
    }

    #[test]
    fn test_override_port() {
        let cli = Cli::try_parse_from(["telecast", "--port", "8080"]).unwrap();
        assert_eq!(cli.port, Some(8080));
    }

    #[test]
    fn test_invalid_port_rejected() {
        let result = Cli::try_parse_from(["telecast", "--port", "99999"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_all_overrides() {
        let cli = Cli::try_parse_from([
            "telecast",
            "--config",
            "robot.toml",
            "--port",
            "9000",
            "--log-json",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("robot.toml"));
        assert_eq!(cli.port, Some(9000));
        assert!(cli.log_json);
    }

    #[test]
    fn test_version_flag() {
        let result = Cli::try_parse_from(["telecast", "--version"]);
        let err = result.unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayVersion);
        assert!(err.to_string().contains(env!("CARGO_PKG_VERSION")));
    }

    #[test]
    fn test_help_contains_flags() {
        let result = Cli::try_parse_from(["telecast", "--help"]);
        let err = result.unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayHelp);
        let help_text = err.to_string();
        assert!(help_text.contains("--config"), "help should contain --config");
        assert!(help_text.contains("--port"), "help should contain --port");
        assert!(
            help_text.contains("--log-json"),
            "help should contain --log-json"
        );
    }
}
