//! CLI argument definitions for reqshield-daemon.
//!
//! Uses `clap` v4 derive macros to parse command-line arguments.

use std::path::PathBuf;

use clap::Parser;

/// reqshield request-scoped security analysis daemon.
///
/// Loads the detection ruleset, enables the security pipeline on the
/// server hooks and either replays a request transcript or waits for
/// a shutdown signal.
#[derive(Parser, Debug)]
#[command(name = "reqshield-daemon")]
#[command(version, about, long_about = None)]
pub struct DaemonCli {
    /// Path to reqshield.toml configuration file.
    #[arg(short, long, default_value = "/etc/reqshield/reqshield.toml")]
    pub config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    ///
    /// Takes precedence over the config file and environment variables.
    #[arg(long)]
    pub log_level: Option<String>,

    /// Override log format (json, pretty).
    ///
    /// Takes precedence over the config file and environment variables.
    #[arg(long)]
    pub log_format: Option<String>,

    /// Validate configuration file and ruleset, then exit.
    #[arg(long)]
    pub validate: bool,

    /// Replay a JSON-lines request transcript through the pipeline and exit.
    #[arg(long, value_name = "FILE")]
    pub replay: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cli = DaemonCli::parse_from(["reqshield-daemon"]);
        assert_eq!(cli.config, PathBuf::from("/etc/reqshield/reqshield.toml"));
        assert!(!cli.validate);
        assert!(cli.replay.is_none());
    }

    #[test]
    fn overrides_and_replay() {
        let cli = DaemonCli::parse_from([
            "reqshield-daemon",
            "-c",
            "local.toml",
            "--log-format",
            "pretty",
            "--replay",
            "traffic.jsonl",
        ]);
        assert_eq!(cli.config, PathBuf::from("local.toml"));
        assert_eq!(cli.log_format.as_deref(), Some("pretty"));
        assert_eq!(cli.replay, Some(PathBuf::from("traffic.jsonl")));
    }
}
