mod cmd;
mod exit;
mod logging;
mod output;

use clap::Parser;

use crate::cmd::{Command, ServeArgs};
use crate::logging::{init_logging, LogFormat, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "serialmux",
    version,
    about = "Serial port multiplexer for browser native messaging",
    args_conflicts_with_subcommands = true
)]
struct Cli {
    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", default_value = "text", global = true, env = "SERIALMUX_LOG_FORMAT")]
    log_format: LogFormat,

    /// Minimum log level (stderr).
    #[arg(long, value_name = "LEVEL", default_value = "warn", global = true, env = "SERIALMUX_LOG_LEVEL")]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Option<Command>,

    /// Serve options, used when no subcommand is given.
    #[command(flatten)]
    serve: ServeArgs,
}

impl Cli {
    fn into_command(self) -> Command {
        self.command.unwrap_or(Command::Serve(self.serve))
    }
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_level);

    match cmd::run(cli.into_command()) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serialmux_host::DataEncoding;

    use super::*;

    #[test]
    fn serves_by_default() {
        let cli = Cli::try_parse_from(["serialmux"]).expect("bare invocation should parse");
        let Command::Serve(args) = cli.into_command() else {
            panic!("expected serve");
        };
        let config = args.host_config();
        assert_eq!(config.default_baud_rate, 9600);
        assert_eq!(config.data_encoding, DataEncoding::Base64);
        assert!(config.debug_events);
    }

    #[test]
    fn tolerates_browser_launch_arguments() {
        let cli = Cli::try_parse_from([
            "serialmux",
            "chrome-extension://abcdefghijklmnop/",
            "--parent-window=0",
        ])
        .expect("browser arguments should parse");
        let Command::Serve(args) = cli.into_command() else {
            panic!("expected serve");
        };
        assert_eq!(args.origin, vec!["chrome-extension://abcdefghijklmnop/"]);
        assert_eq!(args.parent_window.as_deref(), Some("0"));

        let cli = Cli::try_parse_from(["serialmux", "/path/to/manifest.json", "serial@example.org"])
            .expect("firefox arguments should parse");
        assert!(matches!(cli.into_command(), Command::Serve(args) if args.origin.len() == 2));
    }

    #[test]
    fn parses_serve_tuning() {
        let cli = Cli::try_parse_from([
            "serialmux",
            "serve",
            "--default-baud",
            "115200",
            "--data-encoding",
            "array",
            "--read-poll",
            "20ms",
            "--no-debug-events",
        ])
        .expect("serve args should parse");
        let Command::Serve(args) = cli.into_command() else {
            panic!("expected serve");
        };
        let config = args.host_config();
        assert_eq!(config.default_baud_rate, 115_200);
        assert_eq!(config.data_encoding, DataEncoding::Array);
        assert_eq!(config.read_poll_interval, Duration::from_millis(20));
        assert!(!config.debug_events);
    }

    #[test]
    fn parses_list_subcommand() {
        let cli = Cli::try_parse_from(["serialmux", "list", "--format", "json"])
            .expect("list args should parse");
        assert!(matches!(cli.command, Some(Command::List(_))));
    }

    #[test]
    fn rejects_bad_duration() {
        let err = Cli::try_parse_from(["serialmux", "serve", "--read-poll", "soon"])
            .expect_err("invalid duration should fail");
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }
}
