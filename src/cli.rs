use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::Level;

use crate::{
    actions::{Action, Response},
    config::Config,
    error::Error,
    validation::{self, RuleSet},
};

/// The command line interface for serial monitor.
#[derive(Parser)]
#[command(author, version, about)]
pub struct Cli {
    /// Path to a configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Use an in-memory mock device instead of the serial ports
    #[arg(long, global = true)]
    pub mock: bool,

    /// How much to log to stdout. `RUST_LOG` takes precedence.
    #[arg(long, global = true, default_value_t = Level::INFO)]
    pub log_level: Level,

    /// Subcommands
    #[command(subcommand)]
    pub command: Commands,
}

/// Commands available in the command line interface.
#[derive(Subcommand)]
pub enum Commands {
    /// List the serial devices which may be connected to.
    List,

    /// Connect to a device and print what it says.
    /// Lines typed on stdin are written to the device.
    Monitor {
        /// The device path, e.g. `/dev/ttyUSB0` or `COM3`.
        port: String,

        /// Baud rate. Defaults to the configured default.
        #[arg(short, long)]
        baud: Option<u32>,
    },

    /// Validate build options from a file (.json, or .ron otherwise).
    Validate {
        /// The options file.
        options: PathBuf,

        /// Rules to validate against, instead of the configured rules.
        #[arg(short, long)]
        rules: Option<PathBuf>,
    },

    /// Serve the websocket API.
    Serve {
        /// Port to listen on. Defaults to the configured port.
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Examples for user convenience.
    #[command(subcommand)]
    Examples(Examples),
}

/// Helpful examples for users.
#[derive(Subcommand, Clone, Copy)]
pub enum Examples {
    /// Show an example of a configuration file's contents.
    Config,

    /// Show the default validation rules, as a rules file.
    Rules,

    /// Show an example options file (JSON), as used by `validate`.
    Options,

    /// Show an example JSON request of validating options.
    Validate,

    /// Show an example JSON request of connecting to a device.
    Connect,

    /// Show an example JSON request of writing a message.
    Write,

    /// Show an example JSON response of listed devices.
    Devices,

    /// Show an example JSON response of validation problems.
    Validated,

    /// Show an example JSON response (from server to user) of device output.
    Log,

    /// Show an example JSON response (from server to user) of a lifecycle event.
    Event,
}

fn pretty_json<T: serde::Serialize>(value: &T) -> Result<String, Error> {
    serde_json::to_string_pretty(value)
        .map_err(|e| Error::Internal(format!("Could not serialize example: {e}")))
}

fn response_json(response: Response) -> Result<String, Error> {
    let response: Result<_, Error> = Ok(response);
    pretty_json(&response)
}

/// Render the requested example.
pub fn example(example: Examples) -> Result<String, Error> {
    match example {
        Examples::Config => Config::example().serialize_pretty(),
        Examples::Rules => RuleSet::default().serialize_pretty(),
        Examples::Options => pretty_json(&validation::example_options()),
        Examples::Validate => pretty_json(&Action::example_validate()),
        Examples::Connect => pretty_json(&Action::example_connect()),
        Examples::Write => pretty_json(&Action::example_write()),
        Examples::Devices => response_json(Response::example_devices()),
        Examples::Validated => response_json(Response::example_validated()),
        Examples::Log => response_json(Response::example_log()),
        Examples::Event => response_json(Response::example_event()),
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parse_monitor() {
        let cli = Cli::parse_from(["serial-monitor", "--mock", "monitor", "/dev/ttyUSB0", "-b", "9600"]);

        assert!(cli.mock);
        assert!(matches!(
            cli.command,
            Commands::Monitor { port, baud: Some(9600) } if port == "/dev/ttyUSB0"
        ));
    }

    #[test]
    fn every_example_renders() {
        for e in [
            Examples::Config,
            Examples::Rules,
            Examples::Options,
            Examples::Validate,
            Examples::Connect,
            Examples::Write,
            Examples::Devices,
            Examples::Validated,
            Examples::Log,
            Examples::Event,
        ] {
            assert!(!example(e).unwrap().is_empty());
        }
    }

    #[test]
    fn options_example_parses_as_options() {
        let rendered = example(Examples::Options).unwrap();

        let options: Vec<validation::UserDefine> = serde_json::from_str(&rendered).unwrap();

        assert!(!options.is_empty());
    }
}
