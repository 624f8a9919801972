use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Subcommand};
use zmux_session::MuxConfig;
use zmux_transport::Endpoint;

use crate::exit::{io_error, transport_error, CliError, CliResult, DATA_INVALID, USAGE};
use crate::output::OutputFormat;

pub mod echo;
pub mod send;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Accept one connection and echo every channel back to its sender.
    Echo(EchoArgs),
    /// Open channels, send a payload on each and optionally read the echo.
    Send(SendArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, mux: &MuxArgs, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Echo(args) => echo::run(args, mux.resolve()?, format),
        Command::Send(args) => send::run(args, mux.resolve()?, format),
        Command::Version(args) => version::run(args),
    }
}

/// Multiplexer settings shared by every subcommand that opens a connection.
#[derive(Args, Debug, Default)]
pub struct MuxArgs {
    /// JSON file with multiplexer settings.
    #[arg(long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,
    /// Send buffer size in bytes (overrides the config file).
    #[arg(long, value_name = "BYTES", env = "ZMUX_SEND_BUFFER", global = true)]
    pub send_buffer: Option<usize>,
    /// Per-channel receive buffer size in bytes (overrides the config file).
    #[arg(long, value_name = "BYTES", env = "ZMUX_RECV_BUFFER", global = true)]
    pub recv_buffer: Option<usize>,
    /// Bound on channel open/accept handshakes (e.g. 5s, 500ms).
    #[arg(long, value_name = "DURATION", global = true)]
    pub handshake_timeout: Option<String>,
}

impl MuxArgs {
    /// Config file first, then flags and environment on top.
    pub fn resolve(&self) -> CliResult<MuxConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let raw = fs::read_to_string(path).map_err(|err| {
                    io_error(&format!("failed reading {}", path.display()), err)
                })?;
                serde_json::from_str::<MuxConfig>(&raw).map_err(|err| {
                    CliError::new(
                        DATA_INVALID,
                        format!("invalid config {}: {err}", path.display()),
                    )
                })?
            }
            None => MuxConfig::default(),
        };

        if let Some(size) = self.send_buffer {
            config.send_buffer_size = size;
        }
        if let Some(size) = self.recv_buffer {
            config.recv_buffer_size = size;
        }
        if let Some(timeout) = &self.handshake_timeout {
            let timeout = parse_duration(timeout)?;
            config.handshake_timeout_ms = Some(timeout.as_millis().try_into().unwrap_or(u64::MAX));
        }
        Ok(config.normalized())
    }
}

#[derive(Args, Debug)]
pub struct EchoArgs {
    /// Endpoint to listen on (unix:<path>, tcp:<host:port>, <host:port> or a path).
    pub endpoint: String,
    /// Stop accepting after this many channels and exit once they close.
    #[arg(long, value_name = "N")]
    pub max_channels: Option<usize>,
}

#[derive(Args, Debug)]
pub struct SendArgs {
    /// Endpoint to connect to.
    pub endpoint: String,
    /// Raw string payload.
    #[arg(long, conflicts_with = "file", required_unless_present = "file")]
    pub data: Option<String>,
    /// Read payload from file.
    #[arg(long, conflicts_with = "data")]
    pub file: Option<PathBuf>,
    /// Number of channels to open; the payload is sent on each.
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u16).range(1..))]
    pub channels: u16,
    /// Read the echoed payload back and print it.
    #[arg(long)]
    pub wait: bool,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

pub fn parse_endpoint(raw: &str) -> CliResult<Endpoint> {
    raw.parse::<Endpoint>()
        .map_err(|err| transport_error("invalid endpoint", err))
}

pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, millis) = if let Some(num) = input.strip_suffix("ms") {
        (num, true)
    } else if let Some(num) = input.strip_suffix('s') {
        (num, false)
    } else {
        (input, false)
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}
