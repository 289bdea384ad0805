use clap::error::ErrorKind;
use clap::Parser;
use std::time::Duration;

use crate::relay::RelayConfig;

/// Exit status for command-line usage errors (`EX_USAGE`)
pub const USAGE_EXIT: i32 = 64;

#[derive(Parser, Debug)]
#[command(name = "sockrelay")]
#[command(about = "Relay connections between TCP and Unix-domain sockets", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Address to listen on for new connections (a path containing '/' for a
    /// Unix socket, host:port otherwise)
    pub source: String,

    /// Address to connect to for every accepted connection
    pub destination: String,

    /// Close connections that stay silent in both directions this long (e.g. 30s, 5m)
    #[arg(long, value_parser = parse_idle_timeout)]
    pub idle_timeout: Option<Duration>,

    /// Grace period for open connections to close on shutdown
    #[arg(long, value_parser = humantime::parse_duration, default_value = "5s")]
    pub drain_timeout: Duration,

    /// Verbose output
    #[arg(long, short = 'v')]
    pub verbose: bool,
}

/// A zero idle timeout would close every connection as soon as it is relayed
fn parse_idle_timeout(s: &str) -> Result<Duration, String> {
    let timeout = humantime::parse_duration(s).map_err(|e| e.to_string())?;
    if timeout.is_zero() {
        return Err("idle timeout must be greater than zero".to_string());
    }
    Ok(timeout)
}

impl Cli {
    /// Parse the process arguments, exiting with `USAGE_EXIT` on bad usage
    pub fn parse_args() -> Self {
        match Self::try_parse() {
            Ok(cli) => cli,
            Err(err) => {
                let _ = err.print();
                match err.kind() {
                    ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => std::process::exit(0),
                    _ => std::process::exit(USAGE_EXIT),
                }
            }
        }
    }

    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            idle_timeout: self.idle_timeout,
            drain_timeout: self.drain_timeout,
        }
    }
}
