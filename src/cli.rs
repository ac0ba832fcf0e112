use clap::{Parser, Subcommand};
use lazy_static::lazy_static;
use regex::Regex;
use std::ops::Deref;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ResistanceError {
    #[error("invalid resistance '{0}'")]
    BadValue(String),
    #[error("resistance must be positive, got '{0}'")]
    NotPositive(String),
}

/// Shunt resistance in ohms, parsed from e.g. `0.1`, `100m`, `2.2k` or
/// `0.5ohm`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Resistance(f64);

impl Deref for Resistance {
    type Target = f64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl FromStr for Resistance {
    type Err = ResistanceError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        lazy_static! {
            static ref RE: Regex =
                Regex::new(r"^(\d+(?:\.\d*)?|\.\d+)\s*([mkM]?)\s*(?:ohms?|Ω|R)?$").unwrap();
        }

        let c = RE
            .captures(input.trim())
            .ok_or_else(|| ResistanceError::BadValue(input.to_string()))?;

        let value: f64 = c[1]
            .parse()
            .map_err(|_| ResistanceError::BadValue(input.to_string()))?;
        let scale = match &c[2] {
            "m" => 1e-3,
            "k" => 1e3,
            "M" => 1e6,
            _ => 1.0,
        };

        let ohms = value * scale;
        if ohms <= 0.0 {
            return Err(ResistanceError::NotPositive(input.to_string()));
        }
        Ok(Resistance(ohms))
    }
}

/// Longest accepted single-shot period, ms.
pub const MAX_TRIGGER_PERIOD_MS: u64 = 60 * 60 * 1000;

/// Longest accepted sample history, s.
pub const MAX_HISTORY_SECS: u64 = 24 * 3600;

fn parse_in_range(input: &str, min: u64, max: u64) -> Result<u64, String> {
    let value: u64 = input
        .parse()
        .map_err(|_| format!("'{}' is not a number", input))?;
    if value < min || value > max {
        return Err(format!("{} is outside {}..={}", value, min, max));
    }
    Ok(value)
}

fn parse_trigger_period(input: &str) -> Result<u64, String> {
    parse_in_range(input, 1, MAX_TRIGGER_PERIOD_MS)
}

fn parse_history_secs(input: &str) -> Result<u64, String> {
    parse_in_range(input, 1, MAX_HISTORY_SECS)
}

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Cli {
    /// Skip sanity checks
    #[clap(long, short)]
    pub force: bool,

    /// enable debug output
    #[clap(long, short)]
    pub debug: bool,

    /// UART device or 'auto'
    #[clap(long, short, default_value = "auto")]
    pub port: String,

    /// UART baud rate
    #[clap(long, short, default_value_t = 115200)]
    pub baudrate: u32,

    /// Use json-formatted output
    #[clap(long, short)]
    pub json: bool,

    /// Handshake attempt count
    #[clap(long, default_value_t = 40)]
    pub attempts: usize,

    /// Delay between handshake attempts, ms
    #[clap(long, default_value_t = 1000)]
    pub attempt_interval_ms: u64,

    /// Overall handshake timeout, s
    #[clap(long)]
    pub handshake_timeout_secs: Option<u64>,

    /// Give up on the device once it falls back to its console
    #[clap(long)]
    pub close_on_console: bool,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Enter binary mode and print the device mode
    Probe {
        /// Synchronize with the console and reboot it first
        #[clap(long)]
        reset: bool,
    },

    /// Measure current through a shunt resistor
    Measure {
        /// Shunt resistance, e.g. 0.1, 100m, 1k
        #[clap(long, short, default_value = "1")]
        shunt: Resistance,

        /// Samples per reading [default: one second worth]
        #[clap(long, short)]
        average: Option<usize>,

        /// Request single readings instead of streaming
        #[clap(long, short)]
        triggered: bool,

        /// Single-shot request period, ms
        #[clap(long, default_value_t = 500, parse(try_from_str = parse_trigger_period))]
        trigger_period_ms: u64,

        /// Sample history kept in memory, s
        #[clap(long, default_value_t = 3600, parse(try_from_str = parse_history_secs))]
        history_secs: u64,

        /// Print nothing until the first sample arrives
        #[clap(long)]
        skip_empty: bool,
    },
}
