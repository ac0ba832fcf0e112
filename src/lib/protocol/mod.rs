mod driver;

pub use driver::{BusPirate, DriverConfig, DriverError, HandshakeConfig, SampleSink};

use std::fmt::Display;
use thiserror::Error;

/// Scratch buffer size for handshake text.
pub const MAX_READ_LEN: usize = 128;

/// ADC answers are one big-endian 16-bit word.
pub const ADC_RESPONSE_LEN: usize = 2;

/// Console line feed, answered with a prompt when the device sits in its
/// text console.
pub const CONSOLE_PROBE: &[u8] = b"\n";

/// Console command that reboots the device into a fresh console.
pub const CONSOLE_RESET: &[u8] = b"#\n";

/// Single-byte commands understood in binary mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    EnterBinary = 0x00,
    ToSpi = 0x01,
    ToI2c = 0x02,
    ToUart = 0x03,
    To1Wire = 0x04,
    ToRaw = 0x05,
    ResetToConsole = 0x0F,
    AdcSingleShot = 0x14,
    AdcContinuous = 0x15,
}

impl Command {
    pub fn byte(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceMode {
    Unknown,
    Ascii,
    BinaryBase,
    BinarySpi,
    BinaryI2c,
    BinaryUart,
    Binary1Wire,
    BinaryRaw,
}

impl DeviceMode {
    pub fn is_binary(self) -> bool {
        !matches!(self, DeviceMode::Unknown | DeviceMode::Ascii)
    }

    /// Command that switches binary base mode into this sub-mode.
    pub fn entry_command(self) -> Option<Command> {
        match self {
            DeviceMode::BinarySpi => Some(Command::ToSpi),
            DeviceMode::BinaryI2c => Some(Command::ToI2c),
            DeviceMode::BinaryUart => Some(Command::ToUart),
            DeviceMode::Binary1Wire => Some(Command::To1Wire),
            DeviceMode::BinaryRaw => Some(Command::ToRaw),
            _ => None,
        }
    }
}

impl Display for DeviceMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DeviceMode::Unknown => "unknown",
            DeviceMode::Ascii => "ascii",
            DeviceMode::BinaryBase => "binary",
            DeviceMode::BinarySpi => "SPI",
            DeviceMode::BinaryI2c => "i2c",
            DeviceMode::BinaryUart => "uart",
            DeviceMode::Binary1Wire => "1-wire",
            DeviceMode::BinaryRaw => "raw",
        };
        f.write_str(name)
    }
}

/// ADC request whose answer the reader is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingCommand {
    Idle,
    AdcSingleShot,
    AdcContinuous,
}

impl PendingCommand {
    pub fn response_len(self) -> Option<usize> {
        match self {
            PendingCommand::Idle => None,
            PendingCommand::AdcSingleShot | PendingCommand::AdcContinuous => Some(ADC_RESPONSE_LEN),
        }
    }

    pub fn command(self) -> Option<Command> {
        match self {
            PendingCommand::Idle => None,
            PendingCommand::AdcSingleShot => Some(Command::AdcSingleShot),
            PendingCommand::AdcContinuous => Some(Command::AdcContinuous),
        }
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum ProtocolError {
    #[error("unrecognized response {0:?}")]
    UnrecognizedToken(String),
}

/// Mode announcements, matched by prefix in this order.
const TOKENS: &[(&[u8], DeviceMode)] = &[
    (b"HiZ>", DeviceMode::Ascii),
    (b"BBIO1", DeviceMode::BinaryBase),
    (b"SPI1", DeviceMode::BinarySpi),
    (b"I2C1", DeviceMode::BinaryI2c),
    (b"ART1", DeviceMode::BinaryUart),
    (b"1W01", DeviceMode::Binary1Wire),
    (b"RAW1", DeviceMode::BinaryRaw),
];

/// Maps a text response to the mode it announces. Leading line breaks
/// left over from console echo are ignored.
pub fn classify_token(bytes: &[u8]) -> Result<DeviceMode, ProtocolError> {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let text = &bytes[start..];

    TOKENS
        .iter()
        .find(|(prefix, _)| text.starts_with(prefix))
        .map(|&(_, mode)| mode)
        .ok_or_else(|| ProtocolError::UnrecognizedToken(String::from_utf8_lossy(bytes).into_owned()))
}

/// One item decoded from a read.
#[derive(Debug, PartialEq)]
pub enum Decoded {
    Sample(u16),
    Mode(DeviceMode),
    Unrecognized(ProtocolError),
}

/// Device protocol state as seen by the reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkState {
    pub mode: DeviceMode,
    pub pending: PendingCommand,
    /// High byte of a sample whose low byte has not arrived yet.
    partial: Option<u8>,
}

impl Default for LinkState {
    fn default() -> Self {
        Self::new(DeviceMode::Unknown, PendingCommand::Idle)
    }
}

impl LinkState {
    pub fn new(mode: DeviceMode, pending: PendingCommand) -> Self {
        Self {
            mode,
            pending,
            partial: None,
        }
    }

    /// Replaces the outstanding request. A half-received sample of the old
    /// request is dropped.
    pub fn set_pending(&mut self, pending: PendingCommand) {
        self.pending = pending;
        self.partial = None;
    }

    /// How many bytes the next read should ask for.
    pub fn read_len(&self) -> usize {
        self.pending.response_len().unwrap_or(MAX_READ_LEN)
    }

    /// Decodes one read.
    ///
    /// While a request is pending the bytes are a stream of big-endian
    /// words: every complete word is a sample and an odd trailing byte is
    /// kept for the next read. A whole read that is a mode token (never
    /// exactly one word long) is still taken as a token, since ADC words
    /// never start with printable text.
    pub fn decode(&mut self, bytes: &[u8]) -> Vec<Decoded> {
        let mut out = Vec::new();

        let is_token = self.partial.is_none()
            && bytes.len() != ADC_RESPONSE_LEN
            && classify_token(bytes).is_ok();

        let rest = if self.pending != PendingCommand::Idle && !is_token {
            self.decode_words(bytes, &mut out)
        } else {
            bytes
        };

        if !rest.is_empty() {
            out.push(self.decode_token(rest));
        }
        out
    }

    fn decode_words<'a>(&mut self, mut bytes: &'a [u8], out: &mut Vec<Decoded>) -> &'a [u8] {
        while self.pending != PendingCommand::Idle {
            let hi = match self.partial.take() {
                Some(hi) => hi,
                None => match bytes.split_first() {
                    Some((&hi, tail)) => {
                        bytes = tail;
                        hi
                    }
                    None => break,
                },
            };
            let lo = match bytes.split_first() {
                Some((&lo, tail)) => {
                    bytes = tail;
                    lo
                }
                None => {
                    self.partial = Some(hi);
                    break;
                }
            };

            out.push(Decoded::Sample(u16::from_be_bytes([hi, lo])));
            if self.pending == PendingCommand::AdcSingleShot {
                self.pending = PendingCommand::Idle;
            }
        }
        bytes
    }

    fn decode_token(&mut self, bytes: &[u8]) -> Decoded {
        match classify_token(bytes) {
            Ok(mode) => {
                self.mode = mode;
                if mode == DeviceMode::Ascii {
                    // the console does not stream ADC words
                    self.set_pending(PendingCommand::Idle);
                }
                Decoded::Mode(mode)
            }
            Err(e) => Decoded::Unrecognized(e),
        }
    }
}
