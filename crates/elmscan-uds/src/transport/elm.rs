//! ELM327 text protocol
//!
//! With headers and spaces on and CAN auto-formatting off, every received
//! frame is printed as one line: a three digit arbitration ID followed by the
//! data bytes, e.g. `7E8 03 62 01 00`. Anything else on a line is either an
//! acknowledgement (`OK`), the reset banner, `NO DATA`, or an adapter status
//! line mapped to [`AdapterCondition`].

use std::fmt;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::isotp::{Direction, Frame, MAX_FRAME_DATA, MAX_STANDARD_ID};

/// AT command builders
pub mod at {
    use crate::address::Bus;
    use crate::config::AdapterOptions;

    pub const RESET: &str = "ATZ";
    pub const ECHO_OFF: &str = "ATE0";
    pub const LINEFEEDS_OFF: &str = "ATL0";
    pub const SPACES_ON: &str = "ATS1";
    pub const HEADERS_ON: &str = "ATH1";
    /// Raw frames; ISO-TP is handled on the host
    pub const AUTO_FORMAT_OFF: &str = "ATCAF0";

    /// User protocol B: 11-bit IDs, variable DLC, 500 kbit/s / 4 = 125 kbit/s
    pub const MS_CAN_PROTOCOL_B: &str = "ATPBC004";

    /// Commands that select a bus
    pub fn bus_selection(bus: Bus) -> Vec<String> {
        match bus {
            Bus::Hs => vec!["ATSP6".to_string()],
            Bus::Ms => vec![MS_CAN_PROTOCOL_B.to_string(), "ATSPB".to_string()],
        }
    }

    /// Print every frame that passes the receive filter until any character arrives
    pub const MONITOR_ALL: &str = "ATMA";

    /// ATST takes units of 4 ms, 4..=1020 ms
    pub fn listen_timeout_units(ms: u64) -> u8 {
        (ms / 4).clamp(1, 0xFF) as u8
    }

    pub fn listen_timeout(ms: u64) -> String {
        format!("ATST{:02X}", listen_timeout_units(ms))
    }

    pub fn header(request_id: u16) -> String {
        format!("ATSH{:03X}", request_id)
    }

    pub fn receive_address(response_id: u16) -> String {
        format!("ATCRA{:03X}", response_id)
    }

    /// Frame data as sent on the command line
    pub fn data(bytes: &[u8]) -> String {
        hex::encode_upper(bytes)
    }

    /// Everything after ATZ, each answered with OK
    pub fn init_sequence(options: &AdapterOptions) -> Vec<String> {
        let mut commands: Vec<String> = [
            ECHO_OFF,
            LINEFEEDS_OFF,
            SPACES_ON,
            HEADERS_ON,
            AUTO_FORMAT_OFF,
        ]
        .iter()
        .map(|c| c.to_string())
        .collect();
        commands.extend(bus_selection(options.bus));
        commands.push(listen_timeout(u64::from(options.listen_timeout_ms)));
        commands
    }

    /// True for commands handled by the adapter itself
    pub fn is_at_command(command: &str) -> bool {
        command
            .get(..2)
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case("AT"))
    }
}

/// Status lines the adapter prints instead of (or among) frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterCondition {
    CanError,
    BusError,
    BusBusy,
    BufferFull,
    DataError,
    ReceiveError,
    Stopped,
    UnableToConnect,
    LowVoltageReset,
    /// `?`: the adapter did not understand the command
    UnknownCommand,
    /// `ERRxx` internal error codes
    Internal(u8),
}

impl AdapterCondition {
    pub fn from_line(line: &str) -> Option<Self> {
        let line = line.trim();
        let condition = match line {
            "CAN ERROR" => Self::CanError,
            "BUS ERROR" => Self::BusError,
            "BUS BUSY" => Self::BusBusy,
            "BUFFER FULL" => Self::BufferFull,
            "STOPPED" => Self::Stopped,
            "UNABLE TO CONNECT" => Self::UnableToConnect,
            "LV RESET" => Self::LowVoltageReset,
            "?" => Self::UnknownCommand,
            _ if line.ends_with("DATA ERROR") => Self::DataError,
            _ if line.ends_with("<RX ERROR") => Self::ReceiveError,
            _ => {
                let code = line.strip_prefix("ERR")?;
                Self::Internal(code.parse().ok()?)
            }
        };
        Some(condition)
    }
}

impl fmt::Display for AdapterCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CanError => write!(f, "CAN ERROR"),
            Self::BusError => write!(f, "BUS ERROR"),
            Self::BusBusy => write!(f, "BUS BUSY"),
            Self::BufferFull => write!(f, "BUFFER FULL"),
            Self::DataError => write!(f, "DATA ERROR"),
            Self::ReceiveError => write!(f, "RX ERROR"),
            Self::Stopped => write!(f, "STOPPED"),
            Self::UnableToConnect => write!(f, "UNABLE TO CONNECT"),
            Self::LowVoltageReset => write!(f, "LV RESET"),
            Self::UnknownCommand => write!(f, "?"),
            Self::Internal(code) => write!(f, "ERR{:02}", code),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameParseError {
    #[error("Invalid arbitration ID in '{0}'")]
    InvalidHeader(String),

    #[error("Invalid data bytes in '{0}'")]
    InvalidData(String),

    #[error("No data bytes in '{0}'")]
    Empty(String),

    #[error("'{line}' carries {len} data bytes")]
    TooLong { line: String, len: usize },
}

const NO_DATA: &str = "NO DATA";
const OK: &str = "OK";
const STOPPED: &str = "STOPPED";

/// Lines printed by the adapter in reply to one command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub command: String,
    pub lines: Vec<String>,
    pub received_at: DateTime<Utc>,
}

impl RawResponse {
    /// Split raw adapter output into lines, dropping the prompt, blank lines
    /// and a command echo.
    pub fn from_text(command: &str, text: &str) -> Self {
        let lines = text
            .split(|c: char| c == '\r' || c == '\n')
            .map(|line| line.trim_matches(|c: char| c == '>' || c == '\0' || c.is_whitespace()))
            .filter(|line| !line.is_empty() && *line != command)
            .map(str::to_string)
            .collect();

        Self {
            command: command.to_string(),
            lines,
            received_at: Utc::now(),
        }
    }

    pub fn text(&self) -> String {
        self.lines.join(" | ")
    }

    pub fn is_ok(&self) -> bool {
        self.lines.iter().any(|line| line == OK)
    }

    pub fn is_no_data(&self) -> bool {
        self.lines.iter().any(|line| line == NO_DATA)
    }

    pub fn has_banner(&self) -> bool {
        self.lines.iter().any(|line| line.starts_with("ELM"))
    }

    /// First adapter status line, if any
    pub fn condition(&self) -> Option<AdapterCondition> {
        self.lines
            .iter()
            .find_map(|line| AdapterCondition::from_line(line))
    }

    /// The same reply with the `STOPPED` line that ends a monitor removed
    pub fn monitored(mut self) -> Self {
        self.lines.retain(|line| line != STOPPED);
        self
    }

    /// Tokenize every frame line
    pub fn frames(&self) -> Result<Vec<Frame>, FrameParseError> {
        parse_frames(&self.lines)
    }
}

fn is_frame_line(line: &str) -> bool {
    line != NO_DATA
        && line != OK
        && !line.starts_with("ELM")
        && !line.starts_with("SEARCHING")
        && AdapterCondition::from_line(line).is_none()
}

/// Tokenize frame lines, skipping acknowledgements and status lines
pub fn parse_frames<S: AsRef<str>>(lines: &[S]) -> Result<Vec<Frame>, FrameParseError> {
    lines
        .iter()
        .map(AsRef::as_ref)
        .filter(|line| is_frame_line(line))
        .map(parse_frame_line)
        .collect()
}

/// Parse one `IDH B0 B1 ..` line. Lines printed with spaces off
/// (`7E80362F190`) are accepted too.
pub fn parse_frame_line(line: &str) -> Result<Frame, FrameParseError> {
    let line = line.trim();
    if !line.is_ascii() {
        return Err(FrameParseError::InvalidData(line.to_string()));
    }

    let (header, body) = if line.contains(' ') {
        let mut tokens = line.split_whitespace();
        let header = tokens.next().unwrap_or_default();
        let mut body = String::new();
        for token in tokens {
            if token.len() != 2 {
                return Err(FrameParseError::InvalidData(line.to_string()));
            }
            body.push_str(token);
        }
        (header, body)
    } else {
        if line.len() < 3 {
            return Err(FrameParseError::InvalidHeader(line.to_string()));
        }
        let (header, body) = line.split_at(3);
        (header, body.to_string())
    };

    if header.len() != 3 {
        return Err(FrameParseError::InvalidHeader(line.to_string()));
    }
    let id = u16::from_str_radix(header, 16)
        .ok()
        .filter(|id| *id <= MAX_STANDARD_ID)
        .ok_or_else(|| FrameParseError::InvalidHeader(line.to_string()))?;

    let data = hex::decode(&body).map_err(|_| FrameParseError::InvalidData(line.to_string()))?;
    if data.is_empty() {
        return Err(FrameParseError::Empty(line.to_string()));
    }
    if data.len() > MAX_FRAME_DATA {
        return Err(FrameParseError::TooLong {
            line: line.to_string(),
            len: data.len(),
        });
    }

    Frame::new(id, &data, Direction::Rx).ok_or_else(|| FrameParseError::InvalidData(line.to_string()))
}
