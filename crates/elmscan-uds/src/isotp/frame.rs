//! CAN frames as reported by the adapter, and ISO-TP protocol control information

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::ChannelError;

/// Largest data field of a classic CAN frame
pub const MAX_FRAME_DATA: usize = 8;

/// Highest 11-bit arbitration ID
pub const MAX_STANDARD_ID: u16 = 0x7FF;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Tester to vehicle
    Tx,
    /// Vehicle to tester
    Rx,
}

/// One CAN frame with an 11-bit arbitration ID
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    id: u16,
    data: Vec<u8>,
    direction: Direction,
}

impl Frame {
    /// Returns `None` when the ID is wider than 11 bits or the data does not fit a CAN frame.
    pub fn new(id: u16, data: &[u8], direction: Direction) -> Option<Self> {
        if id > MAX_STANDARD_ID || data.is_empty() || data.len() > MAX_FRAME_DATA {
            return None;
        }
        Some(Self {
            id,
            data: data.to_vec(),
            direction,
        })
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn pci(&self) -> Result<Pci, ChannelError> {
        Pci::parse(&self.data)
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03X}", self.id)?;
        for byte in &self.data {
            write!(f, " {:02X}", byte)?;
        }
        Ok(())
    }
}

/// Flow Control status (FS)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowStatus {
    ContinueToSend,
    Wait,
    Overflow,
}

impl FlowStatus {
    fn nibble(self) -> u8 {
        match self {
            Self::ContinueToSend => 0x0,
            Self::Wait => 0x1,
            Self::Overflow => 0x2,
        }
    }
}

/// Protocol control information carried in the first byte(s) of a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pci {
    Single { len: usize },
    First { len: usize },
    Consecutive { sequence: u8 },
    FlowControl {
        status: FlowStatus,
        block_size: u8,
        st_min: u8,
    },
}

impl Pci {
    pub fn parse(data: &[u8]) -> Result<Self, ChannelError> {
        let first = *data
            .first()
            .ok_or_else(|| ChannelError::InvalidFrame("empty frame".to_string()))?;

        match first >> 4 {
            0x0 => {
                let len = (first & 0x0F) as usize;
                let available = data.len() - 1;
                if len == 0 || len > 7 || len > available {
                    return Err(ChannelError::LengthMismatch {
                        declared: len,
                        received: available,
                    });
                }
                Ok(Self::Single { len })
            }
            0x1 => {
                if data.len() < 2 {
                    return Err(ChannelError::InvalidFrame(
                        "first frame without length byte".to_string(),
                    ));
                }
                let len = (((first & 0x0F) as usize) << 8) | data[1] as usize;
                // a message that fits a single frame must not be sent segmented
                if len <= 7 {
                    return Err(ChannelError::LengthMismatch {
                        declared: len,
                        received: data.len() - 2,
                    });
                }
                Ok(Self::First { len })
            }
            0x2 => Ok(Self::Consecutive {
                sequence: first & 0x0F,
            }),
            0x3 => {
                if data.len() < 3 {
                    return Err(ChannelError::InvalidFrame(
                        "flow control shorter than 3 bytes".to_string(),
                    ));
                }
                let status = match first & 0x0F {
                    0x0 => FlowStatus::ContinueToSend,
                    0x1 => FlowStatus::Wait,
                    0x2 => FlowStatus::Overflow,
                    other => {
                        return Err(ChannelError::FlowControlViolation(format!(
                            "invalid flow status 0x{:X}",
                            other
                        )))
                    }
                };
                Ok(Self::FlowControl {
                    status,
                    block_size: data[1],
                    st_min: data[2],
                })
            }
            other => Err(ChannelError::InvalidFrame(format!(
                "unknown PCI type 0x{:X}",
                other
            ))),
        }
    }
}

/// Build a Flow Control frame body
pub fn flow_control(status: FlowStatus, block_size: u8, st_min: u8) -> [u8; 3] {
    [0x30 | status.nibble(), block_size, st_min]
}

/// Decode an STmin byte.
///
/// 0x00-0x7F are milliseconds, 0xF1-0xF9 are 100-900 microseconds, and every
/// reserved value is read as the longest legal gap (127 ms).
pub fn st_min_duration(raw: u8) -> Duration {
    match raw {
        0x00..=0x7F => Duration::from_millis(raw as u64),
        0xF1..=0xF9 => Duration::from_micros((raw - 0xF0) as u64 * 100),
        _ => Duration::from_millis(0x7F),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_st_min_decoding() {
        assert_eq!(st_min_duration(0x00), Duration::ZERO);
        assert_eq!(st_min_duration(0x0A), Duration::from_millis(10));
        assert_eq!(st_min_duration(0x7F), Duration::from_millis(127));
        assert_eq!(st_min_duration(0xF1), Duration::from_micros(100));
        assert_eq!(st_min_duration(0xF9), Duration::from_micros(900));
        // reserved
        assert_eq!(st_min_duration(0x80), Duration::from_millis(127));
        assert_eq!(st_min_duration(0xF0), Duration::from_millis(127));
        assert_eq!(st_min_duration(0xFA), Duration::from_millis(127));
    }

    #[test]
    fn test_pci_parse() {
        assert_eq!(
            Pci::parse(&[0x03, 0x62, 0x01, 0x00]).unwrap(),
            Pci::Single { len: 3 }
        );
        assert_eq!(
            Pci::parse(&[0x10, 0x14, 0x62, 0xF1, 0x90, 0x31, 0x32, 0x33]).unwrap(),
            Pci::First { len: 20 }
        );
        assert_eq!(
            Pci::parse(&[0x2F, 0x00]).unwrap(),
            Pci::Consecutive { sequence: 0xF }
        );
        assert_eq!(
            Pci::parse(&[0x30, 0x02, 0x0A]).unwrap(),
            Pci::FlowControl {
                status: FlowStatus::ContinueToSend,
                block_size: 2,
                st_min: 10
            }
        );
    }

    #[test]
    fn test_pci_rejects_bad_lengths() {
        assert!(matches!(
            Pci::parse(&[0x00, 0x11]),
            Err(ChannelError::LengthMismatch { declared: 0, .. })
        ));
        assert!(matches!(
            Pci::parse(&[0x05, 0x62, 0x01]),
            Err(ChannelError::LengthMismatch {
                declared: 5,
                received: 2
            })
        ));
        assert!(matches!(
            Pci::parse(&[0x10, 0x00, 0x62]),
            Err(ChannelError::LengthMismatch { declared: 0, .. })
        ));
    }

    #[test]
    fn test_invalid_flow_status() {
        assert!(matches!(
            Pci::parse(&[0x35, 0x00, 0x00]),
            Err(ChannelError::FlowControlViolation(_))
        ));
    }

    #[test]
    fn test_frame_limits() {
        assert!(Frame::new(0x7E8, &[0x01, 0x02], Direction::Rx).is_some());
        assert!(Frame::new(0x800, &[0x01], Direction::Rx).is_none());
        assert!(Frame::new(0x7E8, &[0u8; 9], Direction::Rx).is_none());
        assert!(Frame::new(0x7E8, &[], Direction::Rx).is_none());

        let frame = Frame::new(0x7E8, &[0x03, 0x62, 0x01, 0x00], Direction::Rx).unwrap();
        assert_eq!(frame.to_string(), "7E8 03 62 01 00");
    }
}
