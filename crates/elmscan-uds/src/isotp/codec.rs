//! Transport-free ISO-TP segmentation and reassembly

use super::frame::Pci;
use super::ChannelError;

/// Largest payload addressable by a 12-bit First Frame length
pub const MAX_PAYLOAD: usize = 4095;

/// Largest payload carried by a Single Frame
pub const SINGLE_FRAME_MAX: usize = 7;

const FIRST_FRAME_DATA: usize = 6;
const CONSECUTIVE_FRAME_DATA: usize = 7;
/// First Frames and every Consecutive Frame but the last fill the whole CAN frame
const FULL_FRAME: usize = 8;

/// How a message travelled on the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentationPlan {
    Single,
    Multi {
        consecutive_frames: usize,
        block_size: u8,
        st_min: u8,
    },
}

/// A reassembled ISO-TP payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentedMessage {
    pub payload: Vec<u8>,
    pub plan: SegmentationPlan,
}

impl SegmentedMessage {
    pub fn single(payload: Vec<u8>) -> Self {
        Self {
            payload,
            plan: SegmentationPlan::Single,
        }
    }
}

/// Split a payload into frame bodies (PCI included, unpadded).
///
/// Payloads of up to 7 bytes become one Single Frame; longer payloads become a
/// First Frame followed by Consecutive Frames numbered 1..15, 0, 1, ...
pub fn segment(payload: &[u8]) -> Result<Vec<Vec<u8>>, ChannelError> {
    let len = payload.len();
    if len == 0 {
        return Err(ChannelError::LengthMismatch {
            declared: 0,
            received: 0,
        });
    }
    if len > MAX_PAYLOAD {
        return Err(ChannelError::PayloadTooLarge(len));
    }

    if len <= SINGLE_FRAME_MAX {
        let mut frame = Vec::with_capacity(len + 1);
        frame.push(len as u8);
        frame.extend_from_slice(payload);
        return Ok(vec![frame]);
    }

    let rest = &payload[FIRST_FRAME_DATA..];
    let mut frames = Vec::with_capacity(1 + rest.len().div_ceil(CONSECUTIVE_FRAME_DATA));

    let mut first = Vec::with_capacity(8);
    first.push(0x10 | ((len >> 8) as u8 & 0x0F));
    first.push((len & 0xFF) as u8);
    first.extend_from_slice(&payload[..FIRST_FRAME_DATA]);
    frames.push(first);

    for (index, chunk) in rest.chunks(CONSECUTIVE_FRAME_DATA).enumerate() {
        let mut frame = Vec::with_capacity(chunk.len() + 1);
        frame.push(0x20 | ((index + 1) as u8 & 0x0F));
        frame.extend_from_slice(chunk);
        frames.push(frame);
    }

    Ok(frames)
}

/// Payload of a Single Frame, with any padding stripped
pub fn single_frame_payload(data: &[u8]) -> Result<Vec<u8>, ChannelError> {
    match Pci::parse(data)? {
        Pci::Single { len } => Ok(data[1..=len].to_vec()),
        other => Err(ChannelError::InvalidFrame(format!(
            "expected single frame, got {:?}",
            other
        ))),
    }
}

/// Receiving-side state machine for one segmented message
#[derive(Debug)]
pub struct Reassembler {
    declared: usize,
    buffer: Vec<u8>,
    next_sequence: u8,
    block_count: u8,
    frames: usize,
}

impl Reassembler {
    pub fn from_first_frame(data: &[u8]) -> Result<Self, ChannelError> {
        let declared = match Pci::parse(data)? {
            Pci::First { len } => len,
            other => {
                return Err(ChannelError::InvalidFrame(format!(
                    "expected first frame, got {:?}",
                    other
                )))
            }
        };
        if data.len() < FULL_FRAME {
            return Err(ChannelError::InvalidFrame(format!(
                "first frame carries {} bytes",
                data.len()
            )));
        }

        let mut buffer = Vec::with_capacity(declared);
        let body = &data[2..];
        buffer.extend_from_slice(&body[..body.len().min(declared)]);

        Ok(Self {
            declared,
            buffer,
            next_sequence: 1,
            block_count: 0,
            frames: 0,
        })
    }

    /// Feed one Consecutive Frame. Returns `true` once the declared length is reached.
    pub fn push(&mut self, data: &[u8]) -> Result<bool, ChannelError> {
        let sequence = match Pci::parse(data)? {
            Pci::Consecutive { sequence } => sequence,
            other => {
                return Err(ChannelError::InvalidFrame(format!(
                    "expected consecutive frame, got {:?}",
                    other
                )))
            }
        };

        if sequence != self.next_sequence {
            return Err(ChannelError::SequenceError {
                expected: self.next_sequence,
                got: sequence,
            });
        }
        let remaining = self.declared - self.buffer.len();
        let body = &data[1..];
        if body.len() < remaining.min(CONSECUTIVE_FRAME_DATA) {
            return Err(ChannelError::InvalidFrame(format!(
                "consecutive frame {:X} carries {} bytes with {} outstanding",
                sequence,
                data.len(),
                remaining
            )));
        }
        self.next_sequence = (self.next_sequence + 1) & 0x0F;
        self.block_count = self.block_count.wrapping_add(1);
        self.frames += 1;

        self.buffer
            .extend_from_slice(&body[..body.len().min(remaining)]);

        Ok(self.is_complete())
    }

    pub fn is_complete(&self) -> bool {
        self.buffer.len() >= self.declared
    }

    pub fn declared_len(&self) -> usize {
        self.declared
    }

    /// Consecutive frames received since the last Flow Control
    pub fn frames_in_block(&self) -> u8 {
        self.block_count
    }

    pub fn start_block(&mut self) {
        self.block_count = 0;
    }

    pub fn consecutive_frames(&self) -> usize {
        self.frames
    }

    pub fn finish(self) -> Result<Vec<u8>, ChannelError> {
        if self.buffer.len() != self.declared {
            return Err(ChannelError::LengthMismatch {
                declared: self.declared,
                received: self.buffer.len(),
            });
        }
        Ok(self.buffer)
    }
}

/// Reassemble a complete frame sequence in one go
pub fn reassemble(frames: &[Vec<u8>]) -> Result<Vec<u8>, ChannelError> {
    let (first, rest) = frames
        .split_first()
        .ok_or_else(|| ChannelError::InvalidFrame("no frames".to_string()))?;

    if let Ok(Pci::Single { .. }) = Pci::parse(first) {
        if !rest.is_empty() {
            return Err(ChannelError::InvalidFrame(
                "frames after a single frame".to_string(),
            ));
        }
        return single_frame_payload(first);
    }

    let mut reassembler = Reassembler::from_first_frame(first)?;
    for (index, frame) in rest.iter().enumerate() {
        if reassembler.push(frame)? && index + 1 != rest.len() {
            return Err(ChannelError::InvalidFrame(
                "frames after the declared length".to_string(),
            ));
        }
    }
    reassembler.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn test_single_frame_boundary() {
        let frames = segment(&[1, 2, 3, 4, 5, 6, 7]).unwrap();
        assert_eq!(frames, vec![vec![0x07, 1, 2, 3, 4, 5, 6, 7]]);

        let frames = segment(&[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], vec![0x10, 0x08, 1, 2, 3, 4, 5, 6]);
        assert_eq!(frames[1], vec![0x21, 7, 8]);
    }

    #[test]
    fn test_sequence_wraps_after_fifteen() {
        let payload: Vec<u8> = (0..200).map(|i| i as u8).collect();
        let frames = segment(&payload).unwrap();
        assert_eq!(frames[15][0], 0x2F);
        assert_eq!(frames[16][0], 0x20);
        assert_eq!(frames[17][0], 0x21);
    }

    #[test]
    fn test_segment_rejects_empty_and_oversized() {
        assert!(matches!(
            segment(&[]),
            Err(ChannelError::LengthMismatch { declared: 0, .. })
        ));
        assert!(matches!(
            segment(&vec![0u8; 4096]),
            Err(ChannelError::PayloadTooLarge(4096))
        ));
    }

    #[test]
    fn test_sequence_gap_discards_message() {
        let payload: Vec<u8> = (0..30).collect();
        let frames = segment(&payload).unwrap();

        let mut reassembler = Reassembler::from_first_frame(&frames[0]).unwrap();
        reassembler.push(&frames[1]).unwrap();
        // skip frames[2]
        let err = reassembler.push(&frames[3]).unwrap_err();
        assert!(matches!(
            err,
            ChannelError::SequenceError {
                expected: 2,
                got: 3
            }
        ));
    }

    #[test]
    fn test_padding_is_ignored() {
        let mut first = vec![0x10, 0x09, 1, 2, 3, 4, 5, 6];
        let mut last = vec![0x21, 7, 8, 9];
        last.resize(8, 0xAA);
        first.resize(8, 0xAA);
        assert_eq!(reassemble(&[first, last]).unwrap(), vec![1, 2, 3, 4, 5, 6, 7, 8, 9]);

        let mut single = vec![0x03, 0x62, 0x01, 0x00];
        single.resize(8, 0xCC);
        assert_eq!(single_frame_payload(&single).unwrap(), vec![0x62, 0x01, 0x00]);
    }

    #[test]
    fn test_truncated_message_is_length_mismatch() {
        let payload: Vec<u8> = (0..20).collect();
        let frames = segment(&payload).unwrap();
        let err = reassemble(&frames[..2]).unwrap_err();
        assert!(matches!(
            err,
            ChannelError::LengthMismatch {
                declared: 20,
                received: 13
            }
        ));
    }

    #[test]
    fn test_short_frames_mid_message_are_rejected() {
        let payload: Vec<u8> = (0..20).collect();
        let frames = segment(&payload).unwrap();

        let err = Reassembler::from_first_frame(&frames[0][..6]).unwrap_err();
        assert!(matches!(err, ChannelError::InvalidFrame(_)));

        let mut reassembler = Reassembler::from_first_frame(&frames[0]).unwrap();
        let err = reassembler.push(&frames[1][..5]).unwrap_err();
        assert!(matches!(err, ChannelError::InvalidFrame(_)));

        // the final frame may be short
        let mut reassembler = Reassembler::from_first_frame(&frames[0]).unwrap();
        assert!(!reassembler.push(&frames[1]).unwrap());
        assert!(reassembler.push(&frames[2]).unwrap());
        assert_eq!(reassembler.finish().unwrap(), payload);
    }

    proptest! {
        #[test]
        fn segmentation_round_trips(payload in proptest::collection::vec(any::<u8>(), 1..=MAX_PAYLOAD)) {
            let frames = segment(&payload).unwrap();
            prop_assert!(frames.iter().all(|f| f.len() <= 8));
            prop_assert_eq!(reassemble(&frames).unwrap(), payload);
        }
    }
}
