//! ISO-TP (ISO 15765-2) over an AT-command adapter
//!
//! The adapter runs with CAN auto-formatting off, so segmentation, Flow
//! Control and reassembly all happen here. A half-duplex AT adapter only
//! reports frames in reply to a command, so every frame the channel writes
//! doubles as a listen window: frames that arrive beyond what the current
//! step needs are kept in an inbox for the next `receive`.

mod channel;
mod codec;
mod error;
mod frame;

pub use channel::IsoTpChannel;
pub use codec::{
    reassemble, segment, single_frame_payload, Reassembler, SegmentationPlan, SegmentedMessage,
    MAX_PAYLOAD, SINGLE_FRAME_MAX,
};
pub use error::{ChannelError, TimeoutKind};
pub use frame::{
    flow_control, st_min_duration, Direction, FlowStatus, Frame, Pci, MAX_FRAME_DATA,
    MAX_STANDARD_ID,
};
