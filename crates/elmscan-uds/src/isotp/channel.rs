//! ISO-TP channel bound to one adapter

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::codec::{segment, Reassembler, SegmentationPlan, SegmentedMessage};
use super::frame::{flow_control, st_min_duration, FlowStatus, Frame, Pci, MAX_FRAME_DATA};
use super::{ChannelError, TimeoutKind};
use crate::address::{Bus, ModuleEndpoint};
use crate::config::{AdapterOptions, IsoTpConfig};
use crate::transport::{at, AdapterTransport, RawResponse, TransportError, WireRecord};

const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_millis(1000);
const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_millis(1000);
/// Host-side slack on top of the adapter's own listen window
const ADAPTER_MARGIN: Duration = Duration::from_millis(100);

/// Segmenting, flow-controlled message channel over an AT adapter
pub struct IsoTpChannel<T> {
    transport: T,
    config: IsoTpConfig,
    reply_timeout: Duration,
    command_timeout: Duration,
    bus: Option<Bus>,
    header: Option<u16>,
    filter: Option<u16>,
    response_id: Option<u16>,
    /// ATST currently in effect, in units of 4 ms
    listen_window: Option<u8>,
    inbox: VecDeque<Frame>,
}

impl<T: AdapterTransport> IsoTpChannel<T> {
    pub fn new(transport: T, config: IsoTpConfig) -> Self {
        Self {
            transport,
            config,
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            bus: None,
            header: None,
            filter: None,
            response_id: None,
            listen_window: None,
            inbox: VecDeque::new(),
        }
    }

    /// How long the frame completing a request waits for the first answer frame.
    ///
    /// The adapter's listen window follows this value on the next `send`.
    pub fn set_reply_timeout(&mut self, timeout: Duration) {
        self.reply_timeout = timeout;
    }

    pub fn reply_timeout(&self) -> Duration {
        self.reply_timeout
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WireRecord> {
        self.transport.subscribe()
    }

    /// Frames received but not yet claimed by `receive`
    pub fn pending_frames(&self) -> usize {
        self.inbox.len()
    }

    pub fn discard_pending(&mut self) {
        self.inbox.clear();
    }

    /// Re-run adapter initialization and forget all addressing state
    pub async fn reset(&mut self, options: &AdapterOptions) -> Result<(), ChannelError> {
        self.inbox.clear();
        self.header = None;
        self.filter = None;
        self.response_id = None;
        self.bus = None;

        self.listen_window = None;

        self.transport.configure(options).await?;
        self.bus = Some(options.bus);
        self.listen_window = Some(at::listen_timeout_units(u64::from(
            options.listen_timeout_ms,
        )));
        self.command_timeout = options.command_timeout();
        Ok(())
    }

    /// Longest the adapter keeps listening after a frame
    fn adapter_window(&self) -> Duration {
        self.listen_window
            .map_or(Duration::ZERO, |units| Duration::from_millis(u64::from(units) * 4))
    }

    /// Set ATST so the adapter listens as long as the reply timeout allows
    async fn apply_listen_window(&mut self) -> Result<(), ChannelError> {
        let ms = u64::try_from(self.reply_timeout.as_millis()).unwrap_or(u64::MAX);
        let units = at::listen_timeout_units(ms);
        if self.listen_window == Some(units) {
            return Ok(());
        }
        self.command(at::listen_timeout(ms)).await?;
        self.listen_window = Some(units);
        debug!(window_ms = u64::from(units) * 4, "Adapter listen window changed");
        Ok(())
    }

    async fn command(&mut self, command: String) -> Result<(), ChannelError> {
        let reply = self
            .transport
            .exchange(&command, self.command_timeout)
            .await?;
        if reply.is_ok() {
            Ok(())
        } else {
            Err(TransportError::NotAcknowledged {
                command,
                reply: reply.text(),
            }
            .into())
        }
    }

    /// Point the adapter at an endpoint, issuing only the AT commands that change something
    async fn address(&mut self, endpoint: &ModuleEndpoint) -> Result<(), ChannelError> {
        if self.bus != Some(endpoint.bus) {
            for command in at::bus_selection(endpoint.bus) {
                self.command(command).await?;
            }
            self.bus = Some(endpoint.bus);
            debug!(bus = %endpoint.bus, "Switched bus");
        }
        if self.header != Some(endpoint.request_id) {
            self.command(at::header(endpoint.request_id)).await?;
            self.header = Some(endpoint.request_id);
        }
        if self.filter != Some(endpoint.response_id) {
            self.command(at::receive_address(endpoint.response_id))
                .await?;
            self.filter = Some(endpoint.response_id);
        }
        self.response_id = Some(endpoint.response_id);
        Ok(())
    }

    /// Write one frame and collect the frames the adapter heard from our responder
    async fn transmit(
        &mut self,
        body: &[u8],
        timeout: Duration,
        waiting_for: TimeoutKind,
    ) -> Result<Vec<Frame>, ChannelError> {
        let mut data = body.to_vec();
        if let Some(pad) = self.config.tx_padding {
            data.resize(MAX_FRAME_DATA, pad);
        }

        // the adapter answers NO DATA only once its own window closed
        let host_timeout = timeout.max(self.adapter_window()) + ADAPTER_MARGIN;
        let reply = match self.transport.exchange(&at::data(&data), host_timeout).await {
            Ok(reply) => reply,
            Err(TransportError::Timeout { .. }) => return Err(ChannelError::Timeout(waiting_for)),
            Err(err) => return Err(err.into()),
        };
        self.ours(reply)
    }

    /// Frames in `reply` sent by the current responder
    fn ours(&self, reply: RawResponse) -> Result<Vec<Frame>, ChannelError> {
        if let Some(condition) = reply.condition() {
            return Err(ChannelError::Adapter(condition));
        }

        let response_id = self.response_id;
        Ok(reply
            .frames()?
            .into_iter()
            .filter(|frame| {
                let ours = Some(frame.id()) == response_id;
                if !ours {
                    trace!(%frame, "Ignoring frame from another sender");
                }
                ours
            })
            .collect())
    }

    /// Keep listening to the current responder without transmitting.
    ///
    /// Frames heard within `timeout` land in the inbox for
    /// [`receive`](Self::receive).
    pub async fn listen(&mut self, timeout: Duration) -> Result<(), ChannelError> {
        let reply = match self.transport.listen(timeout).await {
            Ok(reply) => reply,
            Err(TransportError::Timeout { .. }) => {
                return Err(ChannelError::Timeout(TimeoutKind::Response))
            }
            Err(err) => return Err(err.into()),
        };
        let heard = self.ours(reply)?;
        trace!(frames = heard.len(), "Listened");
        self.inbox.extend(heard);
        Ok(())
    }

    /// Send a frame that expects Flow Control back.
    ///
    /// Returns `None` when the receiver answered with something other than
    /// Flow Control (typically a negative response); those frames are in the inbox.
    async fn await_flow_control(
        &mut self,
        frame: &[u8],
    ) -> Result<Option<(u8, Duration)>, ChannelError> {
        let received = self
            .transmit(frame, self.config.n_bs(), TimeoutKind::FlowControl)
            .await?;

        let mut waits = 0u8;
        for frame in received {
            match frame.pci()? {
                Pci::FlowControl {
                    status: FlowStatus::ContinueToSend,
                    block_size,
                    st_min,
                } => return Ok(Some((block_size, st_min_duration(st_min)))),
                Pci::FlowControl {
                    status: FlowStatus::Wait,
                    ..
                } => {
                    waits += 1;
                    if waits > self.config.max_wait_frames {
                        return Err(ChannelError::FlowControlViolation(format!(
                            "more than {} wait frames",
                            self.config.max_wait_frames
                        )));
                    }
                }
                Pci::FlowControl {
                    status: FlowStatus::Overflow,
                    ..
                } => {
                    return Err(ChannelError::FlowControlViolation(
                        "receiver reported overflow".to_string(),
                    ))
                }
                _ => self.inbox.push_back(frame),
            }
        }

        if self.inbox.is_empty() {
            Err(ChannelError::Timeout(TimeoutKind::FlowControl))
        } else {
            Ok(None)
        }
    }

    /// Send a payload to `addressing`, segmenting as needed.
    ///
    /// Whatever the responder says while the last frame's listen window is open
    /// lands in the inbox for [`receive`](Self::receive).
    pub async fn send(
        &mut self,
        payload: &[u8],
        addressing: &ModuleEndpoint,
    ) -> Result<(), ChannelError> {
        self.address(addressing).await?;
        self.apply_listen_window().await?;
        if !self.inbox.is_empty() {
            debug!(stale = self.inbox.len(), "Discarding unclaimed frames");
            self.inbox.clear();
        }

        let frames = segment(payload)?;
        let Some((first, consecutive)) = frames.split_first() else {
            return Err(ChannelError::InvalidFrame("nothing to send".to_string()));
        };

        if consecutive.is_empty() {
            let received = self
                .transmit(first, self.reply_timeout, TimeoutKind::Response)
                .await?;
            self.inbox.extend(received);
            return Ok(());
        }

        let Some((mut block_size, mut st_min)) = self.await_flow_control(first).await? else {
            debug!("Receiver answered the first frame without flow control");
            return Ok(());
        };
        let mut sent_in_block = 0usize;
        let mut last_sent: Option<Instant> = None;

        for (index, frame) in consecutive.iter().enumerate() {
            if let Some(sent_at) = last_sent {
                tokio::time::sleep_until(sent_at + st_min).await;
            }
            last_sent = Some(Instant::now());
            sent_in_block += 1;

            if index + 1 == consecutive.len() {
                let received = self
                    .transmit(frame, self.reply_timeout, TimeoutKind::Response)
                    .await?;
                self.inbox.extend(received);
            } else if block_size != 0 && sent_in_block == block_size as usize {
                match self.await_flow_control(frame).await? {
                    Some((bs, st)) => {
                        block_size = bs;
                        st_min = st;
                        sent_in_block = 0;
                        last_sent = None;
                    }
                    None => {
                        debug!("Receiver aborted the transfer");
                        return Ok(());
                    }
                }
            } else {
                let received = self
                    .transmit(frame, self.config.frame_timeout(), TimeoutKind::FlowControl)
                    .await?;
                if !received.is_empty() {
                    debug!(count = received.len(), "Frames received mid-transfer");
                    self.inbox.extend(received);
                }
            }
        }

        Ok(())
    }

    /// Take the next complete message, fetching Consecutive Frames as needed.
    ///
    /// With nothing in the inbox this fails immediately with a response
    /// timeout: the listen window already elapsed during `send`.
    pub async fn receive(&mut self, timeout: Duration) -> Result<SegmentedMessage, ChannelError> {
        let deadline = Instant::now() + timeout;

        while let Some(frame) = self.inbox.pop_front() {
            let pci = match frame.pci() {
                Ok(pci) => pci,
                Err(err) => {
                    self.inbox.clear();
                    return Err(err);
                }
            };
            match pci {
                Pci::Single { len } => {
                    return Ok(SegmentedMessage::single(frame.data()[1..=len].to_vec()))
                }
                Pci::First { len } => {
                    trace!(len, "Receiving segmented message");
                    let result = self.receive_segmented(&frame, deadline).await;
                    if result.is_err() {
                        self.inbox.clear();
                    }
                    return result;
                }
                other => trace!(?other, "Skipping frame outside a message"),
            }
        }

        Err(ChannelError::Timeout(TimeoutKind::Response))
    }

    async fn receive_segmented(
        &mut self,
        first: &Frame,
        deadline: Instant,
    ) -> Result<SegmentedMessage, ChannelError> {
        let mut reassembler = Reassembler::from_first_frame(first.data())?;
        let (block_size, st_min) = (self.config.block_size, self.config.st_min);

        loop {
            let mut block_full = false;
            while !block_full {
                let Some(frame) = self.inbox.pop_front() else {
                    break;
                };
                match frame.pci()? {
                    Pci::Consecutive { .. } => {
                        if reassembler.push(frame.data())? {
                            let consecutive_frames = reassembler.consecutive_frames();
                            return Ok(SegmentedMessage {
                                payload: reassembler.finish()?,
                                plan: SegmentationPlan::Multi {
                                    consecutive_frames,
                                    block_size,
                                    st_min,
                                },
                            });
                        }
                        block_full =
                            block_size != 0 && reassembler.frames_in_block() == block_size;
                    }
                    other => trace!(?other, "Ignoring frame inside a segmented message"),
                }
            }

            reassembler.start_block();
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ChannelError::Timeout(TimeoutKind::ConsecutiveFrame));
            }

            let fc = flow_control(FlowStatus::ContinueToSend, block_size, st_min);
            let received = self
                .transmit(
                    &fc,
                    remaining.min(self.config.n_cr()),
                    TimeoutKind::ConsecutiveFrame,
                )
                .await?;
            if received.is_empty() {
                return Err(ChannelError::Timeout(TimeoutKind::ConsecutiveFrame));
            }
            self.inbox.extend(received);
        }
    }
}
