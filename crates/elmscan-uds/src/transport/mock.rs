//! Simulated ELM327 with ECUs behind it
//!
//! The adapter side understands the AT commands the library sends, tracks the
//! selected bus, header (ATSH) and receive filter (ATCRA), and prints frames
//! the way a real ELM327 does with headers and spaces on. Each ECU runs the
//! server side of ISO-TP: it reassembles segmented requests (issuing its own
//! Flow Control), segments long answers and releases Consecutive Frames only
//! when the tester's Flow Control allows it.
//!
//! Timing follows the adapter: a data command waits at most the listen
//! window set with ATST before printing `NO DATA`, and replies an ECU holds
//! back behind a ResponsePending only show up under ATMA.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::debug;

use super::adapter::{AdapterTransport, WireRecord};
use super::elm::{at, RawResponse};
use super::TransportError;
use crate::address::Bus;
use crate::config::MockConfig;
use crate::isotp::{flow_control, segment, Direction, FlowStatus, Frame, Pci, Reassembler};

const BANNER: &str = "ELM327 v1.5";
const FUNCTIONAL_HEADER: u16 = 0x7DF;
/// ATST after reset: 0x32 units of 4 ms
const DEFAULT_LISTEN_WINDOW: Duration = Duration::from_millis(200);
const NO_DATA: &str = "NO DATA\r\r>";

/// UDS request in, zero or more UDS responses out (in order)
pub type EcuHandler = Box<dyn FnMut(&[u8]) -> Vec<Vec<u8>> + Send>;

/// One simulated module
pub struct SimulatedEcu {
    name: String,
    request_id: u16,
    response_id: u16,
    bus: Bus,
    handler: EcuHandler,
    block_size: u8,
    st_min: u8,
    wait_frames: u8,
    padding: Option<u8>,
    slow_answers: bool,
    inbound: Option<Reassembler>,
    outbound: VecDeque<Vec<u8>>,
    queued: VecDeque<Vec<u8>>,
    held: VecDeque<Vec<u8>>,
}

enum Received {
    Frames(Vec<Vec<u8>>),
    Request(Vec<u8>),
}

impl SimulatedEcu {
    /// An ECU answering at `request_id + 8` (11-bit IDs)
    pub fn new(
        name: impl Into<String>,
        request_id: u16,
        bus: Bus,
        handler: impl FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            request_id,
            response_id: request_id.wrapping_add(8),
            bus,
            handler: Box::new(handler),
            block_size: 0,
            st_min: 0,
            wait_frames: 0,
            padding: Some(0xAA),
            slow_answers: false,
            inbound: None,
            outbound: VecDeque::new(),
            queued: VecDeque::new(),
            held: VecDeque::new(),
        }
    }

    /// An ECU answering from a fixed request → response table.
    ///
    /// Unlisted requests get TesterPresent handled, `requestOutOfRange` for
    /// identifier-based services and `serviceNotSupported` otherwise.
    pub fn with_table(
        name: impl Into<String>,
        request_id: u16,
        bus: Bus,
        table: Vec<(Vec<u8>, Vec<u8>)>,
    ) -> Self {
        Self::new(name, request_id, bus, move |request| {
            match table.iter().find(|(req, _)| req.as_slice() == request) {
                Some((_, response)) => vec![response.clone()],
                None => default_reply(request),
            }
        })
    }

    pub fn with_response_id(mut self, response_id: u16) -> Self {
        self.response_id = response_id;
        self
    }

    /// Flow Control this ECU sends when receiving a segmented request
    pub fn with_flow_control(mut self, block_size: u8, st_min: u8) -> Self {
        self.block_size = block_size;
        self.st_min = st_min;
        self
    }

    /// Send this many FS=Wait frames before each ContinueToSend
    pub fn with_wait_frames(mut self, count: u8) -> Self {
        self.wait_frames = count;
        self
    }

    /// Hold back whatever the handler returns after a ResponsePending.
    ///
    /// The held replies are released one per monitor (ATMA), so the tester
    /// has to listen for them instead of seeing them in the same reply.
    pub fn with_slow_answers(mut self) -> Self {
        self.slow_answers = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn response_id(&self) -> u16 {
        self.response_id
    }

    fn flow_control_frames(&self) -> Vec<Vec<u8>> {
        let mut frames: Vec<Vec<u8>> = (0..self.wait_frames)
            .map(|_| flow_control(FlowStatus::Wait, 0, 0).to_vec())
            .collect();
        frames.push(flow_control(FlowStatus::ContinueToSend, self.block_size, self.st_min).to_vec());
        frames
    }

    fn reset(&mut self) {
        self.inbound = None;
        self.outbound.clear();
        self.queued.clear();
        self.held.clear();
    }

    fn receive(&mut self, data: &[u8]) -> Received {
        match Pci::parse(data) {
            Ok(Pci::Single { len }) => Received::Request(data[1..=len].to_vec()),
            Ok(Pci::First { .. }) => match Reassembler::from_first_frame(data) {
                Ok(reassembler) => {
                    self.inbound = Some(reassembler);
                    Received::Frames(self.flow_control_frames())
                }
                Err(_) => Received::Frames(Vec::new()),
            },
            Ok(Pci::Consecutive { .. }) => {
                let Some(reassembler) = self.inbound.as_mut() else {
                    return Received::Frames(Vec::new());
                };
                match reassembler.push(data) {
                    Ok(true) => match self.inbound.take().map(Reassembler::finish) {
                        Some(Ok(payload)) => Received::Request(payload),
                        _ => Received::Frames(Vec::new()),
                    },
                    Ok(false) => {
                        if self.block_size != 0 && reassembler.frames_in_block() == self.block_size
                        {
                            reassembler.start_block();
                            Received::Frames(self.flow_control_frames())
                        } else {
                            Received::Frames(Vec::new())
                        }
                    }
                    Err(err) => {
                        debug!(ecu = %self.name, %err, "Dropping segmented request");
                        self.inbound = None;
                        Received::Frames(Vec::new())
                    }
                }
            }
            Ok(Pci::FlowControl {
                status: FlowStatus::ContinueToSend,
                block_size,
                ..
            }) => Received::Frames(self.release_block(block_size)),
            _ => Received::Frames(Vec::new()),
        }
    }

    fn answer(&mut self, request: &[u8]) -> Vec<Vec<u8>> {
        let replies = (self.handler)(request);
        self.held.clear();
        self.release(replies.into());
        self.pump(Vec::new())
    }

    /// Queue replies up to and including the first ResponsePending when
    /// answering slowly; the rest waits in `held`
    fn release(&mut self, mut replies: VecDeque<Vec<u8>>) {
        while let Some(reply) = replies.pop_front() {
            let pending = is_response_pending(&reply);
            self.queued.push_back(reply);
            if pending && self.slow_answers {
                break;
            }
        }
        self.held.extend(replies);
    }

    /// What a monitoring adapter hears next from this ECU
    fn monitor(&mut self) -> Vec<Vec<u8>> {
        let held = std::mem::take(&mut self.held);
        self.release(held);
        self.pump(Vec::new())
    }

    /// Emit queued replies until one needs Flow Control
    fn pump(&mut self, mut out: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
        while self.outbound.is_empty() {
            let Some(reply) = self.queued.pop_front() else {
                break;
            };
            let Ok(frames) = segment(&reply) else {
                continue;
            };
            let mut frames = frames.into_iter();
            out.extend(frames.next());
            self.outbound.extend(frames);
        }
        out
    }

    fn release_block(&mut self, block_size: u8) -> Vec<Vec<u8>> {
        let count = match block_size {
            0 => self.outbound.len(),
            n => (n as usize).min(self.outbound.len()),
        };
        let out: Vec<Vec<u8>> = self.outbound.drain(..count).collect();
        if self.outbound.is_empty() {
            self.pump(out)
        } else {
            out
        }
    }

    fn render(&self, data: &[u8]) -> Option<String> {
        let mut bytes = data.to_vec();
        if let Some(pad) = self.padding {
            bytes.resize(8, pad);
        }
        Frame::new(self.response_id, &bytes, Direction::Rx).map(|frame| frame.to_string())
    }
}

fn is_response_pending(reply: &[u8]) -> bool {
    matches!(reply, [0x7F, _, 0x78])
}

fn default_reply(request: &[u8]) -> Vec<Vec<u8>> {
    match request {
        [0x3E, sub] if sub & 0x80 != 0 => Vec::new(),
        [0x3E, sub] => vec![vec![0x7E, *sub]],
        [sid @ (0x22 | 0x2F | 0x31), ..] => vec![vec![0x7F, *sid, 0x31]],
        [sid, ..] => vec![vec![0x7F, *sid, 0x11]],
        [] => Vec::new(),
    }
}

/// A command seen by the simulated adapter
#[derive(Debug, Clone)]
pub struct LoggedCommand {
    pub command: String,
    pub at: Instant,
}

struct DropRule {
    request_id: u16,
    prefix: Vec<u8>,
    remaining: usize,
}

struct MockShared {
    log: Mutex<Vec<LoggedCommand>>,
    link_up: AtomicBool,
    drops: Mutex<Vec<DropRule>>,
}

impl MockShared {
    fn take_drop(&self, request_id: u16, request: &[u8]) -> bool {
        let mut drops = self.drops.lock();
        let Some(rule) = drops
            .iter_mut()
            .find(|r| r.request_id == request_id && r.remaining > 0 && request.starts_with(&r.prefix))
        else {
            return false;
        };
        rule.remaining -= 1;
        true
    }
}

/// Control surface that stays usable after the adapter moved into a channel
#[derive(Clone)]
pub struct MockHandle {
    shared: Arc<MockShared>,
}

impl MockHandle {
    /// Every command written so far, with the tokio clock time it arrived
    pub fn commands(&self) -> Vec<LoggedCommand> {
        self.shared.log.lock().clone()
    }

    /// Commands that carried frame data rather than AT configuration
    pub fn frame_commands(&self) -> Vec<LoggedCommand> {
        self.shared
            .log
            .lock()
            .iter()
            .filter(|c| !at::is_at_command(&c.command))
            .cloned()
            .collect()
    }

    pub fn clear_log(&self) {
        self.shared.log.lock().clear();
    }

    /// A down link fails every exchange with an I/O failure
    pub fn set_link_up(&self, up: bool) {
        self.shared.link_up.store(up, Ordering::SeqCst);
    }

    /// Silently swallow the next `count` requests to `request_id` starting with `prefix`
    pub fn drop_requests(&self, request_id: u16, prefix: &[u8], count: usize) {
        self.shared.drops.lock().push(DropRule {
            request_id,
            prefix: prefix.to_vec(),
            remaining: count,
        });
    }
}

/// Simulated ELM327 adapter
pub struct MockAdapter {
    config: MockConfig,
    ecus: Vec<SimulatedEcu>,
    header: u16,
    receive_filter: Option<u16>,
    bus: Bus,
    listen_window: Duration,
    shared: Arc<MockShared>,
    wire_tx: broadcast::Sender<WireRecord>,
}

impl MockAdapter {
    pub fn new(config: &MockConfig) -> Self {
        let (wire_tx, _) = broadcast::channel(256);
        Self {
            config: config.clone(),
            ecus: Vec::new(),
            header: FUNCTIONAL_HEADER,
            receive_filter: None,
            bus: Bus::Hs,
            listen_window: DEFAULT_LISTEN_WINDOW,
            shared: Arc::new(MockShared {
                log: Mutex::new(Vec::new()),
                link_up: AtomicBool::new(true),
                drops: Mutex::new(Vec::new()),
            }),
            wire_tx,
        }
    }

    pub fn with_ecu(mut self, ecu: SimulatedEcu) -> Self {
        self.ecus.push(ecu);
        self
    }

    pub fn handle(&self) -> MockHandle {
        MockHandle {
            shared: self.shared.clone(),
        }
    }

    fn publish(&self, direction: Direction, text: &str) {
        let _ = self.wire_tx.send(WireRecord {
            direction,
            text: text.to_string(),
            timestamp: Utc::now(),
        });
    }

    fn reset_state(&mut self) {
        self.header = FUNCTIONAL_HEADER;
        self.receive_filter = None;
        self.bus = Bus::Hs;
        self.listen_window = DEFAULT_LISTEN_WINDOW;
        for ecu in &mut self.ecus {
            ecu.reset();
        }
    }

    fn handle_at(&mut self, command: &str) -> String {
        let command: String = command
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_ascii_uppercase();
        let arg = &command[2..];

        let reply = match arg {
            "Z" | "WS" => {
                self.reset_state();
                return format!("\r\r{}\r\r>", BANNER);
            }
            "I" => BANNER,
            "E0" | "E1" | "L0" | "L1" | "S0" | "S1" | "H0" | "H1" | "CAF0" | "CAF1" => "OK",
            "SP6" => {
                self.bus = Bus::Hs;
                "OK"
            }
            "SPB" => {
                self.bus = Bus::Ms;
                "OK"
            }
            "CRA" => {
                self.receive_filter = None;
                "OK"
            }
            _ if arg.starts_with("PB") => "OK",
            _ => {
                if let Some(units) = arg.strip_prefix("ST") {
                    match u8::from_str_radix(units, 16) {
                        Ok(0) => {
                            self.listen_window = DEFAULT_LISTEN_WINDOW;
                            "OK"
                        }
                        Ok(units) => {
                            self.listen_window = Duration::from_millis(u64::from(units) * 4);
                            "OK"
                        }
                        Err(_) => "?",
                    }
                } else if let Some(id) = arg.strip_prefix("SH") {
                    match u16::from_str_radix(id, 16) {
                        Ok(id) => {
                            self.header = id;
                            "OK"
                        }
                        Err(_) => "?",
                    }
                } else if let Some(id) = arg.strip_prefix("CRA") {
                    match u16::from_str_radix(id, 16) {
                        Ok(id) => {
                            self.receive_filter = Some(id);
                            "OK"
                        }
                        Err(_) => "?",
                    }
                } else {
                    "?"
                }
            }
        };
        format!("{}\r\r>", reply)
    }

    fn handle_data(&mut self, command: &str) -> String {
        let data = match hex::decode(command) {
            Ok(data) if !data.is_empty() && data.len() <= 8 => data,
            _ => return "?\r\r>".to_string(),
        };

        let (header, bus, filter) = (self.header, self.bus, self.receive_filter);
        let Some(ecu) = self
            .ecus
            .iter_mut()
            .find(|e| e.request_id == header && e.bus == bus)
        else {
            return NO_DATA.to_string();
        };

        let frames = match ecu.receive(&data) {
            Received::Frames(frames) => frames,
            Received::Request(request) => {
                if self.shared.take_drop(header, &request) {
                    debug!(ecu = %ecu.name, request = %hex::encode_upper(&request), "Dropping request");
                    Vec::new()
                } else {
                    ecu.answer(&request)
                }
            }
        };

        let lines = visible_lines(ecu, &frames, filter);
        if lines.is_empty() {
            NO_DATA.to_string()
        } else {
            format!("{}\r\r>", lines.join("\r"))
        }
    }

    /// Frames the addressed ECU sends while the adapter monitors
    fn handle_monitor(&mut self) -> Vec<String> {
        let (header, bus, filter) = (self.header, self.bus, self.receive_filter);
        let Some(ecu) = self
            .ecus
            .iter_mut()
            .find(|e| e.request_id == header && e.bus == bus)
        else {
            return Vec::new();
        };
        let frames = ecu.monitor();
        visible_lines(ecu, &frames, filter)
    }

    /// ATMA until the host's patience runs out; nothing heard means waiting it all
    async fn monitor(&mut self, latency: Duration, timeout: Duration) -> String {
        let lines = self.handle_monitor();
        if lines.is_empty() {
            tokio::time::sleep(timeout).await;
            "STOPPED\r\r>".to_string()
        } else {
            tokio::time::sleep(latency.min(timeout)).await;
            format!("{}\rSTOPPED\r\r>", lines.join("\r"))
        }
    }

    /// A small vehicle: PCM and ABS on HS-CAN, BCM on MS-CAN
    pub fn demo_vehicle(config: &MockConfig) -> Self {
        Self::new(config)
            .with_ecu(SimulatedEcu::new("PCM", 0x7E0, Bus::Hs, demo_pcm()))
            .with_ecu(SimulatedEcu::new("ABS", 0x760, Bus::Hs, demo_abs()))
            .with_ecu(SimulatedEcu::with_table(
                "BCM",
                0x726,
                Bus::Ms,
                vec![
                    (vec![0x22, 0xF1, 0x90], did_reply(0xF190, DEMO_VIN)),
                    (vec![0x22, 0xF1, 0x87], did_reply(0xF187, b"BK3T-14B476-AC")),
                    (vec![0x22, 0x40, 0x00], did_reply(0x4000, &[0x01])),
                    (vec![0x22, 0x40, 0x01], did_reply(0x4001, &[0x00, 0x64])),
                    (vec![0x10, 0x01], vec![0x50, 0x01, 0x00, 0x32, 0x01, 0xF4]),
                    (vec![0x10, 0x03], vec![0x7F, 0x10, 0x12]),
                ],
            ))
    }
}

fn visible_lines(ecu: &SimulatedEcu, frames: &[Vec<u8>], filter: Option<u16>) -> Vec<String> {
    if filter.is_some_and(|id| id != ecu.response_id) {
        return Vec::new();
    }
    frames.iter().filter_map(|frame| ecu.render(frame)).collect()
}

const DEMO_VIN: &[u8] = b"SAJAA0000DEMO0001";

fn did_reply(did: u16, data: &[u8]) -> Vec<u8> {
    let mut reply = vec![0x62, (did >> 8) as u8, did as u8];
    reply.extend_from_slice(data);
    reply
}

fn demo_pcm() -> impl FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static {
    let mut extended = false;
    let mut unlocked = false;
    const SEED: [u8; 4] = [0x11, 0x22, 0x33, 0x44];

    move |request| {
        let reply = match request {
            [0x10, 0x01] => {
                extended = false;
                unlocked = false;
                vec![0x50, 0x01, 0x00, 0x32, 0x01, 0xF4]
            }
            [0x10, 0x03] => {
                extended = true;
                unlocked = false;
                vec![0x50, 0x03, 0x00, 0x32, 0x01, 0xF4]
            }
            [0x10, sub] => vec![0x7F, 0x10, if *sub == 0x02 { 0x22 } else { 0x12 }],
            [0x27, 0x01] if extended => {
                let mut reply = vec![0x67, 0x01];
                reply.extend_from_slice(if unlocked { &[0; 4] } else { &SEED });
                reply
            }
            [0x27, 0x02, key @ ..] if extended => {
                let expected: Vec<u8> = SEED.iter().map(|b| b ^ 0xFF).collect();
                if key == expected.as_slice() {
                    unlocked = true;
                    vec![0x67, 0x02]
                } else {
                    vec![0x7F, 0x27, 0x35]
                }
            }
            [0x27, ..] => vec![0x7F, 0x27, 0x7F],
            [0x22, hi, lo] => {
                let did = u16::from_be_bytes([*hi, *lo]);
                match did {
                    0xF190 => did_reply(did, DEMO_VIN),
                    0xF187 => did_reply(did, b"GX73-12A650-AB"),
                    0xF18C => did_reply(did, b"PCM00042"),
                    0xF195 => did_reply(did, b"GX73-14C366-AC"),
                    0x0100 => did_reply(did, &[0x0C]),
                    0xF400..=0xF40F => did_reply(did, &[(did & 0xFF) as u8]),
                    0xD100..=0xD10F if !unlocked => vec![0x7F, 0x22, 0x33],
                    0xD100..=0xD10F => did_reply(did, &[0xA5]),
                    0xDD00..=0xDD03 if extended => did_reply(did, &[0x12, 0x34]),
                    0xDD00..=0xDD03 => vec![0x7F, 0x22, 0x7F],
                    _ => vec![0x7F, 0x22, 0x31],
                }
            }
            [0x31, 0x03, hi, lo] => {
                let rid = u16::from_be_bytes([*hi, *lo]);
                match rid {
                    _ if !extended => vec![0x7F, 0x31, 0x7F],
                    0x0200..=0x0205 => vec![0x71, 0x03, *hi, *lo, 0x00],
                    0x0300 => vec![0x7F, 0x31, 0x24],
                    _ => vec![0x7F, 0x31, 0x31],
                }
            }
            [0x2F, hi, lo, 0x00] => {
                let did = u16::from_be_bytes([*hi, *lo]);
                match did {
                    _ if !extended => vec![0x7F, 0x2F, 0x7F],
                    0x4000..=0x4003 => vec![0x6F, *hi, *lo, 0x00, 0x00],
                    _ => vec![0x7F, 0x2F, 0x31],
                }
            }
            [0x19, 0x02, _mask] => vec![
                0x59, 0x02, 0xFF, // availability mask
                0x01, 0x23, 0x45, 0x09, // P0123-45, testFailed | confirmed
                0xC1, 0x00, 0x01, 0x28, // U0100-01, confirmed | failedSinceClear
            ],
            [0x11, 0x01] => vec![0x51, 0x01],
            other => return default_reply(other),
        };
        vec![reply]
    }
}

fn demo_abs() -> impl FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static {
    |request| match request {
        [0x22, 0xF1, 0x90] => vec![did_reply(0xF190, DEMO_VIN)],
        [0x22, 0xF1, 0x87] => vec![did_reply(0xF187, b"FK72-2C405-AD")],
        // slow identifier: answered after a ResponsePending
        [0x22, 0x2B, 0x00] => vec![vec![0x7F, 0x22, 0x78], did_reply(0x2B00, &[0x01, 0x90])],
        [0x10, 0x03] => vec![vec![0x50, 0x03, 0x00, 0x32, 0x01, 0xF4]],
        other => default_reply(other),
    }
}

#[async_trait]
impl AdapterTransport for MockAdapter {
    async fn exchange(
        &mut self,
        command: &str,
        timeout: Duration,
    ) -> Result<RawResponse, TransportError> {
        if !self.shared.link_up.load(Ordering::SeqCst) {
            return Err(TransportError::IoFailure(
                "simulated adapter disconnected".to_string(),
            ));
        }

        self.shared.log.lock().push(LoggedCommand {
            command: command.to_string(),
            at: Instant::now(),
        });
        self.publish(Direction::Tx, command);

        let latency = Duration::from_millis(self.config.latency_ms);
        let text = if command.eq_ignore_ascii_case(at::MONITOR_ALL) {
            self.monitor(latency, timeout).await
        } else if !at::is_at_command(command) && latency > self.listen_window {
            // the adapter stops listening before the answer arrives
            let window = self.listen_window;
            if window > timeout {
                tokio::time::sleep(timeout).await;
                return Err(TransportError::Timeout {
                    command: command.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            tokio::time::sleep(window).await;
            NO_DATA.to_string()
        } else {
            if latency > timeout {
                tokio::time::sleep(timeout).await;
                return Err(TransportError::Timeout {
                    command: command.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            if at::is_at_command(command) {
                self.handle_at(command)
            } else {
                self.handle_data(command)
            }
        };
        self.publish(Direction::Rx, text.trim_end_matches('>').trim());
        Ok(RawResponse::from_text(command, &text))
    }

    fn subscribe(&self) -> broadcast::Receiver<WireRecord> {
        self.wire_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AdapterOptions;
    use pretty_assertions::assert_eq;

    const T: Duration = Duration::from_millis(500);

    fn pcm_only() -> MockAdapter {
        MockAdapter::new(&MockConfig::default()).with_ecu(SimulatedEcu::with_table(
            "PCM",
            0x7E0,
            Bus::Hs,
            vec![(vec![0x22, 0x01, 0x00], vec![0x62, 0x01, 0x00, 0x0C])],
        ))
    }

    #[tokio::test]
    async fn test_configure_against_mock() {
        let mut adapter = pcm_only();
        adapter.configure(&AdapterOptions::default()).await.unwrap();
        assert_eq!(adapter.handle().commands()[0].command, "ATZ");
    }

    #[tokio::test]
    async fn test_single_frame_reply() {
        let mut adapter = pcm_only();
        adapter.exchange("ATSH7E0", T).await.unwrap();
        let reply = adapter.exchange("03220100", T).await.unwrap();
        assert_eq!(reply.lines, vec!["7E8 04 62 01 00 0C AA AA AA"]);
    }

    #[tokio::test]
    async fn test_unknown_header_is_no_data() {
        let mut adapter = pcm_only();
        adapter.exchange("ATSH7A0", T).await.unwrap();
        let reply = adapter.exchange("03220100", T).await.unwrap();
        assert!(reply.is_no_data());
    }

    #[tokio::test]
    async fn test_receive_filter_hides_other_ids() {
        let mut adapter = pcm_only();
        adapter.exchange("ATSH7E0", T).await.unwrap();
        adapter.exchange("ATCRA7E9", T).await.unwrap();
        let reply = adapter.exchange("03220100", T).await.unwrap();
        assert!(reply.is_no_data());
    }

    #[tokio::test]
    async fn test_segmented_reply_waits_for_flow_control() {
        let mut adapter = MockAdapter::demo_vehicle(&MockConfig::default());
        adapter.exchange("ATSH7E0", T).await.unwrap();

        let first = adapter.exchange("0322F190", T).await.unwrap();
        assert_eq!(first.lines.len(), 1);
        assert!(first.lines[0].starts_with("7E8 10 14 62 F1 90"));

        let rest = adapter.exchange("300000", T).await.unwrap();
        assert_eq!(rest.lines.len(), 2);
        assert!(rest.lines[0].starts_with("7E8 21"));
        assert!(rest.lines[1].starts_with("7E8 22"));
    }

    #[tokio::test]
    async fn test_drop_and_link_failure() {
        let mut adapter = pcm_only();
        let handle = adapter.handle();
        adapter.exchange("ATSH7E0", T).await.unwrap();

        handle.drop_requests(0x7E0, &[0x22, 0x01], 1);
        assert!(adapter.exchange("03220100", T).await.unwrap().is_no_data());
        assert!(!adapter.exchange("03220100", T).await.unwrap().is_no_data());

        handle.set_link_up(false);
        let err = adapter.exchange("03220100", T).await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test(start_paused = true)]
    async fn test_listen_window_follows_atst() {
        let mut adapter = MockAdapter::new(&MockConfig { latency_ms: 300 }).with_ecu(
            SimulatedEcu::with_table(
                "PCM",
                0x7E0,
                Bus::Hs,
                vec![(vec![0x22, 0x01, 0x00], vec![0x62, 0x01, 0x00, 0x0C])],
            ),
        );
        let long = Duration::from_millis(2000);
        adapter.exchange("ATSH7E0", long).await.unwrap();

        // default window of 200 ms closes before the 300 ms answer
        let started = Instant::now();
        assert!(adapter.exchange("03220100", long).await.unwrap().is_no_data());
        assert_eq!(started.elapsed(), Duration::from_millis(200));

        adapter.exchange("ATST64", long).await.unwrap();
        let reply = adapter.exchange("03220100", long).await.unwrap();
        assert_eq!(reply.lines, vec!["7E8 04 62 01 00 0C AA AA AA"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_answer_only_heard_by_monitor() {
        let ecu = SimulatedEcu::new("PCM", 0x7E0, Bus::Hs, |_| {
            vec![vec![0x7F, 0x31, 0x78], vec![0x7F, 0x31, 0x78], vec![0x71, 0x01, 0x02, 0x00]]
        })
        .with_slow_answers();
        let mut adapter = MockAdapter::new(&MockConfig::default()).with_ecu(ecu);
        adapter.exchange("ATSH7E0", T).await.unwrap();

        let reply = adapter.exchange("0431010200", T).await.unwrap();
        assert_eq!(reply.lines, vec!["7E8 03 7F 31 78 AA AA AA AA"]);

        let heard = adapter.listen(T).await.unwrap();
        assert_eq!(heard.lines, vec!["7E8 03 7F 31 78 AA AA AA AA"]);
        let heard = adapter.listen(T).await.unwrap();
        assert_eq!(heard.lines, vec!["7E8 04 71 01 02 00 AA AA AA"]);

        // nothing left: the monitor runs out the whole wait
        let started = Instant::now();
        assert!(adapter.listen(T).await.unwrap().lines.is_empty());
        assert_eq!(started.elapsed(), T);
        assert_eq!(adapter.handle().frame_commands().len(), 1);
    }

    #[test]
    fn test_response_id_near_top_of_range() {
        let ecu = SimulatedEcu::new("edge", 0xFFFC, Bus::Hs, |_| Vec::new());
        assert_eq!(ecu.response_id(), 0x0004);
        let ecu = SimulatedEcu::new("PCM", 0x7E0, Bus::Hs, |_| Vec::new());
        assert_eq!(ecu.response_id(), 0x7E8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_beyond_timeout() {
        let mut adapter = MockAdapter::new(&MockConfig { latency_ms: 500 });
        let err = adapter
            .exchange("ATI", Duration::from_millis(300))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout { timeout_ms: 300, .. }));
    }
}
