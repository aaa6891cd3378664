//! ELM327 over a serial port

use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use chrono::Utc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, trace};

use super::adapter::{AdapterTransport, WireRecord};
use super::elm::{at, RawResponse};
use super::TransportError;
use crate::isotp::Direction;

const PROMPT: u8 = b'>';
/// Quiet period that ends a resync or a monitor stop
const SETTLE_WINDOW: Duration = Duration::from_millis(250);
const IDENTIFY: &str = "ATI";

/// AT-command transport over any byte stream
pub struct ElmTransport<S> {
    stream: S,
    buffer: BytesMut,
    wire_tx: broadcast::Sender<WireRecord>,
    /// An exchange timed out; its late output may still be on the way
    desynced: bool,
}

impl ElmTransport<SerialStream> {
    /// Open a serial device, 8N1
    pub fn open(port: &str, baud_rate: u32) -> Result<Self, TransportError> {
        let stream = tokio_serial::new(port, baud_rate)
            .timeout(Duration::from_millis(100))
            .open_native_async()
            .map_err(|e| TransportError::IoFailure(format!("Failed to open {}: {}", port, e)))?;

        info!(port, baud_rate, "Opened serial adapter");
        Ok(Self::new(stream))
    }
}

impl<S> ElmTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S) -> Self {
        let (wire_tx, _) = broadcast::channel(256);
        Self {
            stream,
            buffer: BytesMut::with_capacity(512),
            wire_tx,
            desynced: false,
        }
    }

    fn publish(&self, direction: Direction, text: &str) {
        trace!(?direction, text, "wire");
        // no subscribers is fine
        let _ = self.wire_tx.send(WireRecord {
            direction,
            text: text.to_string(),
            timestamp: Utc::now(),
        });
    }

    async fn write_line(&mut self, command: &str) -> Result<(), TransportError> {
        let mut line = Vec::with_capacity(command.len() + 1);
        line.extend_from_slice(command.as_bytes());
        line.push(b'\r');
        self.stream.write_all(&line).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn fill(&mut self) -> Result<(), TransportError> {
        let read = self.stream.read_buf(&mut self.buffer).await?;
        if read == 0 {
            return Err(TransportError::IoFailure(
                "adapter closed the serial link".to_string(),
            ));
        }
        Ok(())
    }

    /// Wait for one complete line of output, or a prompt
    async fn read_line(&mut self) -> Result<(), TransportError> {
        loop {
            let mut content = false;
            for byte in self.buffer.iter() {
                match *byte {
                    PROMPT => return Ok(()),
                    b'\r' | b'\n' if content => return Ok(()),
                    b if !b.is_ascii_whitespace() => content = true,
                    _ => {}
                }
            }
            self.fill().await?;
        }
    }

    /// Read prompts until none arrives for `window`; returns how many were seen
    async fn drain_prompts(&mut self, window: Duration) -> Result<usize, TransportError> {
        let mut prompts = 0;
        while let Ok(result) = tokio::time::timeout(window, self.read_until_prompt()).await {
            let stale = result?;
            trace!(stale = stale.trim(), "Discarded late adapter output");
            prompts += 1;
        }
        Ok(prompts)
    }

    /// Get back in step after a timed-out exchange.
    ///
    /// The late prompt is waited for first; if none comes the adapter is
    /// still busy, so an identify command interrupts it and the prompts it
    /// produces are read away.
    async fn resync(&mut self) -> Result<(), TransportError> {
        debug!(buffered = self.buffer.len(), "Resynchronizing with the adapter prompt");
        if self.drain_prompts(SETTLE_WINDOW).await? == 0 {
            self.publish(Direction::Tx, IDENTIFY);
            self.write_line(IDENTIFY).await?;
            if self.drain_prompts(SETTLE_WINDOW).await? == 0 {
                return Err(TransportError::Timeout {
                    command: IDENTIFY.to_string(),
                    timeout_ms: SETTLE_WINDOW.as_millis() as u64,
                });
            }
        }
        self.buffer.clear();
        self.desynced = false;
        Ok(())
    }

    async fn read_until_prompt(&mut self) -> Result<String, TransportError> {
        loop {
            if let Some(pos) = self.buffer.iter().position(|b| *b == PROMPT) {
                let chunk = self.buffer.split_to(pos + 1);
                return Ok(String::from_utf8_lossy(&chunk[..pos]).into_owned());
            }

            self.fill().await?;
        }
    }
}

#[async_trait]
impl<S> AdapterTransport for ElmTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn exchange(
        &mut self,
        command: &str,
        timeout: Duration,
    ) -> Result<RawResponse, TransportError> {
        if self.desynced {
            self.resync().await?;
        } else if !self.buffer.is_empty() {
            debug!(stale = self.buffer.len(), "Discarding stale adapter output");
            self.buffer.clear();
        }

        self.publish(Direction::Tx, command);
        self.write_line(command).await?;

        let text = match tokio::time::timeout(timeout, self.read_until_prompt()).await {
            Ok(result) => result?,
            Err(_) => {
                self.desynced = true;
                return Err(TransportError::Timeout {
                    command: command.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
        };

        self.publish(Direction::Rx, text.trim());
        Ok(RawResponse::from_text(command, &text))
    }

    async fn listen(&mut self, timeout: Duration) -> Result<RawResponse, TransportError> {
        if self.desynced {
            self.resync().await?;
        }
        self.buffer.clear();

        self.publish(Direction::Tx, at::MONITOR_ALL);
        self.write_line(at::MONITOR_ALL).await?;
        if let Ok(heard) = tokio::time::timeout(timeout, self.read_line()).await {
            heard?;
        }

        // any character ends the monitor, unless the adapter already stopped on its own
        if !self.buffer.contains(&PROMPT) {
            self.stream.write_all(b"\r").await?;
            self.stream.flush().await?;
        }
        let text = match tokio::time::timeout(SETTLE_WINDOW, self.read_until_prompt()).await {
            Ok(result) => result?,
            Err(_) => {
                self.desynced = true;
                return Err(TransportError::Timeout {
                    command: at::MONITOR_ALL.to_string(),
                    timeout_ms: SETTLE_WINDOW.as_millis() as u64,
                });
            }
        };

        self.publish(Direction::Rx, text.trim());
        Ok(RawResponse::from_text(at::MONITOR_ALL, &text).monitored())
    }

    fn subscribe(&self) -> broadcast::Receiver<WireRecord> {
        self.wire_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AdapterOptions;
    use tokio::io::{duplex, AsyncBufReadExt, BufReader};

    /// Answer each `\r`-terminated command with the given reply
    fn fake_elm(
        stream: tokio::io::DuplexStream,
        reply: impl Fn(&str) -> Option<String> + Send + 'static,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let (read, mut write) = tokio::io::split(stream);
            let mut reader = BufReader::new(read);
            let mut command = Vec::new();
            loop {
                command.clear();
                match reader.read_until(b'\r', &mut command).await {
                    Ok(0) | Err(_) => return,
                    Ok(_) => {}
                }
                let text = String::from_utf8_lossy(&command).trim().to_string();
                match reply(&text) {
                    Some(answer) => {
                        let _ = write.write_all(answer.as_bytes()).await;
                    }
                    None => return,
                }
            }
        })
    }

    #[tokio::test]
    async fn test_exchange_reads_until_prompt() {
        let (host, device) = duplex(1024);
        fake_elm(device, |cmd| {
            Some(match cmd {
                "0322F190" => "7E8 10 14 62 F1 90 31 32 33\r\r>".to_string(),
                _ => "?\r\r>".to_string(),
            })
        });

        let mut transport = ElmTransport::new(host);
        let mut wire = transport.subscribe();
        let reply = transport
            .exchange("0322F190", Duration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(reply.lines, vec!["7E8 10 14 62 F1 90 31 32 33"]);

        let sent = wire.recv().await.unwrap();
        assert_eq!(sent.direction, Direction::Tx);
        assert_eq!(sent.text, "0322F190");
        let received = wire.recv().await.unwrap();
        assert_eq!(received.direction, Direction::Rx);
    }

    #[tokio::test]
    async fn test_configure_runs_init_sequence() {
        let (host, device) = duplex(1024);
        fake_elm(device, |cmd| {
            Some(if cmd == "ATZ" {
                "\r\rELM327 v1.5\r\r>".to_string()
            } else {
                "OK\r\r>".to_string()
            })
        });

        let mut transport = ElmTransport::new(host);
        transport.configure(&AdapterOptions::default()).await.unwrap();
    }

    #[tokio::test]
    async fn test_configure_fails_fast_on_rejected_command() {
        let (host, device) = duplex(1024);
        fake_elm(device, |cmd| {
            Some(match cmd {
                "ATZ" => "ELM327 v2.1\r\r>".to_string(),
                "ATCAF0" => "?\r\r>".to_string(),
                _ => "OK\r\r>".to_string(),
            })
        });

        let mut transport = ElmTransport::new(host);
        let err = transport
            .configure(&AdapterOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransportError::NotAcknowledged { ref command, .. } if command == "ATCAF0"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_prompt_times_out() {
        let (host, device) = duplex(1024);
        fake_elm(device, |_| Some("7E8 03 62".to_string()));

        let mut transport = ElmTransport::new(host);
        let err = transport
            .exchange("0322F190", Duration::from_millis(300))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout { timeout_ms: 300, .. }));
        assert!(!err.is_fatal());
    }

    /// Answer commands in order, each after its own delay
    fn slow_elm(
        stream: tokio::io::DuplexStream,
        script: Vec<(&'static str, u64, &'static str)>,
    ) -> tokio::task::JoinHandle<Vec<String>> {
        tokio::spawn(async move {
            let (read, mut write) = tokio::io::split(stream);
            let mut reader = BufReader::new(read);
            let mut seen = Vec::new();
            for (expected, delay_ms, answer) in script {
                let mut command = Vec::new();
                if reader.read_until(b'\r', &mut command).await.unwrap_or(0) == 0 {
                    break;
                }
                let text = String::from_utf8_lossy(&command).trim().to_string();
                assert_eq!(text, expected);
                seen.push(text);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                let _ = write.write_all(answer.as_bytes()).await;
            }
            seen
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_reply_is_not_taken_for_the_next_one() {
        let (host, device) = duplex(1024);
        let device = slow_elm(
            device,
            vec![
                ("03220100", 400, "7E8 03 62 01 00\r\r>"),
                ("03220101", 0, "7E8 03 62 01 01\r\r>"),
            ],
        );

        let mut transport = ElmTransport::new(host);
        let err = transport
            .exchange("03220100", Duration::from_millis(300))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout { .. }));

        let reply = transport
            .exchange("03220101", Duration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(reply.lines, vec!["7E8 03 62 01 01"]);
        assert_eq!(device.await.unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_adapter_is_interrupted_before_next_command() {
        let (host, device) = duplex(1024);
        let device = slow_elm(
            device,
            vec![
                // never finishes on its own; the identify command interrupts it
                ("03220100", 0, "7E8 03"),
                ("ATI", 0, " 62\rSTOPPED\r\r>ELM327 v1.5\r\r>"),
                ("03220101", 0, "7E8 03 62 01 01\r\r>"),
            ],
        );

        let mut transport = ElmTransport::new(host);
        assert!(transport
            .exchange("03220100", Duration::from_millis(300))
            .await
            .is_err());

        let reply = transport
            .exchange("03220101", Duration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(reply.lines, vec!["7E8 03 62 01 01"]);
        assert_eq!(device.await.unwrap(), vec!["03220100", "ATI", "03220101"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_listen_monitors_then_stops() {
        let (host, device) = duplex(1024);
        let device = slow_elm(
            device,
            vec![
                ("ATMA", 1200, "7E8 06 62 2B 00 01 90 AA\r"),
                ("", 0, "STOPPED\r\r>"),
            ],
        );

        let mut transport = ElmTransport::new(host);
        let reply = transport.listen(Duration::from_millis(5000)).await.unwrap();
        assert_eq!(reply.lines, vec!["7E8 06 62 2B 00 01 90 AA"]);
        assert_eq!(reply.condition(), None);
        assert_eq!(device.await.unwrap(), vec!["ATMA", ""]);
    }

    #[tokio::test]
    async fn test_closed_link_is_io_failure() {
        let (host, device) = duplex(1024);
        fake_elm(device, |_| None);

        let mut transport = ElmTransport::new(host);
        let err = transport
            .exchange("ATI", Duration::from_millis(500))
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }
}
