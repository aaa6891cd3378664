//! Adapter transport trait and types

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::elm::{at, RawResponse};
use super::TransportError;
use crate::config::AdapterOptions;
use crate::isotp::Direction;

/// One line of wire traffic, published for audit logging
#[derive(Debug, Clone)]
pub struct WireRecord {
    pub direction: Direction,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// Exclusive access to an AT-command CAN adapter
///
/// Exactly one command is in flight at a time: every method takes `&mut self`,
/// and `exchange` returns only once the adapter printed its prompt (or the
/// timeout expired).
#[async_trait]
pub trait AdapterTransport: Send {
    /// Write `command` followed by a carriage return and collect every line
    /// printed before the `>` prompt.
    ///
    /// `NO DATA` is a valid reply, not an error.
    async fn exchange(
        &mut self,
        command: &str,
        timeout: Duration,
    ) -> Result<RawResponse, TransportError>;

    /// Collect frames the adapter hears within `timeout` without transmitting.
    ///
    /// Used to wait out a ResponsePending: the final answer belongs to a
    /// request that was already sent, so nothing may go on the bus again.
    async fn listen(&mut self, timeout: Duration) -> Result<RawResponse, TransportError> {
        Ok(self.exchange(at::MONITOR_ALL, timeout).await?.monitored())
    }

    /// Subscribe to the wire log
    fn subscribe(&self) -> broadcast::Receiver<WireRecord>;

    /// Run the initialization sequence.
    ///
    /// Fails fast with `NotAcknowledged` on the first command that is not
    /// answered as expected.
    async fn configure(&mut self, options: &AdapterOptions) -> Result<(), TransportError> {
        let reset = self.exchange(at::RESET, options.reset_timeout()).await?;
        if !reset.has_banner() {
            return Err(TransportError::NotAcknowledged {
                command: at::RESET.to_string(),
                reply: reset.text(),
            });
        }
        debug!(banner = %reset.text(), "Adapter reset");

        for command in at::init_sequence(options) {
            let reply = self.exchange(&command, options.command_timeout()).await?;
            if !reply.is_ok() {
                return Err(TransportError::NotAcknowledged {
                    command,
                    reply: reply.text(),
                });
            }
        }

        info!(bus = %options.bus, "Adapter configured");
        Ok(())
    }
}

#[async_trait]
impl<T: AdapterTransport + ?Sized> AdapterTransport for Box<T> {
    async fn exchange(
        &mut self,
        command: &str,
        timeout: Duration,
    ) -> Result<RawResponse, TransportError> {
        (**self).exchange(command, timeout).await
    }

    async fn listen(&mut self, timeout: Duration) -> Result<RawResponse, TransportError> {
        (**self).listen(timeout).await
    }

    fn subscribe(&self) -> broadcast::Receiver<WireRecord> {
        (**self).subscribe()
    }

    async fn configure(&mut self, options: &AdapterOptions) -> Result<(), TransportError> {
        (**self).configure(options).await
    }
}
