//! Diagnostic client configuration
//!
//! Everything here deserializes from TOML with sensible defaults, so an
//! empty file yields a working configuration for a 38400 baud ELM327 on
//! high-speed CAN.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::address::Bus;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiagConfig {
    /// Which adapter to talk to
    #[serde(default)]
    pub adapter: AdapterConfig,
    /// AT-level adapter options
    #[serde(default)]
    pub elm: AdapterOptions,
    #[serde(default)]
    pub isotp: IsoTpConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub scan: ScanConfig,
    /// Modules added to the built-in address table
    #[serde(default)]
    pub modules: Vec<ModuleConfig>,
}

impl DiagConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

// =============================================================================
// Adapter Configuration
// =============================================================================

/// Adapter selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AdapterConfig {
    /// ELM327-class adapter on a serial port
    Serial(SerialConfig),
    /// In-process simulated vehicle
    Mock(MockConfig),
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self::Serial(SerialConfig::default())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Device path, e.g. "/dev/ttyUSB0" or "COM3"
    #[serde(default = "default_port")]
    pub port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            baud_rate: default_baud_rate(),
        }
    }
}

fn default_port() -> String {
    "/dev/ttyUSB0".to_string()
}

fn default_baud_rate() -> u32 {
    38400
}

/// Simulated adapter configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MockConfig {
    /// Simulated delay before each reply, in milliseconds
    #[serde(default)]
    pub latency_ms: u64,
}

/// Options applied by the AT initialization sequence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterOptions {
    /// Bus selected after initialization
    #[serde(default = "default_bus")]
    pub bus: Bus,
    /// Adapter-side listen window after each frame (ATST), in milliseconds
    #[serde(default = "default_listen_timeout")]
    pub listen_timeout_ms: u32,
    /// Host-side wait for the prompt after an AT command
    #[serde(default = "default_command_timeout")]
    pub command_timeout_ms: u64,
    /// Host-side wait after ATZ, which reboots the adapter
    #[serde(default = "default_reset_timeout")]
    pub reset_timeout_ms: u64,
}

impl Default for AdapterOptions {
    fn default() -> Self {
        Self {
            bus: default_bus(),
            listen_timeout_ms: default_listen_timeout(),
            command_timeout_ms: default_command_timeout(),
            reset_timeout_ms: default_reset_timeout(),
        }
    }
}

impl AdapterOptions {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}

fn default_bus() -> Bus {
    Bus::Hs
}

fn default_listen_timeout() -> u32 {
    200
}

fn default_command_timeout() -> u64 {
    1000
}

fn default_reset_timeout() -> u64 {
    5000
}

// =============================================================================
// ISO-TP Configuration
// =============================================================================

/// ISO-TP parameters used by the channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsoTpConfig {
    /// Block size advertised in our Flow Control (0 = no further FC)
    #[serde(default)]
    pub block_size: u8,
    /// STmin advertised in our Flow Control (raw byte)
    #[serde(default)]
    pub st_min: u8,
    /// N_Bs: wait for the receiver's Flow Control, in milliseconds
    #[serde(default = "default_n_bs")]
    pub n_bs_ms: u64,
    /// N_Cr: wait for the next Consecutive Frame, in milliseconds
    #[serde(default = "default_n_cr")]
    pub n_cr_ms: u64,
    /// Host-side wait when sending a frame that expects no reply
    #[serde(default = "default_frame_timeout")]
    pub frame_timeout_ms: u64,
    /// FS=Wait frames tolerated before giving up
    #[serde(default = "default_max_wait_frames")]
    pub max_wait_frames: u8,
    /// Pad transmitted frames to 8 bytes with this value
    #[serde(default = "default_padding")]
    pub tx_padding: Option<u8>,
}

impl Default for IsoTpConfig {
    fn default() -> Self {
        Self {
            block_size: 0,
            st_min: 0,
            n_bs_ms: default_n_bs(),
            n_cr_ms: default_n_cr(),
            frame_timeout_ms: default_frame_timeout(),
            max_wait_frames: default_max_wait_frames(),
            tx_padding: default_padding(),
        }
    }
}

impl IsoTpConfig {
    pub fn n_bs(&self) -> Duration {
        Duration::from_millis(self.n_bs_ms)
    }

    pub fn n_cr(&self) -> Duration {
        Duration::from_millis(self.n_cr_ms)
    }

    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }
}

fn default_n_bs() -> u64 {
    1000
}

fn default_n_cr() -> u64 {
    1000
}

fn default_frame_timeout() -> u64 {
    500
}

fn default_max_wait_frames() -> u8 {
    10
}

fn default_padding() -> Option<u8> {
    Some(0xCC)
}

// =============================================================================
// Session Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Wait for a response before classifying NoResponse (P2 client)
    #[serde(default = "default_response_timeout")]
    pub response_timeout_ms: u64,
    /// Wait after a ResponsePending (P2* client)
    #[serde(default = "default_pending_timeout")]
    pub response_pending_timeout_ms: u64,
    /// Total time a single request may stay pending
    #[serde(default = "default_pending_budget")]
    pub pending_budget_ms: u64,
    #[serde(default)]
    pub keepalive: KeepaliveConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: default_response_timeout(),
            response_pending_timeout_ms: default_pending_timeout(),
            pending_budget_ms: default_pending_budget(),
            keepalive: KeepaliveConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn response_pending_timeout(&self) -> Duration {
        Duration::from_millis(self.response_pending_timeout_ms)
    }

    pub fn pending_budget(&self) -> Duration {
        Duration::from_millis(self.pending_budget_ms)
    }
}

fn default_response_timeout() -> u64 {
    1000
}

fn default_pending_timeout() -> u64 {
    5000
}

fn default_pending_budget() -> u64 {
    30000
}

/// TesterPresent cadence while outside the default session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepaliveConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_keepalive_interval")]
    pub interval_ms: u64,
    /// S3 server timeout after which the ECU falls back to the default session
    #[serde(default = "default_s3_timeout")]
    pub s3_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub suppress_response: bool,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: default_keepalive_interval(),
            s3_timeout_ms: default_s3_timeout(),
            suppress_response: true,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_keepalive_interval() -> u64 {
    2000
}

fn default_s3_timeout() -> u64 {
    5000
}

/// Retry bounds for BusyRepeatRequest and ResponsePending
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff")]
    pub backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff() -> u64 {
    100
}

// =============================================================================
// Scan Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Delay between probes; never below 200 ms
    #[serde(default = "default_inter_probe_delay")]
    pub inter_probe_delay_ms: u64,
    /// Probes between checkpoints
    #[serde(default = "default_checkpoint_every")]
    pub checkpoint_every: usize,
    /// Extra attempts after a NoResponse
    #[serde(default = "default_no_response_retries")]
    pub no_response_retries: u32,
    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: PathBuf,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            inter_probe_delay_ms: default_inter_probe_delay(),
            checkpoint_every: default_checkpoint_every(),
            no_response_retries: default_no_response_retries(),
            checkpoint_dir: default_checkpoint_dir(),
        }
    }
}

/// Hard floor on probe spacing (at most 5 probes per second)
pub const MIN_INTER_PROBE_DELAY: Duration = Duration::from_millis(200);

impl ScanConfig {
    pub fn inter_probe_delay(&self) -> Duration {
        Duration::from_millis(self.inter_probe_delay_ms).max(MIN_INTER_PROBE_DELAY)
    }
}

fn default_inter_probe_delay() -> u64 {
    300
}

fn default_checkpoint_every() -> usize {
    100
}

fn default_no_response_retries() -> u32 {
    1
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("scans")
}

// =============================================================================
// Module Table Extensions
// =============================================================================

/// An extra module for the address book
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleConfig {
    pub name: String,
    pub request_id: u16,
    /// Defaults to `request_id + 8`
    #[serde(default)]
    pub response_id: Option<u16>,
    #[serde(default = "default_bus")]
    pub bus: Bus,
}
