//! Configuration file handling for elmscan

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use elmscan_uds::config::{AdapterConfig, DiagConfig, MockConfig, SerialConfig};

/// Command-line values that win over the config file
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub port: Option<String>,
    pub baud: Option<u32>,
    pub mock: bool,
    pub checkpoint_dir: Option<PathBuf>,
}

/// Load configuration from the default config file, if there is one
pub fn load() -> Result<DiagConfig> {
    let config_path = config_path()?;
    if config_path.exists() {
        load_from(&config_path)
    } else {
        Ok(DiagConfig::default())
    }
}

/// Load configuration from a specific path
pub fn load_from(path: &Path) -> Result<DiagConfig> {
    DiagConfig::from_file(path)
        .with_context(|| format!("Failed to load config file: {}", path.display()))
}

/// Get the default config file path
pub fn config_path() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .context("Could not determine config directory")?
        .join("elmscan");

    Ok(config_dir.join("config.toml"))
}

/// Merge CLI arguments over config file values
pub fn merge_with_args(mut config: DiagConfig, overrides: &Overrides) -> DiagConfig {
    if overrides.mock {
        let mock = match config.adapter {
            AdapterConfig::Mock(mock) => mock,
            AdapterConfig::Serial(_) => MockConfig::default(),
        };
        config.adapter = AdapterConfig::Mock(mock);
    } else if overrides.port.is_some() || overrides.baud.is_some() {
        let mut serial = match config.adapter {
            AdapterConfig::Serial(serial) => serial,
            AdapterConfig::Mock(_) => SerialConfig::default(),
        };
        if let Some(port) = &overrides.port {
            serial.port = port.clone();
        }
        if let Some(baud) = overrides.baud {
            serial.baud_rate = baud;
        }
        config.adapter = AdapterConfig::Serial(serial);
    }

    if let Some(dir) = &overrides.checkpoint_dir {
        config.scan.checkpoint_dir = dir.clone();
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_flags_override_file() {
        let file = DiagConfig::from_toml_str(
            r#"
            [adapter]
            type = "serial"
            port = "/dev/ttyACM0"

            [scan]
            checkpoint_dir = "/var/lib/elmscan"
            "#,
        )
        .unwrap();

        let merged = merge_with_args(
            file,
            &Overrides {
                baud: Some(115200),
                checkpoint_dir: Some(PathBuf::from("runs")),
                ..Overrides::default()
            },
        );

        let AdapterConfig::Serial(serial) = &merged.adapter else {
            panic!("expected serial adapter");
        };
        assert_eq!(serial.port, "/dev/ttyACM0");
        assert_eq!(serial.baud_rate, 115200);
        assert_eq!(merged.scan.checkpoint_dir, PathBuf::from("runs"));
    }

    #[test]
    fn test_mock_flag_replaces_serial() {
        let merged = merge_with_args(
            DiagConfig::default(),
            &Overrides {
                mock: true,
                port: Some("/dev/ttyUSB1".to_string()),
                ..Overrides::default()
            },
        );
        assert!(matches!(merged.adapter, AdapterConfig::Mock(_)));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[session]\nresponse_timeout_ms = 250\n").unwrap();
        let config = load_from(&path).unwrap();
        assert_eq!(config.session.response_timeout_ms, 250);

        assert!(load_from(&dir.path().join("missing.toml")).is_err());
    }
}
