//! Configuration file management for ble-monitor.
//!
//! Reads/writes `~/.ble-monitor/config.yaml` with the data and GPS serial
//! ports, export directory, and display timing.

use std::path::PathBuf;

use crate::types::MonitorError;

/// Default data-link baud rate.
pub const DEFAULT_BAUD: u32 = 115_200;

/// Full configuration structure.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub serial: SerialConfig,
    pub gps: GpsConfig,
    pub export: ExportConfig,
    pub display: DisplayConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SerialConfig {
    /// `None` reads records from standard input.
    pub port: Option<String>,
    pub baud: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GpsConfig {
    /// `None` disables GPS; status stays `no_gps`.
    pub port: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExportConfig {
    pub dir: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DisplayConfig {
    pub refresh_ms: u64,
    pub recent_secs: i64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            serial: SerialConfig {
                port: None,
                baud: DEFAULT_BAUD,
            },
            gps: GpsConfig { port: None },
            export: ExportConfig { dir: ".".into() },
            display: DisplayConfig {
                refresh_ms: 1000,
                recent_secs: crate::aggregator::RECENT_THRESHOLD_SECS,
            },
        }
    }
}

/// Get the config directory path (`~/.ble-monitor/`).
pub fn config_dir() -> PathBuf {
    dirs_home().join(".ble-monitor")
}

/// Get the config file path.
pub fn config_file() -> PathBuf {
    config_dir().join("config.yaml")
}

fn dirs_home() -> PathBuf {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

/// Load config from `~/.ble-monitor/config.yaml`.
///
/// Returns default config if the file doesn't exist or can't be read.
pub fn load_config() -> Config {
    load_config_from(&config_file())
}

pub fn load_config_from(path: &std::path::Path) -> Config {
    match std::fs::read_to_string(path) {
        Ok(text) => parse_config(&text),
        Err(_) => Config::default(),
    }
}

/// Save config to `~/.ble-monitor/config.yaml`.
pub fn save_config(config: &Config) -> Result<PathBuf, MonitorError> {
    let dir = config_dir();
    std::fs::create_dir_all(&dir).map_err(|e| MonitorError::Config(e.to_string()))?;

    let path = config_file();
    save_config_to(&path, config)?;
    Ok(path)
}

pub fn save_config_to(path: &std::path::Path, config: &Config) -> Result<(), MonitorError> {
    std::fs::write(path, serialize_config(config)).map_err(|e| MonitorError::Config(e.to_string()))
}

/// Parse simple YAML-like config text. Unknown keys and bad values are
/// skipped, leaving the default in place.
pub fn parse_config(text: &str) -> Config {
    let mut config = Config::default();
    let mut current_section: Option<&str> = None;

    for line in text.lines() {
        let stripped = line.trim();
        if stripped.is_empty() || stripped.starts_with('#') {
            continue;
        }

        let is_indented = line.starts_with("  ") || line.starts_with('\t');
        let Some((key, val)) = stripped.split_once(':') else {
            continue;
        };
        let key = key.trim();
        let val = val.trim();

        if !is_indented {
            current_section = if val.is_empty() { Some(key) } else { None };
            continue;
        }

        match (current_section, key) {
            (Some("serial"), "port") => config.serial.port = parse_string_value(val),
            (Some("serial"), "baud") => {
                if let Ok(v) = val.parse() {
                    config.serial.baud = v;
                }
            }
            (Some("gps"), "port") => config.gps.port = parse_string_value(val),
            (Some("export"), "dir") => {
                if let Some(v) = parse_string_value(val) {
                    config.export.dir = v;
                }
            }
            (Some("display"), "refresh_ms") => {
                if let Some(v) = val.parse().ok().filter(|&ms: &u64| ms > 0) {
                    config.display.refresh_ms = v;
                }
            }
            (Some("display"), "recent_secs") => {
                if let Some(v) = val.parse().ok().filter(|&s: &i64| s >= 0) {
                    config.display.recent_secs = v;
                }
            }
            _ => {}
        }
    }

    config
}

fn parse_string_value(val: &str) -> Option<String> {
    if val == "null" || val == "~" || val.is_empty() {
        return None;
    }
    // Strip quotes
    if val.len() >= 2
        && ((val.starts_with('"') && val.ends_with('"'))
            || (val.starts_with('\'') && val.ends_with('\'')))
    {
        return Some(val[1..val.len() - 1].to_string());
    }
    Some(val.to_string())
}

fn optional_string(val: &Option<String>) -> String {
    match val {
        Some(v) => format!("\"{v}\""),
        None => "null".into(),
    }
}

/// Serialize config to YAML-like text.
pub fn serialize_config(config: &Config) -> String {
    let lines = [
        "# ble-monitor configuration".to_string(),
        String::new(),
        "serial:".into(),
        format!("  port: {}", optional_string(&config.serial.port)),
        format!("  baud: {}", config.serial.baud),
        String::new(),
        "gps:".into(),
        format!("  port: {}", optional_string(&config.gps.port)),
        String::new(),
        "export:".into(),
        format!("  dir: \"{}\"", config.export.dir),
        String::new(),
        "display:".into(),
        format!("  refresh_ms: {}", config.display.refresh_ms),
        format!("  recent_secs: {}", config.display.recent_secs),
    ];

    lines.join("\n") + "\n"
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.serial.port.is_none());
        assert_eq!(config.serial.baud, 115_200);
        assert!(config.gps.port.is_none());
        assert_eq!(config.export.dir, ".");
        assert_eq!(config.display.refresh_ms, 1000);
        assert_eq!(config.display.recent_secs, 10);
    }

    #[test]
    fn test_parse_config() {
        let text = r#"
serial:
  port: "/dev/ttyACM0"
  baud: 921600

gps:
  port: /dev/ttyUSB1

export:
  dir: '/tmp/captures'

display:
  refresh_ms: 500
  recent_secs: 30
"#;
        let config = parse_config(text);
        assert_eq!(config.serial.port.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(config.serial.baud, 921_600);
        assert_eq!(config.gps.port.as_deref(), Some("/dev/ttyUSB1"));
        assert_eq!(config.export.dir, "/tmp/captures");
        assert_eq!(config.display.refresh_ms, 500);
        assert_eq!(config.display.recent_secs, 30);
    }

    #[test]
    fn test_parse_config_null_values() {
        let text = r#"
serial:
  port: null
gps:
  port: ~
"#;
        let config = parse_config(text);
        assert!(config.serial.port.is_none());
        assert!(config.gps.port.is_none());
    }

    #[test]
    fn test_bad_values_keep_defaults() {
        let text = r#"
serial:
  baud: fast
display:
  refresh_ms: 0
  recent_secs: -4
unknown:
  key: value
port: "/dev/top-level-is-ignored"
"#;
        let config = parse_config(text);
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_roundtrip() {
        let config = Config {
            serial: SerialConfig {
                port: Some("/dev/ttyACM0".into()),
                baud: 9600,
            },
            gps: GpsConfig {
                port: Some("/dev/ttyUSB0".into()),
            },
            export: ExportConfig {
                dir: "exports".into(),
            },
            display: DisplayConfig {
                refresh_ms: 250,
                recent_secs: 15,
            },
        };
        let text = serialize_config(&config);
        assert_eq!(parse_config(&text), config);
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        assert_eq!(load_config_from(&path), Config::default());

        let mut config = Config::default();
        config.gps.port = Some("/dev/ttyUSB0".into());
        save_config_to(&path, &config).unwrap();
        assert_eq!(load_config_from(&path), config);
    }
}
