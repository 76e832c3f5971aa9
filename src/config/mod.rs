//! Configuration using Figment.
//!
//! Configuration is loaded from:
//! 1. an optional TOML file (base configuration)
//! 2. environment variables prefixed with `SCPI_EMU_`, nested with `__`
//!    (e.g. `SCPI_EMU_SERVER__PORT_START=6000`)
//!
//! Every field has a default, so an empty file (or none at all) is valid.
//! Instruments come from an optional CSV table (`table = "..."`) followed by
//! inline `[[instruments]]` entries.
//!
//! # Example
//! ```no_run
//! use scpi_emulator::config::EmulatorConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = EmulatorConfig::load_from("emulator.toml")?;
//! config.validate()?;
//! let instruments = config.instrument_definitions()?;
//! println!("{} instruments", instruments.len());
//! # Ok(())
//! # }
//! ```

pub mod csv;
pub mod table;

pub use self::csv::{load_table, parse_table, write_example_table, EXAMPLE_TABLE};
pub use table::{assign_ports, instrument_id, InstrumentDefinition};

use crate::error::{AppResult, EmulatorError};
use crate::scpi::error_queue::MIN_ERROR_QUEUE_CAPACITY;
use crate::scpi::EngineSettings;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "SCPI_EMU_";

/// Default config file looked up by [`EmulatorConfig::load`].
pub const DEFAULT_CONFIG_PATH: &str = "emulator.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmulatorConfig {
    /// `[application]` section.
    #[serde(default)]
    pub application: ApplicationConfig,
    /// `[server]` section.
    #[serde(default)]
    pub server: ServerConfig,
    /// `[engine]` section.
    #[serde(default)]
    pub engine: EngineSettings,
    /// CSV command table to load.
    #[serde(default)]
    pub table: Option<PathBuf>,
    /// Inline instrument definitions, appended after the table's.
    #[serde(default)]
    pub instruments: Vec<InstrumentDefinition>,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Name shown in the startup banner.
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

/// TCP listener and session settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address every listener binds to.
    #[serde(default = "default_host")]
    pub host: String,
    /// First port handed out to instruments without an explicit one.
    #[serde(default = "default_port_start")]
    pub port_start: u16,
    /// Simulate a VISA device clear when a client connects.
    #[serde(default = "default_true")]
    pub device_clear_on_connect: bool,
    /// Close sessions that stay silent this long.
    #[serde(default, with = "humantime_serde")]
    pub idle_timeout: Option<Duration>,
    /// Process a buffered command without terminator after this much silence.
    #[serde(default = "default_flush_after", with = "humantime_serde")]
    pub flush_unterminated_after: Duration,
    /// Unterminated input beyond this many bytes is discarded.
    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,
}

// Default value functions
fn default_name() -> String {
    "SCPI Emulator".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port_start() -> u16 {
    5555
}

fn default_true() -> bool {
    true
}

fn default_flush_after() -> Duration {
    Duration::from_millis(300)
}

fn default_max_line_length() -> usize {
    64 * 1024
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port_start: default_port_start(),
            device_clear_on_connect: true,
            idle_timeout: None,
            flush_unterminated_after: default_flush_after(),
            max_line_length: default_max_line_length(),
        }
    }
}

impl EmulatorConfig {
    /// Loads `emulator.toml` from the working directory (if present) and the
    /// environment.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Loads configuration from a specific file path plus the environment.
    ///
    /// A missing file is treated as empty.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Ok(Self::figment(Some(path.as_ref())).extract()?)
    }

    /// Defaults plus the environment, without any file.
    pub fn from_env() -> AppResult<Self> {
        Ok(Self::figment(None).extract()?)
    }

    fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(EmulatorConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(invalid(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.to_lowercase().as_str()) {
            return Err(invalid(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        if self.engine.error_queue_capacity < MIN_ERROR_QUEUE_CAPACITY {
            return Err(invalid(format!(
                "Invalid error_queue_capacity {}. Must be at least {}",
                self.engine.error_queue_capacity, MIN_ERROR_QUEUE_CAPACITY
            )));
        }

        if self.server.max_line_length == 0 {
            return Err(invalid("max_line_length must be positive".to_string()));
        }

        check_unique(&self.instruments)
    }

    /// All instruments, table first, with ids filled in and ports assigned.
    pub fn instrument_definitions(&self) -> AppResult<Vec<InstrumentDefinition>> {
        let mut definitions = match &self.table {
            Some(path) => load_table(path)?,
            None => Vec::new(),
        };
        definitions.extend(self.instruments.iter().cloned());

        for definition in &mut definitions {
            definition.normalize();
        }
        assign_ports(&mut definitions, self.server.port_start);
        check_unique(&definitions)?;
        Ok(definitions)
    }
}

/// Rejects duplicate names, ids, and explicit non-zero ports.
pub fn check_unique(definitions: &[InstrumentDefinition]) -> AppResult<()> {
    let mut names = HashSet::new();
    let mut ids = HashSet::new();
    let mut ports = HashSet::new();
    for definition in definitions {
        if definition.name.trim().is_empty() {
            return Err(invalid("Instrument name must not be empty".to_string()));
        }
        if !names.insert(definition.name.to_lowercase()) {
            return Err(invalid(format!("Duplicate instrument name: {}", definition.name)));
        }
        let id = if definition.id.is_empty() {
            instrument_id(&definition.name)
        } else {
            definition.id.clone()
        };
        if !ids.insert(id.clone()) {
            return Err(invalid(format!("Duplicate instrument id: {id}")));
        }
        if let Some(port) = definition.port.filter(|p| *p != 0) {
            if !ports.insert(port) {
                return Err(invalid(format!("Duplicate instrument port: {port}")));
            }
        }
    }
    Ok(())
}

fn invalid(message: String) -> EmulatorError {
    EmulatorError::Configuration(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_defaults() {
        let config = EmulatorConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port_start, 5555);
        assert!(config.server.device_clear_on_connect);
        assert_eq!(config.server.flush_unterminated_after, Duration::from_millis(300));
        assert_eq!(config.engine.error_queue_capacity, 32);
        assert!(!config.engine.echo_on_failed_set);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_toml_with_inline_instruments() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "emulator.toml",
                r#"
                [application]
                log_level = "debug"

                [server]
                port_start = 6000
                idle_timeout = "30s"
                flush_unterminated_after = "150ms"

                [engine]
                echo_on_failed_set = true

                [[instruments]]
                name = "Bench PSU"

                [[instruments.commands]]
                command = "VOLT (.+)"
                response = "OK"
                validation = "range:0,30"

                [[instruments.commands]]
                command = "VOLT?"
                response = "0.0"
                "#,
            )?;

            let config = EmulatorConfig::load().map_err(|e| e.to_string())?;
            assert_eq!(config.application.log_level, "debug");
            assert_eq!(config.server.idle_timeout, Some(Duration::from_secs(30)));
            assert_eq!(config.server.flush_unterminated_after, Duration::from_millis(150));
            assert!(config.engine.echo_on_failed_set);

            let defs = config.instrument_definitions().map_err(|e| e.to_string())?;
            assert_eq!(defs.len(), 1);
            assert_eq!(defs[0].id, "bench_psu");
            assert_eq!(defs[0].port, Some(6000));
            assert_eq!(defs[0].commands.len(), 2);
            assert_eq!(defs[0].commands[1].validation, "");
            Ok(())
        });
    }

    #[test]
    fn test_env_overrides_file() {
        Jail::expect_with(|jail| {
            jail.create_file("emulator.toml", "[server]\nport_start = 6000\n")?;
            jail.set_env("SCPI_EMU_SERVER__PORT_START", "7000");
            jail.set_env("SCPI_EMU_ENGINE__ERROR_QUEUE_CAPACITY", "8");

            let config = EmulatorConfig::load().map_err(|e| e.to_string())?;
            assert_eq!(config.server.port_start, 7000);
            assert_eq!(config.engine.error_queue_capacity, 8);
            Ok(())
        });
    }

    #[test]
    fn test_missing_file_is_empty_config() {
        Jail::expect_with(|_| {
            let config = EmulatorConfig::load_from("nope.toml").map_err(|e| e.to_string())?;
            assert_eq!(config, EmulatorConfig::default());
            Ok(())
        });
    }

    #[test]
    fn test_table_and_inline_instruments_combine() {
        Jail::expect_with(|jail| {
            jail.create_file("table.csv", EXAMPLE_TABLE)?;
            jail.create_file(
                "emulator.toml",
                "table = \"table.csv\"\n[[instruments]]\nname = \"Extra\"\n",
            )?;

            let config = EmulatorConfig::load().map_err(|e| e.to_string())?;
            let defs = config.instrument_definitions().map_err(|e| e.to_string())?;
            let names: Vec<_> = defs.iter().map(|d| d.name.as_str()).collect();
            assert_eq!(
                names,
                vec!["Keysight 34461A DMM", "Debug Test Instrument", "Extra"]
            );
            // 5555 is taken by the table.
            assert_eq!(defs[2].port, Some(5556));
            Ok(())
        });
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = EmulatorConfig::default();
        config.application.log_level = "loud".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_queue_capacity() {
        let mut config = EmulatorConfig::default();
        config.engine.error_queue_capacity = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_instrument_names() {
        let mut config = EmulatorConfig::default();
        config.instruments = vec![
            InstrumentDefinition::new("PSU"),
            InstrumentDefinition::new("psu"),
        ];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_ports() {
        let mut config = EmulatorConfig::default();
        config.instruments = vec![
            InstrumentDefinition::new("A").with_port(6000),
            InstrumentDefinition::new("B").with_port(6000),
        ];
        assert!(config.validate().is_err());

        // Ephemeral ports never clash.
        config.instruments = vec![
            InstrumentDefinition::new("A").with_port(0),
            InstrumentDefinition::new("B").with_port(0),
        ];
        assert!(config.validate().is_ok());
    }
}
