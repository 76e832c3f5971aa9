//! The SCPI command-processing engine.
//!
//! [`CommandEngine::execute`] is synchronous and does no I/O. Callers that
//! share an engine between connections serialise access themselves (see
//! [`crate::instrument::Instrument`]).

use super::error_queue::{ErrorQueue, ScpiError, DEFAULT_ERROR_QUEUE_CAPACITY};
use super::rule::{has_placeholder, render_template, CommandTable, RuleKind};
use super::state::InstrumentState;
use super::status::{StatusRegisters, ESR_OPERATION_COMPLETE};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Engine behaviour knobs, loaded from the `[engine]` config section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Error queue capacity (minimum 2).
    #[serde(default = "default_error_queue_capacity")]
    pub error_queue_capacity: usize,
    /// Return the configured response text when a Set fails validation.
    #[serde(default)]
    pub echo_on_failed_set: bool,
    /// Manufacturer field of `*IDN?`.
    #[serde(default = "default_manufacturer")]
    pub manufacturer: String,
    /// Firmware field of `*IDN?`.
    #[serde(default = "default_firmware")]
    pub firmware: String,
    /// Response to `SYST:VERS?`.
    #[serde(default = "default_scpi_version")]
    pub scpi_version: String,
}

fn default_error_queue_capacity() -> usize {
    DEFAULT_ERROR_QUEUE_CAPACITY
}

fn default_manufacturer() -> String {
    "SCPI_Emulator".to_string()
}

fn default_firmware() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_scpi_version() -> String {
    "1999.0".to_string()
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            error_queue_capacity: default_error_queue_capacity(),
            echo_on_failed_set: false,
            manufacturer: default_manufacturer(),
            firmware: default_firmware(),
            scpi_version: default_scpi_version(),
        }
    }
}

/// Result of executing one command line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reply {
    /// Response payload without terminator; empty when nothing is sent back.
    pub response: String,
    /// Errors queued while executing the line, oldest first.
    pub errors: Vec<ScpiError>,
}

impl Reply {
    /// Code of the last error raised by this line, if any.
    #[must_use]
    pub fn error_code(&self) -> Option<i32> {
        self.errors.last().map(ScpiError::code)
    }
}

/// Matched rule data copied out of the table so state can be mutated.
struct Dispatch {
    kind: RuleKind,
    state_key: Option<String>,
    response: String,
    parameter: Option<String>,
}

/// Pattern-matching SCPI engine for one instrument.
#[derive(Debug, Clone)]
pub struct CommandEngine {
    name: String,
    serial: String,
    settings: EngineSettings,
    table: CommandTable,
    state: InstrumentState,
    errors: ErrorQueue,
    status: StatusRegisters,
    raised: Vec<ScpiError>,
}

impl CommandEngine {
    /// Builds an engine around a loaded table. `serial` is reported by `*IDN?`.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        serial: impl Into<String>,
        table: CommandTable,
        settings: EngineSettings,
    ) -> Self {
        let state = InstrumentState::new(table.defaults().clone());
        let errors = ErrorQueue::new(settings.error_queue_capacity);
        Self {
            name: name.into(),
            serial: serial.into(),
            settings,
            table,
            state,
            errors,
            status: StatusRegisters::new(),
            raised: Vec::new(),
        }
    }

    /// Processes a line and returns the response payload (possibly empty).
    pub fn process(&mut self, line: &str) -> String {
        self.execute(line).response
    }

    /// Processes a line, reporting the response and any errors it raised.
    ///
    /// `;`-separated commands run in order; their non-empty responses are
    /// joined with `;`.
    pub fn execute(&mut self, line: &str) -> Reply {
        self.raised.clear();

        let responses: Vec<String> = line
            .split(';')
            .map(str::trim)
            .filter(|cmd| !cmd.is_empty())
            .map(|cmd| self.execute_single(cmd))
            .filter(|resp| !resp.is_empty())
            .collect();

        Reply {
            response: responses.join(";"),
            errors: std::mem::take(&mut self.raised),
        }
    }

    /// Restores state defaults and drains the event registers.
    ///
    /// The command table and validation store are untouched, and queued
    /// errors are kept.
    pub fn device_clear(&mut self) {
        self.state.reset();
        self.status.clear_events();
    }

    /// `*RST`: device clear plus an empty error queue.
    pub fn reset(&mut self) {
        self.device_clear();
        self.errors.clear();
    }

    /// `*CLS`: event registers and error queue only; state values are kept.
    pub fn clear_status(&mut self) {
        self.status.clear_events();
        self.errors.clear();
    }

    /// Model field of `*IDN?`.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The compiled rules.
    #[must_use]
    pub fn table(&self) -> &CommandTable {
        &self.table
    }

    /// Current stateful values.
    #[must_use]
    pub fn state(&self) -> &InstrumentState {
        &self.state
    }

    /// Current values, sorted by key.
    #[must_use]
    pub fn state_snapshot(&self) -> BTreeMap<String, String> {
        self.state.snapshot()
    }

    /// IEEE-488.2 status registers.
    #[must_use]
    pub fn status(&self) -> &StatusRegisters {
        &self.status
    }

    /// Entries waiting for `SYST:ERR?`.
    #[must_use]
    pub fn queued_errors(&self) -> usize {
        self.errors.len()
    }

    fn execute_single(&mut self, command: &str) -> String {
        let (header, argument) = split_header(command);

        if is_protected(&header) {
            if let Some(response) = self.builtin(&header, argument) {
                return response;
            }
        }

        let dispatch = self.table.find(command).map(|(rule, parameter)| Dispatch {
            kind: rule.kind(),
            state_key: rule.state_key().map(str::to_string),
            response: rule.response().to_string(),
            parameter,
        });
        if let Some(dispatch) = dispatch {
            return self.apply(dispatch);
        }

        if let Some(response) = self
            .builtin(&header, argument)
            .or_else(|| self.fallback_builtin(&header, argument))
        {
            return response;
        }

        self.raise(ScpiError::UndefinedHeader);
        String::new()
    }

    fn apply(&mut self, dispatch: Dispatch) -> String {
        match (dispatch.kind, dispatch.state_key, dispatch.parameter) {
            (RuleKind::Set, Some(key), Some(parameter)) => {
                match self.table.validations().check(&key, &parameter) {
                    Ok(value) => {
                        let response = render_template(&dispatch.response, &value);
                        self.state.set(&key, value);
                        response
                    }
                    Err(error) => {
                        self.raise(error);
                        if self.settings.echo_on_failed_set {
                            dispatch.response
                        } else {
                            String::new()
                        }
                    }
                }
            }
            (RuleKind::Query, Some(key), _) => match self.state.get(&key) {
                Some(value) if has_placeholder(&dispatch.response) => {
                    render_template(&dispatch.response, value)
                }
                Some(value) => value.to_string(),
                None => dispatch.response,
            },
            _ => dispatch.response,
        }
    }

    /// IEEE-488.2 common commands and `SYST:ERR?`.
    fn builtin(&mut self, header: &str, argument: Option<&str>) -> Option<String> {
        if is_error_query(header) {
            return argument
                .is_none()
                .then(|| self.errors.next_message());
        }

        let response = match (header, argument) {
            ("*IDN?", None) => format!(
                "{},{},{},{}",
                self.settings.manufacturer, self.name, self.serial, self.settings.firmware
            ),
            ("*RST", None) => {
                self.reset();
                String::new()
            }
            ("*CLS", None) => {
                self.clear_status();
                String::new()
            }
            ("*OPC", None) => {
                self.status.raise_event(ESR_OPERATION_COMPLETE);
                String::new()
            }
            ("*OPC?", None) => "1".to_string(),
            ("*WAI", None) => String::new(),
            ("*TST?", None) => "0".to_string(),
            ("*ESE", mask) => {
                if let Some(mask) = self.parse_mask(mask) {
                    self.status.set_ese(mask);
                }
                String::new()
            }
            ("*ESE?", None) => self.status.ese().to_string(),
            ("*ESR?", None) => self.status.take_esr().to_string(),
            ("*SRE", mask) => {
                if let Some(mask) = self.parse_mask(mask) {
                    self.status.set_sre(mask);
                }
                String::new()
            }
            ("*SRE?", None) => self.status.sre().to_string(),
            ("*STB?", None) => self
                .status
                .status_byte(!self.errors.is_empty())
                .to_string(),
            _ => return None,
        };
        Some(response)
    }

    /// `SYST:VERS?`, answered only when no table row matched.
    fn fallback_builtin(&mut self, header: &str, argument: Option<&str>) -> Option<String> {
        (argument.is_none() && is_version_query(header))
            .then(|| self.settings.scpi_version.clone())
    }

    fn parse_mask(&mut self, argument: Option<&str>) -> Option<u8> {
        let Some(raw) = argument else {
            self.raise(ScpiError::MissingParameter);
            return None;
        };
        let value: f64 = match raw.parse() {
            Ok(v) => v,
            Err(_) => {
                self.raise(ScpiError::DataType(raw.to_string()));
                return None;
            }
        };
        if !(0.0..=255.0).contains(&value) {
            self.raise(ScpiError::DataOutOfRange(raw.to_string()));
            return None;
        }
        Some(value.round() as u8)
    }

    fn raise(&mut self, error: ScpiError) {
        self.status.raise_event(error.esr_bit());
        self.errors.push(error.clone());
        self.raised.push(error);
    }
}

/// Splits a command into its uppercased header and optional argument text.
fn split_header(command: &str) -> (String, Option<&str>) {
    match command.split_once(char::is_whitespace) {
        Some((header, rest)) => {
            let rest = rest.trim();
            (
                header.to_ascii_uppercase(),
                (!rest.is_empty()).then_some(rest),
            )
        }
        None => (command.to_ascii_uppercase(), None),
    }
}

/// Common commands a table row may answer instead of the built-in.
const OVERRIDABLE: [&str; 4] = ["*IDN?", "*TST?", "*OPC?", "*WAI"];

/// Headers whose built-in always runs before the table is consulted.
fn is_protected(header: &str) -> bool {
    (header.starts_with('*') && !OVERRIDABLE.contains(&header)) || is_error_query(header)
}

/// Matches `SYSTem:ERRor[:NEXT]?` in short or long form.
fn is_error_query(header: &str) -> bool {
    let Some(path) = header.strip_suffix('?') else {
        return false;
    };
    let nodes: Vec<&str> = path.trim_start_matches(':').split(':').collect();
    match nodes.as_slice() {
        [system, error] => is_system(system) && is_mnemonic(error, "ERR", "ERROR"),
        [system, error, next] => {
            is_system(system)
                && is_mnemonic(error, "ERR", "ERROR")
                && is_mnemonic(next, "NEXT", "NEXT")
        }
        _ => false,
    }
}

/// Matches `SYSTem:VERSion?`.
fn is_version_query(header: &str) -> bool {
    let Some(path) = header.strip_suffix('?') else {
        return false;
    };
    let nodes: Vec<&str> = path.trim_start_matches(':').split(':').collect();
    matches!(nodes.as_slice(), [system, version]
        if is_system(system) && is_mnemonic(version, "VERS", "VERSION"))
}

fn is_system(node: &str) -> bool {
    is_mnemonic(node, "SYST", "SYSTEM")
}

fn is_mnemonic(node: &str, short: &str, long: &str) -> bool {
    node.eq_ignore_ascii_case(short) || node.eq_ignore_ascii_case(long)
}
