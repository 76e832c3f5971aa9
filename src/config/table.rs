//! Instrument definitions: the unit a command table is grouped into.

use crate::scpi::CommandDefinition;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// One emulated instrument as configured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentDefinition {
    /// Display name, also the model field of `*IDN?`.
    pub name: String,
    /// Lookup alias; derived from `name` when empty.
    #[serde(default)]
    pub id: String,
    /// TCP port. Unset ports are assigned sequentially from `server.port_start`.
    #[serde(default)]
    pub port: Option<u16>,
    /// Ordered command rules; the first match wins.
    #[serde(default)]
    pub commands: Vec<CommandDefinition>,
}

impl InstrumentDefinition {
    /// An instrument with no commands; the id is derived from `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: instrument_id(&name),
            name,
            port: None,
            commands: Vec::new(),
        }
    }

    /// Pins the TCP port.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Appends a rule after the existing ones.
    #[must_use]
    pub fn with_command(
        mut self,
        command: impl Into<String>,
        response: impl Into<String>,
        validation: impl Into<String>,
    ) -> Self {
        self.commands
            .push(CommandDefinition::new(command, response, validation));
        self
    }

    /// Trims the name and fills in a missing id.
    pub fn normalize(&mut self) {
        self.name = self.name.trim().to_string();
        if self.id.trim().is_empty() {
            self.id = instrument_id(&self.name);
        }
    }
}

/// `Keysight 34461A-DMM` -> `keysight_34461a_dmm`.
#[must_use]
pub fn instrument_id(name: &str) -> String {
    name.trim()
        .to_lowercase()
        .chars()
        .map(|c| if c == ' ' || c == '-' { '_' } else { c })
        .collect()
}

/// Gives every definition without a port the next unused port from `port_start`.
pub fn assign_ports(definitions: &mut [InstrumentDefinition], port_start: u16) {
    let taken: HashSet<u16> = definitions.iter().filter_map(|d| d.port).collect();
    let mut next = port_start;
    for definition in definitions.iter_mut().filter(|d| d.port.is_none()) {
        while taken.contains(&next) && next != 0 {
            next = next.wrapping_add(1);
        }
        definition.port = Some(next);
        if next != 0 {
            next = next.wrapping_add(1);
        }
    }
}
