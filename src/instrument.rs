//! A named emulated instrument.
//!
//! [`Instrument`] wraps one [`CommandEngine`] behind a mutex so every session
//! connected to the same port, and the control surface, see one shared state
//! and one error queue. Lines are executed atomically: the lock is held for
//! the whole of a (possibly compound) line, and the traffic events for that
//! line are published while it is held so subscribers observe them in
//! processing order.

use crate::config::InstrumentDefinition;
use crate::error::AppResult;
use crate::events::{CommandEvent, Direction, EventBus};
use crate::scpi::{CommandEngine, CommandTable, EngineSettings, Reply};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

/// Source tag used for commands injected through the control surface.
pub const CONTROL_SOURCE: &str = "control";

/// An emulated instrument: one engine, its traffic counter and event bus.
#[derive(Debug)]
pub struct Instrument {
    name: String,
    id: String,
    port: u16,
    engine: Mutex<CommandEngine>,
    command_count: AtomicU64,
    events: EventBus,
}

impl Instrument {
    /// Compiles the definition's command table and builds the instrument.
    pub fn new(
        definition: &InstrumentDefinition,
        port: u16,
        settings: &EngineSettings,
        events: EventBus,
    ) -> AppResult<Self> {
        let table = CommandTable::build(&definition.commands)?;
        debug!(
            instrument = %definition.name,
            rules = table.len(),
            stateful = table.defaults().len(),
            "Compiled command table"
        );
        let engine = CommandEngine::new(&definition.name, &definition.id, table, settings.clone());
        Ok(Self {
            name: definition.name.clone(),
            id: definition.id.clone(),
            port,
            engine: Mutex::new(engine),
            command_count: AtomicU64::new(0),
            events,
        })
    }

    /// Display name from the command table.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Lowercase identifier derived from the name.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Configured port; `0` asks the OS for an ephemeral one.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Bus this instrument publishes its traffic on.
    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Executes one line received from `source` and publishes its traffic.
    pub fn execute(&self, line: &str, source: &str) -> Reply {
        let mut engine = self.engine();

        self.events.publish(
            CommandEvent::new(&self.id, Direction::In, line, source)
                .with_instrument_name(&self.name),
        );
        let reply = engine.execute(line);
        self.command_count.fetch_add(1, Ordering::Relaxed);
        self.events.publish(
            CommandEvent::new(&self.id, Direction::Out, &reply.response, source)
                .with_instrument_name(&self.name)
                .with_error_code(reply.error_code()),
        );

        debug!(
            instrument = %self.id,
            source,
            command = line,
            response = %reply.response,
            "Processed command"
        );
        reply
    }

    /// Executes a line and returns only the response payload.
    pub fn process(&self, line: &str, source: &str) -> String {
        self.execute(line, source).response
    }

    /// Restores state defaults and drains event registers. Validation and
    /// the command table are kept.
    pub fn device_clear(&self) {
        self.engine().device_clear();
        info!(instrument = %self.id, "Device clear");
    }

    /// Same as a `*RST` from a client.
    pub fn reset(&self) {
        self.engine().reset();
        info!(instrument = %self.id, "Reset");
    }

    /// Lines executed since the instrument was loaded.
    #[must_use]
    pub fn command_count(&self) -> u64 {
        self.command_count.load(Ordering::Relaxed)
    }

    /// Entries waiting in the SCPI error queue.
    #[must_use]
    pub fn queued_errors(&self) -> usize {
        self.engine().queued_errors()
    }

    /// Current stateful values, sorted by key.
    #[must_use]
    pub fn state_snapshot(&self) -> BTreeMap<String, String> {
        self.engine().state_snapshot()
    }

    /// Compiled command rules.
    #[must_use]
    pub fn rule_count(&self) -> usize {
        self.engine().table().len()
    }

    fn engine(&self) -> MutexGuard<'_, CommandEngine> {
        // A panic mid-command leaves the engine usable; keep serving.
        self.engine
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
