//! Server manager - orchestration layer for emulated instruments
//!
//! ## Responsibilities
//!
//! 1. **Registry**: owns the loaded [`Instrument`]s, keyed by id. Loading a new
//!    table replaces the registry as a whole.
//! 2. **Lifecycle**: starts, stops and restarts one [`InstrumentServer`] per
//!    instrument. A server is in the running map exactly while it listens.
//! 3. **Control surface**: command injection, explicit device clear and
//!    status reporting for the shell and embedders.
//!
//! Instruments are looked up by id (`keysight_34461a_dmm`) or by name,
//! case-insensitively.

use super::server::InstrumentServer;
use super::session::SessionSettings;
use crate::config::{assign_ports, instrument_id, EmulatorConfig, InstrumentDefinition, ServerConfig};
use crate::error::{AppResult, EmulatorError};
use crate::events::EventBus;
use crate::instrument::{Instrument, CONTROL_SOURCE};
use crate::scpi::EngineSettings;
use futures::future::join_all;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};

/// Snapshot of one instrument for status displays.
#[derive(Debug, Clone, Serialize)]
pub struct InstrumentStatus {
    /// Display name.
    pub name: String,
    /// Lookup id.
    pub id: String,
    /// Bound port while running, configured port otherwise.
    pub port: u16,
    /// Whether a listener is up.
    pub running: bool,
    /// Listener uptime while running.
    #[serde(with = "humantime_serde")]
    pub uptime: Option<Duration>,
    /// Lines executed since the instrument was loaded.
    pub command_count: u64,
    /// Open client sessions.
    pub clients: usize,
    /// Entries in the SCPI error queue.
    pub queued_errors: usize,
    /// Current stateful values.
    pub state: BTreeMap<String, String>,
}

impl fmt::Display for InstrumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = if self.running { "RUNNING" } else { "STOPPED" };
        write!(
            f,
            "{:<28} {:>5}  {:<7} commands={} clients={} errors={}",
            self.name, self.port, status, self.command_count, self.clients, self.queued_errors
        )?;
        if let Some(uptime) = self.uptime {
            let uptime = Duration::from_secs(uptime.as_secs());
            write!(f, " uptime={}", humantime::format_duration(uptime))?;
        }
        Ok(())
    }
}

/// Owns the instrument registry and their listeners.
pub struct ServerManager {
    server: ServerConfig,
    engine: EngineSettings,
    events: EventBus,
    instruments: RwLock<BTreeMap<String, Arc<Instrument>>>,
    running: Mutex<HashMap<String, InstrumentServer>>,
}

impl ServerManager {
    /// An empty registry; nothing listens until an instrument is started.
    #[must_use]
    pub fn new(server: ServerConfig, engine: EngineSettings) -> Self {
        Self {
            server,
            engine,
            events: EventBus::default(),
            instruments: RwLock::new(BTreeMap::new()),
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Manager for the `[server]` and `[engine]` sections.
    #[must_use]
    pub fn from_config(config: &EmulatorConfig) -> Self {
        Self::new(config.server.clone(), config.engine.clone())
    }

    /// Bus carrying every instrument's command traffic.
    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Listener settings shared by every instrument.
    #[must_use]
    pub fn server_config(&self) -> &ServerConfig {
        &self.server
    }

    /// Replaces the registry with `definitions`. Running servers are stopped
    /// first. Nothing changes if any definition fails to compile.
    pub async fn load(&self, mut definitions: Vec<InstrumentDefinition>) -> AppResult<usize> {
        for definition in &mut definitions {
            definition.normalize();
        }
        assign_ports(&mut definitions, self.server.port_start);
        crate::config::check_unique(&definitions)?;

        let mut loaded = BTreeMap::new();
        for definition in &definitions {
            let port = definition.port.unwrap_or(self.server.port_start);
            let instrument =
                Instrument::new(definition, port, &self.engine, self.events.clone())?;
            info!(
                instrument = %instrument.id(),
                name = %instrument.name(),
                port,
                rules = instrument.rule_count(),
                "Loaded instrument"
            );
            loaded.insert(instrument.id().to_string(), Arc::new(instrument));
        }

        self.stop_all().await?;
        let count = loaded.len();
        *self.instruments.write().await = loaded;
        info!(instruments = count, "Registry replaced");
        Ok(count)
    }

    /// Loads a CSV command table, replacing the registry.
    pub async fn load_table(&self, path: impl AsRef<Path>) -> AppResult<usize> {
        let definitions = crate::config::load_table(path)?;
        self.load(definitions).await
    }

    /// Looks an instrument up by id or name.
    pub async fn resolve(&self, name: &str) -> AppResult<Arc<Instrument>> {
        let instruments = self.instruments.read().await;
        let key = name.trim();
        instruments
            .get(key)
            .or_else(|| instruments.get(&instrument_id(key)))
            .or_else(|| {
                instruments
                    .values()
                    .find(|i| i.name().eq_ignore_ascii_case(key))
            })
            .cloned()
            .ok_or_else(|| EmulatorError::UnknownInstrument(key.to_string()))
    }

    /// Loaded instrument ids, sorted.
    pub async fn list(&self) -> Vec<String> {
        self.instruments.read().await.keys().cloned().collect()
    }

    /// Binds the instrument's listener and returns the bound address.
    pub async fn start_instrument(&self, name: &str) -> AppResult<SocketAddr> {
        let instrument = self.resolve(name).await?;
        let mut running = self.running.lock().await;
        if running.contains_key(instrument.id()) {
            return Err(EmulatorError::AlreadyRunning(instrument.name().to_string()));
        }
        let server = InstrumentServer::start(
            instrument.clone(),
            &self.server.host,
            SessionSettings::from(&self.server),
        )
        .await?;
        let addr = server.local_addr();
        running.insert(instrument.id().to_string(), server);
        Ok(addr)
    }

    /// Closes the listener and its sessions. Instrument state is kept.
    pub async fn stop_instrument(&self, name: &str) -> AppResult<()> {
        let instrument = self.resolve(name).await?;
        let server = self
            .running
            .lock()
            .await
            .remove(instrument.id())
            .ok_or_else(|| EmulatorError::NotRunning(instrument.name().to_string()))?;
        server.stop().await
    }

    /// Stops the instrument if it is running, then starts it again.
    pub async fn restart_instrument(&self, name: &str) -> AppResult<SocketAddr> {
        match self.stop_instrument(name).await {
            Ok(()) | Err(EmulatorError::NotRunning(_)) => {}
            Err(e) => return Err(e),
        }
        self.start_instrument(name).await
    }

    /// Starts every stopped instrument. Succeeds if at least one instrument
    /// is running afterwards; individual failures are logged.
    pub async fn start_all(&self) -> AppResult<Vec<SocketAddr>> {
        let ids = self.list().await;
        let mut started = Vec::new();
        let mut failures = Vec::new();

        for id in &ids {
            match self.start_instrument(id).await {
                Ok(addr) => started.push(addr),
                Err(EmulatorError::AlreadyRunning(_)) => {}
                Err(e) => {
                    error!(instrument = %id, error = %e, "Failed to start");
                    failures.push(e);
                }
            }
        }

        let running = self.running.lock().await.len();
        info!(
            started = started.len(),
            failed = failures.len(),
            running,
            "Start all"
        );
        if running == 0 && !failures.is_empty() {
            return Err(EmulatorError::NothingStarted(failures));
        }
        Ok(started)
    }

    /// Stops every running server concurrently.
    pub async fn stop_all(&self) -> AppResult<()> {
        let servers: Vec<InstrumentServer> = self
            .running
            .lock()
            .await
            .drain()
            .map(|(_, server)| server)
            .collect();
        if servers.is_empty() {
            return Ok(());
        }

        let errors: Vec<EmulatorError> = join_all(servers.into_iter().map(InstrumentServer::stop))
            .await
            .into_iter()
            .filter_map(Result::err)
            .collect();

        if errors.is_empty() {
            Ok(())
        } else {
            warn!(failures = errors.len(), "Some servers did not stop cleanly");
            Err(EmulatorError::ShutdownFailed(errors))
        }
    }

    /// Runs `line` on the instrument as if a client had sent it. Works
    /// whether or not the instrument is listening.
    pub async fn send_command(&self, name: &str, line: &str) -> AppResult<String> {
        let instrument = self.resolve(name).await?;
        Ok(instrument.process(line, CONTROL_SOURCE))
    }

    /// Explicit device clear.
    pub async fn device_clear(&self, name: &str) -> AppResult<()> {
        self.resolve(name).await?.device_clear();
        Ok(())
    }

    /// Whether the instrument has a listener up.
    pub async fn is_running(&self, name: &str) -> AppResult<bool> {
        let instrument = self.resolve(name).await?;
        Ok(self.running.lock().await.contains_key(instrument.id()))
    }

    /// Bound address of a running instrument.
    pub async fn local_addr(&self, name: &str) -> AppResult<SocketAddr> {
        let instrument = self.resolve(name).await?;
        self.running
            .lock()
            .await
            .get(instrument.id())
            .map(InstrumentServer::local_addr)
            .ok_or_else(|| EmulatorError::NotRunning(instrument.name().to_string()))
    }

    /// Status of one instrument, running or not.
    pub async fn status(&self, name: &str) -> AppResult<InstrumentStatus> {
        let instrument = self.resolve(name).await?;
        let running = self.running.lock().await;
        Ok(status_of(&instrument, running.get(instrument.id())))
    }

    /// Status of every loaded instrument, ordered by port.
    pub async fn statuses(&self) -> Vec<InstrumentStatus> {
        let instruments = self.instruments.read().await;
        let running = self.running.lock().await;
        let mut statuses: Vec<_> = instruments
            .values()
            .map(|i| status_of(i, running.get(i.id())))
            .collect();
        statuses.sort_by(|a, b| a.port.cmp(&b.port).then_with(|| a.id.cmp(&b.id)));
        statuses
    }
}

fn status_of(instrument: &Instrument, server: Option<&InstrumentServer>) -> InstrumentStatus {
    InstrumentStatus {
        name: instrument.name().to_string(),
        id: instrument.id().to_string(),
        port: server.map_or(instrument.port(), |s| s.local_addr().port()),
        running: server.is_some(),
        uptime: server.map(InstrumentServer::uptime),
        command_count: instrument.command_count(),
        clients: server.map_or(0, InstrumentServer::clients),
        queued_errors: instrument.queued_errors(),
        state: instrument.state_snapshot(),
    }
}
