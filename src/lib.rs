//! # SCPI Instrument Emulator
//!
//! Emulates SCPI-speaking lab instruments over TCP from a declarative command
//! table, so that client software (VISA drivers, LabVIEW VIs, test scripts)
//! can be exercised without hardware.
//!
//! ## Crate Structure
//!
//! - **`scpi`**: the synchronous engine. Ordered first-match command rules,
//!   stateful SET/QUERY pairs, parameter validation, the SCPI error queue and
//!   IEEE-488.2 common commands and status registers.
//! - **`instrument`**: one named engine shared by every connection on its port.
//! - **`network`**: per-instrument TCP listeners, per-connection sessions with
//!   line framing, and the `ServerManager` that owns instrument lifecycles.
//! - **`config`**: Figment-based configuration and CSV command-table loading.
//! - **`events`** / **`monitor`**: command traffic events and the in-memory
//!   command log fed from them.
//! - **`logging`**: `tracing-subscriber` initialisation.
//! - **`shell`**: the interactive console.
//! - **`error`**: the `EmulatorError` type for everything outside the SCPI
//!   protocol itself.
//!
//! ## Example
//!
//! ```
//! use scpi_emulator::config::InstrumentDefinition;
//! use scpi_emulator::events::EventBus;
//! use scpi_emulator::instrument::Instrument;
//! use scpi_emulator::scpi::EngineSettings;
//!
//! let psu = InstrumentDefinition::new("Bench PSU")
//!     .with_command("VOLT (.+)", "OK", "range:0,30")
//!     .with_command("VOLT?", "0.0", "");
//! let psu = Instrument::new(&psu, 0, &EngineSettings::default(), EventBus::default()).unwrap();
//!
//! assert_eq!(psu.process("VOLT 12", "doc"), "OK");
//! assert_eq!(psu.process("VOLT?", "doc"), "12");
//! assert_eq!(psu.process("VOLT 99", "doc"), "");
//! assert_eq!(psu.process("SYST:ERR?", "doc"), "-222,\"Data out of range;99\"");
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod instrument;
pub mod logging;
pub mod monitor;
pub mod network;
pub mod scpi;
pub mod shell;

pub use error::{AppResult, EmulatorError};
