//! Table-driven SCPI command processing.
//!
//! An instrument's behaviour is an ordered list of [`CommandRule`]s compiled
//! from configuration. The [`CommandEngine`] matches incoming lines against
//! them, keeps stateful values in an [`InstrumentState`], validates parameters
//! through a [`ValidationStore`] and reports protocol errors through the
//! [`ErrorQueue`] that `SYST:ERR?` drains.
//!
//! Nothing in this module performs I/O.

pub mod engine;
pub mod error_queue;
pub mod rule;
pub mod state;
pub mod status;
pub mod validation;

pub use engine::{CommandEngine, EngineSettings, Reply};
pub use error_queue::{ErrorQueue, ScpiError, NO_ERROR};
pub use rule::{render_template, CommandDefinition, CommandRule, CommandTable, RuleKind};
pub use state::InstrumentState;
pub use status::StatusRegisters;
pub use validation::{ValidationRule, ValidationStore};
