//! Custom error types for the emulator.
//!
//! `EmulatorError` covers everything that can go wrong outside the SCPI
//! protocol itself: loading configuration and command tables, compiling
//! patterns, binding listeners and looking up instruments.
//!
//! Protocol-level failures (unknown headers, out-of-range parameters) are
//! *not* represented here. They are [`crate::scpi::ScpiError`] values that go
//! into the instrument's error queue and never abort processing.
//!
//! Variants wrap their sources with `#[from]` where a conversion is
//! unambiguous, so the `?` operator works across the crate.

use std::net::SocketAddr;
use thiserror::Error;

/// Convenience alias for results using the emulator error type.
pub type AppResult<T> = std::result::Result<T, EmulatorError>;

/// Errors outside the SCPI protocol.
#[derive(Error, Debug)]
pub enum EmulatorError {
    /// Configuration could not be extracted.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration parsed but is not usable.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed CSV.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Command table is structurally unusable or of an unsupported type.
    #[error("Command table error: {0}")]
    Table(String),

    /// A command pattern is not a valid regex.
    #[error("Invalid command pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// A validation column could not be parsed.
    #[error("Invalid validation '{spec}': {reason}")]
    InvalidValidation { spec: String, reason: String },

    /// A listener could not bind its address.
    #[error("Instrument '{instrument}' failed to bind {addr}: {source}")]
    Bind {
        instrument: String,
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// No instrument has this id or name.
    #[error("Unknown instrument '{0}'")]
    UnknownInstrument(String),

    #[error("Instrument '{0}' is already running")]
    AlreadyRunning(String),

    /// Stop or address lookup for a stopped instrument.
    #[error("Instrument '{0}' is not running")]
    NotRunning(String),

    /// `start_all` left no instrument running.
    #[error("No instrument could be started")]
    NothingStarted(Vec<EmulatorError>),

    /// One or more listeners failed to stop.
    #[error("Shutdown failed with errors")]
    ShutdownFailed(Vec<EmulatorError>),
}

impl From<figment::Error> for EmulatorError {
    fn from(value: figment::Error) -> Self {
        EmulatorError::Config(Box::new(value))
    }
}

impl EmulatorError {
    /// Whether the caller can keep going (e.g. skip one instrument) after this error.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            EmulatorError::Bind { .. }
                | EmulatorError::UnknownInstrument(_)
                | EmulatorError::AlreadyRunning(_)
                | EmulatorError::NotRunning(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_error_names_instrument_and_address() {
        let err = EmulatorError::Bind {
            instrument: "Test PSU".into(),
            addr: "127.0.0.1:5555".parse().unwrap(),
            source: std::io::Error::from(std::io::ErrorKind::AddrInUse),
        };
        let msg = err.to_string();
        assert!(msg.contains("Test PSU"));
        assert!(msg.contains("127.0.0.1:5555"));
        assert!(err.is_recoverable());
    }

    #[test]
    fn io_error_converts_with_question_mark() {
        fn read() -> AppResult<()> {
            Err(std::io::Error::from(std::io::ErrorKind::NotFound))?;
            Ok(())
        }
        assert!(matches!(read(), Err(EmulatorError::Io(_))));
    }

    #[test]
    fn nothing_started_is_fatal() {
        let err = EmulatorError::NothingStarted(vec![EmulatorError::UnknownInstrument(
            "x".into(),
        )]);
        assert!(!err.is_recoverable());
    }
}
