//! SCPI error model and the bounded per-instrument error queue.
//!
//! Protocol errors are never returned to the caller of `process`; they are
//! pushed here and retrieved by the client with `SYST:ERR?`.

use std::collections::VecDeque;
use thiserror::Error;

/// Default number of entries kept before overflow handling kicks in.
pub const DEFAULT_ERROR_QUEUE_CAPACITY: usize = 32;

/// Smallest capacity that can hold one error plus the overflow sentinel.
pub const MIN_ERROR_QUEUE_CAPACITY: usize = 2;

/// Response to `SYST:ERR?` when nothing is queued.
pub const NO_ERROR: &str = "0,\"No error\"";

/// A SCPI error record.
///
/// `Display` renders the wire form, `<code>,"<message>"`, exactly as
/// `SYST:ERR?` returns it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScpiError {
    /// Parameter could not be interpreted as the expected data type.
    #[error("-104,\"Data type error;{0}\"")]
    DataType(String),

    /// A command that requires a parameter was sent without one.
    #[error("-109,\"Missing parameter\"")]
    MissingParameter,

    /// No rule or built-in matched the command header.
    #[error("-113,\"Undefined header\"")]
    UndefinedHeader,

    /// Numeric parameter outside the configured range.
    #[error("-222,\"Data out of range;{0}\"")]
    DataOutOfRange(String),

    /// Parameter not in the enumerated/boolean set.
    #[error("-224,\"Illegal parameter value\"")]
    IllegalParameterValue,

    /// Queue capacity exceeded; older entries were discarded.
    #[error("-350,\"Queue overflow\"")]
    QueueOverflow,
}

impl ScpiError {
    /// Numeric SCPI error code.
    #[must_use]
    pub fn code(&self) -> i32 {
        match self {
            ScpiError::DataType(_) => -104,
            ScpiError::MissingParameter => -109,
            ScpiError::UndefinedHeader => -113,
            ScpiError::DataOutOfRange(_) => -222,
            ScpiError::IllegalParameterValue => -224,
            ScpiError::QueueOverflow => -350,
        }
    }

    /// IEEE-488.2 Standard Event Status Register bit raised by this error class.
    #[must_use]
    pub fn esr_bit(&self) -> u8 {
        match self.code() {
            -199..=-100 => super::status::ESR_COMMAND_ERROR,
            -299..=-200 => super::status::ESR_EXECUTION_ERROR,
            -399..=-300 => super::status::ESR_DEVICE_ERROR,
            -499..=-400 => super::status::ESR_QUERY_ERROR,
            _ => 0,
        }
    }
}

/// Bounded FIFO of [`ScpiError`].
///
/// On overflow the oldest entries are evicted so that the incoming error and a
/// single trailing [`ScpiError::QueueOverflow`] sentinel fit in the queue.
#[derive(Debug, Clone)]
pub struct ErrorQueue {
    entries: VecDeque<ScpiError>,
    capacity: usize,
}

impl ErrorQueue {
    /// Creates a queue; capacities below [`MIN_ERROR_QUEUE_CAPACITY`] are raised to it.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(MIN_ERROR_QUEUE_CAPACITY);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Queues an error. A full queue drops its oldest entries and ends with `-350`.
    pub fn push(&mut self, error: ScpiError) {
        if self.entries.len() < self.capacity {
            self.entries.push_back(error);
            return;
        }

        // Keep at most one sentinel, always as the newest entry.
        if self.entries.back() == Some(&ScpiError::QueueOverflow) {
            self.entries.pop_back();
        }
        while self.entries.len() > self.capacity - 2 {
            self.entries.pop_front();
        }
        self.entries.push_back(error);
        self.entries.push_back(ScpiError::QueueOverflow);
    }

    /// Removes and returns the oldest error.
    pub fn pop(&mut self) -> Option<ScpiError> {
        self.entries.pop_front()
    }

    /// Pops the oldest error in wire form, or `0,"No error"`.
    pub fn next_message(&mut self) -> String {
        self.pop()
            .map(|e| e.to_string())
            .unwrap_or_else(|| NO_ERROR.to_string())
    }

    /// Drops every queued error.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Queued errors, the overflow marker included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when `SYST:ERR?` would answer `0,"No error"`.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maximum entries held.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Newest queued error, without removing it.
    #[must_use]
    pub fn latest(&self) -> Option<&ScpiError> {
        self.entries.back()
    }
}

impl Default for ErrorQueue {
    fn default() -> Self {
        Self::new(DEFAULT_ERROR_QUEUE_CAPACITY)
    }
}
