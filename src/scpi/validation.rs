//! Parameter validation rules and the store that owns them.
//!
//! Rules are kept in a [`ValidationStore`] keyed by state key rather than on
//! the command rules themselves. Resetting instrument state or rebuilding the
//! engine's runtime state never touches this store, so validation can't be
//! lost by a device clear.

use super::error_queue::ScpiError;
use crate::error::{AppResult, EmulatorError};
use std::collections::HashMap;
use std::fmt;

/// A predicate over a raw parameter string.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationRule {
    /// Accept anything.
    None,
    /// Inclusive numeric range. `MIN`/`MAX` keywords resolve to the bounds.
    Range { min: f64, max: f64 },
    /// One of the listed tokens, compared case-insensitively.
    Enum { allowed: Vec<String> },
    /// `ON|OFF|1|0`, case-insensitive.
    Boolean,
}

impl ValidationRule {
    /// Parses a table validation spec: `range:<min>,<max>`, `enum:<a>,<b>,...`,
    /// `bool`, or empty.
    pub fn parse(spec: &str) -> AppResult<Self> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Ok(ValidationRule::None);
        }

        let (kind, args) = match spec.split_once(':') {
            Some((kind, args)) => (kind.trim().to_ascii_lowercase(), args.trim()),
            None => (spec.to_ascii_lowercase(), ""),
        };

        match kind.as_str() {
            "range" => {
                let (min, max) = args.split_once(',').ok_or_else(|| {
                    invalid(spec, "expected range:<min>,<max>")
                })?;
                let min: f64 = min
                    .trim()
                    .parse()
                    .map_err(|_| invalid(spec, "minimum is not a number"))?;
                let max: f64 = max
                    .trim()
                    .parse()
                    .map_err(|_| invalid(spec, "maximum is not a number"))?;
                if min.is_nan() || max.is_nan() || min > max {
                    return Err(invalid(spec, "minimum exceeds maximum"));
                }
                Ok(ValidationRule::Range { min, max })
            }
            "enum" => {
                let allowed: Vec<String> = args
                    .split(',')
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty())
                    .collect();
                if allowed.is_empty() {
                    return Err(invalid(spec, "enum needs at least one value"));
                }
                Ok(ValidationRule::Enum { allowed })
            }
            "bool" | "boolean" if args.is_empty() => Ok(ValidationRule::Boolean),
            _ => Err(invalid(spec, "unknown validation kind")),
        }
    }

    /// True for the rule that accepts anything.
    #[must_use]
    pub fn is_none(&self) -> bool {
        matches!(self, ValidationRule::None)
    }

    /// Checks `param` and returns the value to store.
    ///
    /// Range values are kept as sent (keywords become the bound), enum values
    /// take the configured spelling and booleans become `1`/`0`.
    pub fn check(&self, param: &str) -> Result<String, ScpiError> {
        let param = param.trim();
        match self {
            ValidationRule::None => Ok(param.to_string()),
            ValidationRule::Range { min, max } => {
                if param.eq_ignore_ascii_case("MIN") {
                    return Ok(min.to_string());
                }
                if param.eq_ignore_ascii_case("MAX") {
                    return Ok(max.to_string());
                }
                let value: f64 = param
                    .parse()
                    .map_err(|_| ScpiError::DataType(param.to_string()))?;
                if (*min..=*max).contains(&value) {
                    Ok(param.to_string())
                } else {
                    Err(ScpiError::DataOutOfRange(param.to_string()))
                }
            }
            ValidationRule::Enum { allowed } => allowed
                .iter()
                .find(|v| v.eq_ignore_ascii_case(param))
                .cloned()
                .ok_or(ScpiError::IllegalParameterValue),
            ValidationRule::Boolean => match param.to_ascii_uppercase().as_str() {
                "ON" | "1" => Ok("1".to_string()),
                "OFF" | "0" => Ok("0".to_string()),
                _ => Err(ScpiError::IllegalParameterValue),
            },
        }
    }
}

impl fmt::Display for ValidationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationRule::None => Ok(()),
            ValidationRule::Range { min, max } => write!(f, "range:{min},{max}"),
            ValidationRule::Enum { allowed } => write!(f, "enum:{}", allowed.join(",")),
            ValidationRule::Boolean => write!(f, "bool"),
        }
    }
}

fn invalid(spec: &str, reason: &str) -> EmulatorError {
    EmulatorError::InvalidValidation {
        spec: spec.to_string(),
        reason: reason.to_string(),
    }
}

/// Validation rules keyed by state key.
#[derive(Debug, Clone, Default)]
pub struct ValidationStore {
    rules: HashMap<String, ValidationRule>,
}

impl ValidationStore {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a rule for `key`. The first non-empty rule for a key wins;
    /// returns `false` when an existing rule was kept.
    pub fn register(&mut self, key: &str, rule: ValidationRule) -> bool {
        match self.rules.get(key) {
            Some(existing) if !existing.is_none() => false,
            _ => {
                self.rules.insert(key.to_string(), rule);
                true
            }
        }
    }

    /// Rule registered for `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&ValidationRule> {
        self.rules.get(key)
    }

    /// Validates `param` against the rule for `key`; unknown keys accept anything.
    pub fn check(&self, key: &str, param: &str) -> Result<String, ScpiError> {
        match self.rules.get(key) {
            Some(rule) => rule.check(param),
            None => Ok(param.trim().to_string()),
        }
    }

    /// Number of keys with a rule.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// True when no key has a rule.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
