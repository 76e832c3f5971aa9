//! Command rules and the ordered command table.
//!
//! A table is built once from configuration and is immutable afterwards.
//! Building it also derives the stateful SET/QUERY links, the validation
//! store and the default values.

use super::validation::{ValidationRule, ValidationStore};
use crate::error::{AppResult, EmulatorError};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use strfmt::strfmt;
use tracing::warn;

/// Placeholder accepted in patterns as shorthand for a wildcard capture.
pub const VALUE_PLACEHOLDER: &str = "{value}";

const WILDCARD_GROUP: &str = "(.+)";

/// One row of an instrument's command table, as configured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandDefinition {
    /// Pattern: literal SCPI text with at most one parenthesised capture group.
    pub command: String,
    /// Response template; `{value}` is replaced with the parameter or state value.
    pub response: String,
    /// `range:<min>,<max>`, `enum:<a>,<b>,...`, `bool` or empty.
    #[serde(default)]
    pub validation: String,
}

impl CommandDefinition {
    /// A raw rule as written in the table.
    #[must_use]
    pub fn new(
        command: impl Into<String>,
        response: impl Into<String>,
        validation: impl Into<String>,
    ) -> Self {
        Self {
            command: command.into(),
            response: response.into(),
            validation: validation.into(),
        }
    }
}

/// What a rule does when it matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RuleKind {
    /// Captures a parameter and writes it to state.
    Set,
    /// Argument-less query; reads state when linked.
    Query,
    /// Canned response.
    Fixed,
}

/// A compiled pattern-to-response mapping.
#[derive(Debug, Clone)]
pub struct CommandRule {
    pattern: String,
    regex: Regex,
    response: String,
    kind: RuleKind,
    state_key: Option<String>,
}

impl CommandRule {
    /// Compiles a single definition. Linking happens in [`CommandTable::build`].
    pub fn compile(definition: &CommandDefinition) -> AppResult<Self> {
        let pattern = definition
            .command
            .trim()
            .replace(VALUE_PLACEHOLDER, WILDCARD_GROUP);
        if pattern.is_empty() {
            return Err(invalid_pattern(&definition.command, "empty pattern"));
        }

        let body = translate_pattern(&pattern)?;
        let regex = RegexBuilder::new(&format!("^(?:{body})$"))
            .case_insensitive(true)
            .build()
            .map_err(|e| invalid_pattern(&pattern, &e.to_string()))?;

        let kind = match regex.captures_len() - 1 {
            0 if pattern.ends_with('?') => RuleKind::Query,
            0 => RuleKind::Fixed,
            1 => RuleKind::Set,
            _ => {
                return Err(invalid_pattern(
                    &pattern,
                    "at most one capturing group is allowed",
                ))
            }
        };

        let state_key = match kind {
            RuleKind::Set => Some(base_token(&pattern, kind)),
            _ => None,
        };

        Ok(Self {
            pattern,
            regex,
            response: definition.response.trim().to_string(),
            kind,
            state_key,
        })
    }

    /// The pattern as configured, before anchoring.
    #[must_use]
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Response template.
    #[must_use]
    pub fn response(&self) -> &str {
        &self.response
    }

    /// How the rule treats state.
    #[must_use]
    pub fn kind(&self) -> RuleKind {
        self.kind
    }

    /// Variable this rule reads or writes.
    #[must_use]
    pub fn state_key(&self) -> Option<&str> {
        self.state_key.as_deref()
    }

    /// Matches the whole (trimmed) command line.
    ///
    /// Returns `Some(parameter)` on a match. A Set rule whose captured
    /// parameter starts with `?` does not match, so a wildcard can never
    /// consume the query form of the same header.
    #[must_use]
    pub fn match_line(&self, line: &str) -> Option<Option<String>> {
        let caps = self.regex.captures(line)?;
        match self.kind {
            RuleKind::Set => {
                let param = caps.get(1)?.as_str().trim();
                if param.is_empty() || param.starts_with('?') {
                    return None;
                }
                Some(Some(param.to_string()))
            }
            RuleKind::Query | RuleKind::Fixed => Some(None),
        }
    }
}

/// The ordered rule list plus everything derived from it at load time.
#[derive(Debug, Clone, Default)]
pub struct CommandTable {
    rules: Vec<CommandRule>,
    validations: ValidationStore,
    defaults: HashMap<String, String>,
}

impl CommandTable {
    /// Compiles `definitions` in order and links SET/QUERY pairs.
    pub fn build(definitions: &[CommandDefinition]) -> AppResult<Self> {
        let mut rules = Vec::with_capacity(definitions.len());
        let mut validations = ValidationStore::new();

        for definition in definitions {
            let rule = CommandRule::compile(definition)?;
            let validation = ValidationRule::parse(&definition.validation)?;

            match rule.state_key() {
                Some(key) => {
                    if !validations.register(key, validation) {
                        warn!(
                            pattern = %rule.pattern(),
                            "validation for '{}' already defined; keeping the first", key
                        );
                    }
                }
                None if !validation.is_none() => {
                    warn!(
                        pattern = %rule.pattern(),
                        "validation ignored on a rule without a parameter"
                    );
                }
                None => {}
            }
            rules.push(rule);
        }

        let set_keys: HashSet<String> = rules
            .iter()
            .filter_map(|r| r.state_key().map(str::to_string))
            .collect();

        let mut defaults = HashMap::new();
        for rule in rules.iter_mut().filter(|r| r.kind == RuleKind::Query) {
            let base = base_token(&rule.pattern, RuleKind::Query);
            if !set_keys.contains(&base) {
                continue;
            }
            defaults.entry(base.clone()).or_insert_with(|| {
                if has_placeholder(&rule.response) {
                    "0".to_string()
                } else {
                    rule.response.clone()
                }
            });
            rule.state_key = Some(base);
        }

        Ok(Self {
            rules,
            validations,
            defaults,
        })
    }

    /// Rules in match order.
    #[must_use]
    pub fn rules(&self) -> &[CommandRule] {
        &self.rules
    }

    /// Validation rules per state key.
    #[must_use]
    pub fn validations(&self) -> &ValidationStore {
        &self.validations
    }

    /// Load-time value of every stateful variable.
    #[must_use]
    pub fn defaults(&self) -> &HashMap<String, String> {
        &self.defaults
    }

    /// Number of rules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// True for a table with no rules.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// First rule matching `line`, in configured order.
    #[must_use]
    pub fn find(&self, line: &str) -> Option<(&CommandRule, Option<String>)> {
        self.rules
            .iter()
            .find_map(|rule| rule.match_line(line).map(|param| (rule, param)))
    }
}

/// Renders a response template with `{value}` / `{param1}` bound to `value`.
///
/// Templates that don't format cleanly are returned verbatim.
#[must_use]
pub fn render_template(template: &str, value: &str) -> String {
    if !template.contains('{') {
        return template.to_string();
    }
    let vars = HashMap::from([
        ("value".to_string(), value.to_string()),
        ("param1".to_string(), value.to_string()),
    ]);
    strfmt(template, &vars).unwrap_or_else(|_| template.to_string())
}

pub(crate) fn has_placeholder(template: &str) -> bool {
    template.contains("{value}") || template.contains("{param1}")
}

/// Shared base token of a SET/QUERY pair, uppercased.
///
/// Set: the pattern with its capture group removed. Query: the pattern
/// without the trailing `?`.
#[must_use]
pub fn base_token(pattern: &str, kind: RuleKind) -> String {
    let stripped = match kind {
        RuleKind::Set => strip_groups(pattern),
        RuleKind::Query => pattern.trim().trim_end_matches('?').to_string(),
        RuleKind::Fixed => pattern.to_string(),
    };
    stripped
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_ascii_uppercase()
}

fn strip_groups(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    let mut depth = 0usize;
    let mut escaped = false;
    for c in pattern.chars() {
        if depth > 0 {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '(' => depth += 1,
                ')' => depth -= 1,
                _ => {}
            }
        } else if c == '(' {
            depth = 1;
        } else {
            out.push(c);
        }
    }
    out
}

/// Escapes literal text and keeps parenthesised groups as regular expressions.
/// Whitespace runs in literal text match one or more whitespace characters.
fn translate_pattern(pattern: &str) -> AppResult<String> {
    let mut out = String::with_capacity(pattern.len() * 2);
    let mut chars = pattern.chars();
    let mut in_space = false;

    while let Some(c) = chars.next() {
        if c == '(' {
            in_space = false;
            let mut group = String::from("(");
            let mut depth = 1usize;
            let mut escaped = false;
            for g in chars.by_ref() {
                group.push(g);
                match g {
                    _ if escaped => escaped = false,
                    '\\' => escaped = true,
                    '(' => depth += 1,
                    ')' => {
                        depth -= 1;
                        if depth == 0 {
                            break;
                        }
                    }
                    _ => {}
                }
            }
            if depth != 0 {
                return Err(invalid_pattern(pattern, "unbalanced parenthesis"));
            }
            out.push_str(&group);
        } else if c.is_whitespace() {
            if !in_space {
                out.push_str(r"\s+");
                in_space = true;
            }
        } else {
            in_space = false;
            out.push_str(&regex::escape(c.encode_utf8(&mut [0u8; 4])));
        }
    }

    Ok(out)
}

fn invalid_pattern(pattern: &str, reason: &str) -> EmulatorError {
    EmulatorError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(command: &str, response: &str, validation: &str) -> CommandDefinition {
        CommandDefinition::new(command, response, validation)
    }

    #[test]
    fn test_rule_kinds() {
        let set = CommandRule::compile(&def("VOLT (.+)", "OK", "")).unwrap();
        let query = CommandRule::compile(&def("VOLT?", "0.0", "")).unwrap();
        let fixed = CommandRule::compile(&def("OUTP ON", "", "")).unwrap();
        assert_eq!(set.kind(), RuleKind::Set);
        assert_eq!(query.kind(), RuleKind::Query);
        assert_eq!(fixed.kind(), RuleKind::Fixed);
        assert_eq!(set.state_key(), Some("VOLT"));
    }

    #[test]
    fn test_value_placeholder_in_pattern() {
        let rule = CommandRule::compile(&def("CURR {value}", "OK", "")).unwrap();
        assert_eq!(rule.pattern(), "CURR (.+)");
        assert_eq!(rule.match_line("curr 1.5"), Some(Some("1.5".to_string())));
    }

    #[test]
    fn test_literal_text_is_escaped_and_case_insensitive() {
        let rule = CommandRule::compile(&def("MEAS:VOLT:DC?", "1.0", "")).unwrap();
        assert!(rule.match_line("MEAS:VOLT:DC?").is_some());
        assert!(rule.match_line("meas:volt:dc?").is_some());
        // '?' is literal, not a regex quantifier.
        assert!(rule.match_line("MEAS:VOLT:D").is_none());
        assert!(rule.match_line("MEAS:VOLT:DC").is_none());
        assert!(rule.match_line("MEAS:VOLT:DC? extra").is_none());
    }

    #[test]
    fn test_star_commands_are_literal() {
        let rule = CommandRule::compile(&def("*TRG", "", "")).unwrap();
        assert!(rule.match_line("*trg").is_some());
        assert!(rule.match_line("TRG").is_none());
    }

    #[test]
    fn test_whitespace_runs_are_flexible() {
        let rule = CommandRule::compile(&def("VOLT (.+)", "OK", "")).unwrap();
        assert_eq!(rule.match_line("VOLT    5"), Some(Some("5".to_string())));
    }

    #[test]
    fn test_wildcard_never_swallows_query() {
        let spaced = CommandRule::compile(&def("VOLT (.+)", "OK", "")).unwrap();
        let glued = CommandRule::compile(&def("VOLT(.+)", "OK", "")).unwrap();
        assert!(spaced.match_line("VOLT?").is_none());
        assert!(glued.match_line("VOLT?").is_none());
        assert_eq!(glued.match_line("VOLT5"), Some(Some("5".to_string())));
    }

    #[test]
    fn test_custom_group_regex() {
        let rule = CommandRule::compile(&def(r"FREQ (\d+(?:\.\d+)?)", "OK", "")).unwrap();
        assert_eq!(rule.kind(), RuleKind::Set);
        assert_eq!(rule.state_key(), Some("FREQ"));
        assert!(rule.match_line("FREQ 1000.5").is_some());
        assert!(rule.match_line("FREQ abc").is_none());
    }

    #[test]
    fn test_rejects_bad_patterns() {
        assert!(CommandRule::compile(&def("A (.+) B (.+)", "", "")).is_err());
        assert!(CommandRule::compile(&def("VOLT (.+", "", "")).is_err());
        assert!(CommandRule::compile(&def("   ", "", "")).is_err());
    }

    #[test]
    fn test_base_token_derivation() {
        assert_eq!(base_token("volt (.+)", RuleKind::Set), "VOLT");
        assert_eq!(base_token("SOUR:VOLT(.+)", RuleKind::Set), "SOUR:VOLT");
        assert_eq!(base_token("sour:volt?", RuleKind::Query), "SOUR:VOLT");
    }

    #[test]
    fn test_table_links_pairs_case_insensitively() {
        let table = CommandTable::build(&[
            def("volt (.+)", "OK", "range:0,30"),
            def("VOLT?", "0.0", ""),
            def("MEAS:CURR?", "0.001", ""),
        ])
        .unwrap();

        let query = &table.rules()[1];
        assert_eq!(query.state_key(), Some("VOLT"));
        assert_eq!(table.rules()[2].state_key(), None);
        assert_eq!(table.defaults().get("VOLT").map(String::as_str), Some("0.0"));
        assert_eq!(
            table.validations().get("VOLT"),
            Some(&ValidationRule::Range { min: 0.0, max: 30.0 })
        );
    }

    #[test]
    fn test_table_default_with_placeholder_falls_back_to_zero() {
        let table = CommandTable::build(&[
            def("FUNC (.+)", "OK", "enum:DC,AC"),
            def("FUNC?", "{value}", ""),
        ])
        .unwrap();
        assert_eq!(table.defaults().get("FUNC").map(String::as_str), Some("0"));
    }

    #[test]
    fn test_table_rejects_bad_validation() {
        let err = CommandTable::build(&[def("VOLT (.+)", "OK", "range:x")]).unwrap_err();
        assert!(matches!(err, EmulatorError::InvalidValidation { .. }));
    }

    #[test]
    fn test_find_is_first_match_in_order() {
        let table = CommandTable::build(&[
            def("VOLT (.+)", "first", ""),
            def("VOLT 5", "second", ""),
        ])
        .unwrap();
        let (rule, param) = table.find("VOLT 5").unwrap();
        assert_eq!(rule.response(), "first");
        assert_eq!(param.as_deref(), Some("5"));
    }

    #[test]
    fn test_render_template() {
        assert_eq!(render_template("OK", "5"), "OK");
        assert_eq!(render_template("Range OK: {value}", "5"), "Range OK: 5");
        assert_eq!(render_template("P={param1}", "7"), "P=7");
        assert_eq!(render_template("{unknown}", "7"), "{unknown}");
    }
}
