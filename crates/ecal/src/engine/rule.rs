//! Sink rules and event matching.
//!
//! A rule matches an event when one of its `kindmatch` patterns matches the
//! event's full kind path (component count equal, every component glob
//! matching) and every `statematch` entry matches the stringified state
//! value under its key. Glob components are compiled to anchored regexes at
//! registration time.

use std::sync::Arc;

use regex::Regex;

use crate::{
    ast::AstNode,
    engine::Event,
    errors::{ErrorKind, EvalResult, RuntimeError},
    value::{ValueMap, map_get},
};

/// A registered sink rule.
pub struct Rule {
    pub name: String,
    pub kind_match: Vec<String>,
    pub state_match: Option<ValueMap>,
    pub suppresses: Vec<String>,
    pub priority: i64,
    /// The sink body. Rules registered by host code without a script body
    /// carry no AST and match only.
    pub(crate) body: Option<Arc<AstNode>>,
    kind_regex: Vec<Vec<Regex>>,
    state_regex: Vec<(String, Regex)>,
}

impl Rule {
    /// Builds a rule, compiling all glob patterns.
    pub fn new(
        name: impl Into<String>,
        kind_match: Vec<String>,
        state_match: Option<ValueMap>,
        suppresses: Vec<String>,
        priority: i64,
        body: Option<Arc<AstNode>>,
    ) -> EvalResult<Self> {
        let name = name.into();
        let mut kind_regex = Vec::with_capacity(kind_match.len());
        for pattern in &kind_match {
            let components: EvalResult<Vec<Regex>> = pattern
                .split('.')
                .map(|component| compile_glob(&name, component))
                .collect();
            kind_regex.push(components?);
        }
        let mut state_regex = Vec::new();
        if let Some(state) = &state_match {
            for (key, glob) in state {
                state_regex.push((key.to_string(), compile_glob(&name, &glob.to_string())?));
            }
        }
        Ok(Self {
            name,
            kind_match,
            state_match,
            suppresses,
            priority,
            body,
            kind_regex,
            state_regex,
        })
    }

    /// True when the event's kind path and state match this rule.
    pub fn matches(&self, event: &Event) -> bool {
        self.matches_kind(event.kind()) && self.matches_state(event.state())
    }

    fn matches_kind(&self, kind: &[String]) -> bool {
        self.kind_regex.iter().any(|components| {
            components.len() == kind.len()
                && components
                    .iter()
                    .zip(kind)
                    .all(|(regex, component)| regex.is_match(component))
        })
    }

    fn matches_state(&self, state: &ValueMap) -> bool {
        self.state_regex.iter().all(|(key, regex)| {
            map_get(state, key).is_some_and(|value| regex.is_match(&value.to_string()))
        })
    }
}

impl std::fmt::Debug for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rule")
            .field("name", &self.name)
            .field("kind_match", &self.kind_match)
            .field("suppresses", &self.suppresses)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

/// Translates one glob component (`*`, `?`, `[...]` classes) into an
/// anchored regex.
fn compile_glob(rule: &str, glob: &str) -> EvalResult<Regex> {
    let mut pattern = String::from("^");
    let mut chars = glob.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => pattern.push_str(".*"),
            '?' => pattern.push('.'),
            '[' => {
                pattern.push('[');
                if chars.peek() == Some(&'!') {
                    chars.next();
                    pattern.push('^');
                }
                for class_char in chars.by_ref() {
                    if class_char == ']' {
                        break;
                    }
                    pattern.push(class_char);
                }
                pattern.push(']');
            }
            c => pattern.push_str(&regex::escape(&c.to_string())),
        }
    }
    pattern.push('$');
    Regex::new(&pattern).map_err(|err| {
        RuntimeError::new(
            ErrorKind::InvalidState,
            format!("Invalid match pattern in rule {rule}: {err}"),
        )
    })
}

/// Orders matching rules by descending priority (ties break by ascending
/// name) and removes suppressed rules.
///
/// Scanning from the highest priority down, each surviving rule adds its
/// `suppresses` names to a blacklist; later rules on the blacklist are
/// dropped and their own `suppresses` sets are never applied.
pub(crate) fn execution_plan(mut matched: Vec<Arc<Rule>>) -> Vec<Arc<Rule>> {
    matched.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.name.cmp(&b.name))
    });
    let mut blacklist: Vec<&str> = Vec::new();
    let mut plan = Vec::with_capacity(matched.len());
    for rule in &matched {
        if blacklist.contains(&rule.name.as_str()) {
            continue;
        }
        blacklist.extend(rule.suppresses.iter().map(String::as_str));
        plan.push(Arc::clone(rule));
    }
    plan
}
