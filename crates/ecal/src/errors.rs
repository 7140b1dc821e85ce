//! Traceable runtime errors.
//!
//! Every failure the evaluator, scopes, stdlib or event engine can produce is
//! a [`RuntimeError`] with a kind from the closed [`ErrorKind`] set. Four of
//! the kinds are control flow sentinels which steer loops, iterators and
//! function returns; they are caught by their target construct and never
//! surface to callers.

use std::fmt;

use serde::Serialize;
use strum::{Display, IntoStaticStr};

use crate::{
    ast::{AstNode, CodeLoc},
    value::Value,
};

/// Result alias used throughout the evaluator.
pub type EvalResult<T> = Result<T, RuntimeError>;

/// Closed set of runtime error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr, Serialize)]
pub enum ErrorKind {
    #[strum(serialize = "Runtime error")]
    Runtime,
    #[strum(serialize = "Unknown construct")]
    UnknownConstruct,
    #[strum(serialize = "Invalid construct")]
    InvalidConstruct,
    #[strum(serialize = "Invalid state")]
    InvalidState,
    #[strum(serialize = "Cannot access variable")]
    VarAccess,
    #[strum(serialize = "Operand is not a number")]
    NotANumber,
    #[strum(serialize = "Operand is not a boolean")]
    NotABoolean,
    #[strum(serialize = "Operand is not a list")]
    NotAList,
    #[strum(serialize = "Operand is not a map")]
    NotAMap,
    #[strum(serialize = "Operand is not a list or a map")]
    NotAListOrMap,
    #[strum(serialize = "Error in sink")]
    Sink,
    #[strum(serialize = "Fatal error")]
    Fatal,

    // Control flow sentinels. Never surfaced to callers.
    #[strum(serialize = "*return*")]
    Return,
    #[strum(serialize = "*isiterator*")]
    IsIterator,
    #[strum(serialize = "*endofiteration*")]
    EndOfIteration,
    #[strum(serialize = "*continueiteration*")]
    ContinueIteration,
}

impl ErrorKind {
    /// True for the sentinel kinds that steer control flow.
    pub fn is_control_flow(self) -> bool {
        matches!(
            self,
            Self::Return | Self::IsIterator | Self::EndOfIteration | Self::ContinueIteration
        )
    }
}

/// One frame of an error trace: the pretty-printed AST fragment the error
/// passed through, with its position.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceFrame {
    pub node: String,
    pub loc: CodeLoc,
}

/// A runtime error with source position and propagation trace.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeError {
    pub source: String,
    pub kind: ErrorKind,
    pub detail: String,
    pub loc: Option<CodeLoc>,
    pub trace: Vec<TraceFrame>,
    /// Payload of the `Return` sentinel and of iterator steps.
    pub(crate) value: Option<Value>,
}

impl RuntimeError {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            source: String::new(),
            kind,
            detail: detail.into(),
            loc: None,
            trace: Vec::new(),
            value: None,
        }
    }

    /// Attaches the position of `node` and its source name, keeping an
    /// already recorded position (errors keep the innermost location).
    pub fn at_node(mut self, node: &AstNode) -> Self {
        if self.loc.is_none() {
            self.source = node.loc.source.to_string();
            self.loc = Some(node.loc.clone());
        }
        self
    }

    pub(crate) fn with_value(mut self, value: Value) -> Self {
        self.value = Some(value);
        self
    }

    /// Appends a stack trace frame while the error propagates upward.
    pub fn add_trace(&mut self, node: &AstNode) {
        self.trace.push(TraceFrame {
            node: node.describe(),
            loc: node.loc.clone(),
        });
    }

    pub fn is_control_flow(&self) -> bool {
        self.kind.is_control_flow()
    }

    /// The header line plus an indented trace of pretty-printed AST
    /// fragments with `(source:line)` suffixes.
    pub fn format_with_trace(&self) -> String {
        let mut out = self.to_string();
        for frame in &self.trace {
            out.push_str("\n  ");
            out.push_str(&frame.node);
            out.push_str(&format!(" ({})", frame.loc));
        }
        out
    }

    /// JSON form used by monitors and the debug wire.
    pub fn to_json_value(&self) -> serde_json::Value {
        let mut obj = serde_json::Map::new();
        obj.insert("Source".into(), self.source.clone().into());
        obj.insert("Type".into(), self.kind.to_string().into());
        obj.insert("Detail".into(), self.detail.clone().into());
        if let Some(loc) = &self.loc {
            obj.insert("Line".into(), loc.line.into());
            obj.insert("Pos".into(), loc.pos.into());
        }
        if !self.trace.is_empty() {
            let trace: Vec<serde_json::Value> = self
                .trace
                .iter()
                .map(|f| format!("{} ({})", f.node, f.loc).into())
                .collect();
            obj.insert("Trace".into(), trace.into());
        }
        serde_json::Value::Object(obj)
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ECAL error in {}: {} ({})", self.source, self.kind, self.detail)?;
        if let Some(loc) = &self.loc {
            write!(f, " (Line:{} Pos:{})", loc.line, loc.pos)?;
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {}

impl Serialize for RuntimeError {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json_value().serialize(serializer)
    }
}

/// A runtime error bundled with a snapshot of the failing environment.
///
/// Produced for sink errors so the monitor report carries the variable state
/// of the failing rule body. Values that cannot be represented as JSON are
/// replaced by a sentinel string during the snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeErrorWithDetail {
    pub error: RuntimeError,
    pub environment: serde_json::Value,
    pub data: Option<serde_json::Value>,
}

impl fmt::Display for RuntimeErrorWithDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.error.fmt(f)
    }
}

impl std::error::Error for RuntimeErrorWithDetail {}
