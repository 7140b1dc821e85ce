//! AST consumed by the evaluator.
//!
//! The parser produces a tree of [`AstNode`]s. Nodes are deliberately uniform:
//! a [`NodeKind`] tag, a source position, an optional literal payload and a
//! children list. The evaluator dispatches on the kind tag; `validate` checks
//! structural rules before the first evaluation.

use std::{fmt, sync::Arc};

use serde::Serialize;
use strum::{Display, IntoStaticStr};

/// Source position attached to every token and AST node.
///
/// `source` names the compilation unit (file path, module name or a REPL
/// chunk name). Lines and positions are 1-based.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CodeLoc {
    pub source: Arc<str>,
    pub line: u32,
    pub pos: u32,
}

impl CodeLoc {
    pub fn new(source: &Arc<str>, line: u32, pos: u32) -> Self {
        Self {
            source: Arc::clone(source),
            line,
            pos,
        }
    }
}

impl fmt::Display for CodeLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.line)
    }
}

/// Construct tag for an AST node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr, Serialize)]
pub enum NodeKind {
    // atoms
    Number,
    StringLit,
    Identifier,
    True,
    False,
    Null,

    // composite literals
    ListLit,
    MapLit,
    KeyValue,

    // postfix
    Access,
    Index,
    Call,

    // operators
    Neg,
    Pos,
    Not,
    Plus,
    Minus,
    Times,
    Div,
    DivInt,
    ModInt,
    Or,
    And,
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    NotIn,

    // statements
    Statements,
    Assign,
    TargetList,
    Guard,
    If,
    Loop,
    Break,
    Continue,
    Return,
    FuncDecl,
    Param,
    ParamList,
    Sink,
    Kindmatch,
    Statematch,
    Suppresses,
    Priority,
    Import,
    Try,
    Except,
    Otherwise,
    Finally,
    Mutex,
}

/// Literal payload of a node, if any.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum NodeValue {
    None,
    Num(f64),
    Str(String),
    /// Identifier or declaration name.
    Name(String),
}

impl NodeValue {
    /// Returns the name payload, panicking on other payloads.
    ///
    /// Only called by the evaluator on nodes the parser guarantees to carry
    /// a name (identifiers, declarations).
    pub(crate) fn name(&self) -> &str {
        match self {
            Self::Name(n) => n,
            _ => unreachable!("node payload is not a name"),
        }
    }
}

/// A node in the abstract syntax tree.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AstNode {
    pub kind: NodeKind,
    pub loc: CodeLoc,
    pub value: NodeValue,
    pub children: Vec<AstNode>,
}

impl AstNode {
    pub fn new(kind: NodeKind, loc: CodeLoc) -> Self {
        Self {
            kind,
            loc,
            value: NodeValue::None,
            children: Vec::new(),
        }
    }

    pub fn with_value(kind: NodeKind, loc: CodeLoc, value: NodeValue) -> Self {
        Self {
            kind,
            loc,
            value,
            children: Vec::new(),
        }
    }

    /// Short single-line description used by error traces and the debugger.
    pub fn describe(&self) -> String {
        let mut out = self.to_source();
        if let Some(cut) = out.find('\n') {
            out.truncate(cut);
            out.push_str(" ...");
        }
        out
    }

    /// Re-prints the node as canonical source text.
    pub fn to_source(&self) -> String {
        let mut out = String::new();
        print_node(self, 0, &mut out);
        out
    }
}

impl fmt::Display for AstNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_source())
    }
}

// ---------------------------------------------------------------------------
// Pretty-printer
// ---------------------------------------------------------------------------

/// Binding power of an operator node, used to decide where the printer must
/// re-insert parentheses. Mirrors the parser's precedence table.
fn precedence(kind: NodeKind) -> u8 {
    match kind {
        NodeKind::Or => 1,
        NodeKind::And => 2,
        NodeKind::Not => 3,
        NodeKind::Eq
        | NodeKind::Neq
        | NodeKind::Gt
        | NodeKind::Gte
        | NodeKind::Lt
        | NodeKind::Lte
        | NodeKind::In
        | NodeKind::NotIn => 4,
        NodeKind::Plus | NodeKind::Minus => 5,
        NodeKind::Times | NodeKind::Div | NodeKind::DivInt | NodeKind::ModInt => 6,
        NodeKind::Neg | NodeKind::Pos => 7,
        _ => 8,
    }
}

fn binary_symbol(kind: NodeKind) -> &'static str {
    match kind {
        NodeKind::Plus => "+",
        NodeKind::Minus => "-",
        NodeKind::Times => "*",
        NodeKind::Div => "/",
        NodeKind::DivInt => "//",
        NodeKind::ModInt => "%",
        NodeKind::Or => "or",
        NodeKind::And => "and",
        NodeKind::Eq => "==",
        NodeKind::Neq => "!=",
        NodeKind::Gt => ">",
        NodeKind::Gte => ">=",
        NodeKind::Lt => "<",
        NodeKind::Lte => "<=",
        NodeKind::In => "in",
        NodeKind::NotIn => "notin",
        _ => unreachable!("not a binary operator"),
    }
}

fn indent(level: usize, out: &mut String) {
    for _ in 0..level {
        out.push_str("    ");
    }
}

/// Prints an expression, parenthesized when its precedence is below the
/// enclosing operator's.
fn print_expr(node: &AstNode, parent_prec: u8, out: &mut String) {
    let prec = precedence(node.kind);
    let parens = prec < parent_prec;
    if parens {
        out.push('(');
    }
    match node.kind {
        NodeKind::Number => print_number(number_value(node), out),
        NodeKind::StringLit => {
            out.push('"');
            for c in string_value(node).chars() {
                match c {
                    '"' => out.push_str("\\\""),
                    '\\' => out.push_str("\\\\"),
                    '\n' => out.push_str("\\n"),
                    '\t' => out.push_str("\\t"),
                    '\r' => out.push_str("\\r"),
                    _ => out.push(c),
                }
            }
            out.push('"');
        }
        NodeKind::Identifier => out.push_str(node.value.name()),
        NodeKind::True => out.push_str("true"),
        NodeKind::False => out.push_str("false"),
        NodeKind::Null => out.push_str("null"),
        NodeKind::ListLit => {
            out.push('[');
            for (i, c) in node.children.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                print_expr(c, 0, out);
            }
            out.push(']');
        }
        NodeKind::MapLit => {
            out.push('{');
            for (i, kv) in node.children.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                print_expr(&kv.children[0], 0, out);
                out.push_str(" : ");
                print_expr(&kv.children[1], 0, out);
            }
            out.push('}');
        }
        NodeKind::Access => {
            print_expr(&node.children[0], prec, out);
            out.push('.');
            out.push_str(node.value.name());
        }
        NodeKind::Index => {
            print_expr(&node.children[0], prec, out);
            out.push('[');
            print_expr(&node.children[1], 0, out);
            out.push(']');
        }
        NodeKind::Call => {
            print_expr(&node.children[0], prec, out);
            out.push('(');
            for (i, a) in node.children[1..].iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                print_expr(a, 0, out);
            }
            out.push(')');
        }
        NodeKind::Neg => {
            out.push('-');
            print_expr(&node.children[0], prec + 1, out);
        }
        NodeKind::Pos => {
            out.push('+');
            print_expr(&node.children[0], prec + 1, out);
        }
        NodeKind::Not => {
            out.push_str("not ");
            print_expr(&node.children[0], prec, out);
        }
        NodeKind::Assign => {
            print_expr(&node.children[0], 0, out);
            out.push_str(" := ");
            print_expr(&node.children[1], 0, out);
        }
        NodeKind::TargetList => {
            for (i, c) in node.children.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                print_expr(c, 0, out);
            }
        }
        NodeKind::FuncDecl => print_func(node, 0, out),
        _ if node.children.len() == 2 => {
            print_expr(&node.children[0], prec, out);
            out.push(' ');
            out.push_str(binary_symbol(node.kind));
            out.push(' ');
            print_expr(&node.children[1], prec + 1, out);
        }
        _ => out.push_str(node.kind.into()),
    }
    if parens {
        out.push(')');
    }
}

/// Formats a number the way the runtime displays it: integral values print
/// without a fractional part.
pub(crate) fn print_number(n: f64, out: &mut String) {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        out.push_str(&format!("{}", n as i64));
    } else {
        out.push_str(&format!("{n}"));
    }
}

fn number_value(node: &AstNode) -> f64 {
    match node.value {
        NodeValue::Num(n) => n,
        _ => unreachable!("number node without numeric payload"),
    }
}

fn string_value(node: &AstNode) -> &str {
    match &node.value {
        NodeValue::Str(s) => s,
        _ => unreachable!("string node without string payload"),
    }
}

fn print_block(block: &AstNode, level: usize, out: &mut String) {
    out.push_str("{\n");
    for stmt in &block.children {
        print_node(stmt, level + 1, out);
        out.push('\n');
    }
    indent(level, out);
    out.push('}');
}

fn print_func(node: &AstNode, level: usize, out: &mut String) {
    out.push_str("func");
    if let NodeValue::Name(name) = &node.value {
        out.push(' ');
        out.push_str(name);
    }
    out.push('(');
    let params = &node.children[0];
    for (i, p) in params.children.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        out.push_str(p.value.name());
        if let Some(default) = p.children.first() {
            out.push('=');
            print_expr(default, 0, out);
        }
    }
    out.push_str(") ");
    print_block(&node.children[1], level, out);
}

fn print_node(node: &AstNode, level: usize, out: &mut String) {
    indent(level, out);
    match node.kind {
        NodeKind::Statements => {
            for (i, stmt) in node.children.iter().enumerate() {
                if i > 0 {
                    out.push('\n');
                }
                print_node(stmt, level, out);
            }
        }
        NodeKind::If => {
            for (i, guard) in node.children.iter().enumerate() {
                let cond = &guard.children[0];
                let is_else = i > 0 && cond.kind == NodeKind::True;
                if i == 0 {
                    out.push_str("if ");
                    print_expr(cond, 0, out);
                    out.push(' ');
                } else if is_else {
                    out.push_str(" else ");
                } else {
                    out.push_str(" elif ");
                    print_expr(cond, 0, out);
                    out.push(' ');
                }
                print_block(&guard.children[1], level, out);
            }
        }
        NodeKind::Loop => {
            out.push_str("for ");
            print_expr(&node.children[0], 0, out);
            out.push_str(" in ");
            print_expr(&node.children[1], 0, out);
            out.push(' ');
            print_block(&node.children[2], level, out);
        }
        NodeKind::Break => out.push_str("break"),
        NodeKind::Continue => out.push_str("continue"),
        NodeKind::Return => {
            out.push_str("return");
            if let Some(v) = node.children.first() {
                out.push(' ');
                print_expr(v, 0, out);
            }
        }
        NodeKind::FuncDecl => print_func(node, level, out),
        NodeKind::Sink => {
            out.push_str("sink ");
            out.push_str(node.value.name());
            for clause in &node.children[..node.children.len() - 1] {
                out.push('\n');
                indent(level + 1, out);
                match clause.kind {
                    NodeKind::Kindmatch => {
                        out.push_str("kindmatch ");
                        print_expr(&clause.children[0], 0, out);
                    }
                    NodeKind::Statematch => {
                        out.push_str("statematch ");
                        print_expr(&clause.children[0], 0, out);
                    }
                    NodeKind::Suppresses => {
                        out.push_str("suppresses ");
                        print_expr(&clause.children[0], 0, out);
                    }
                    NodeKind::Priority => {
                        out.push_str("priority ");
                        print_expr(&clause.children[0], 0, out);
                    }
                    _ => unreachable!("not a sink clause"),
                }
            }
            out.push('\n');
            indent(level, out);
            print_block(node.children.last().expect("sink has a body"), level, out);
        }
        NodeKind::Import => {
            out.push_str("import ");
            print_expr(&node.children[0], 0, out);
            out.push_str(" as ");
            out.push_str(node.value.name());
        }
        NodeKind::Try => {
            out.push_str("try ");
            print_block(&node.children[0], level, out);
            for handler in &node.children[1..] {
                match handler.kind {
                    NodeKind::Except => {
                        out.push_str(" except ");
                        if let NodeValue::Name(name) = &handler.value {
                            out.push_str(name);
                            out.push(' ');
                        }
                        print_block(&handler.children[0], level, out);
                    }
                    NodeKind::Otherwise => {
                        out.push_str(" otherwise ");
                        print_block(&handler.children[0], level, out);
                    }
                    NodeKind::Finally => {
                        out.push_str(" finally ");
                        print_block(&handler.children[0], level, out);
                    }
                    _ => unreachable!("not a try handler"),
                }
            }
        }
        NodeKind::Mutex => {
            out.push_str("mutex ");
            out.push_str(node.value.name());
            out.push(' ');
            print_block(&node.children[0], level, out);
        }
        _ => print_expr(node, 0, out),
    }
}
