//! Tests for the scanner, the parser and the pretty-printer.

use ecal::{ErrorKind, NodeKind, parse};
use pretty_assertions::assert_eq;

// =============================================================================
// 1. Positions
// =============================================================================

/// Nodes carry 1-based line and position information.
#[test]
fn node_positions() {
    let ast = parse("pos", "a := 1\nb := a + 2").unwrap();
    assert_eq!(ast.kind, NodeKind::Statements);
    let second = &ast.children[1];
    assert_eq!(second.kind, NodeKind::Assign);
    assert_eq!(second.loc.line, 2);
    let plus = &second.children[1];
    assert_eq!(plus.kind, NodeKind::Plus);
    assert_eq!((plus.loc.line, plus.loc.pos), (2, 8));
}

/// Comments and separators are skipped.
#[test]
fn comments_and_separators() {
    let ast = parse("c", "# a comment\na := 1 ; b := 2\n# trailing").unwrap();
    assert_eq!(ast.children.len(), 2);
}

/// The empty program parses to an empty statement list.
#[test]
fn empty_source() {
    let ast = parse("empty", "").unwrap();
    assert_eq!(ast.children.len(), 0);
}

// =============================================================================
// 2. Errors
// =============================================================================

/// Unterminated strings are reported with their position.
#[test]
fn unterminated_string() {
    let err = parse("bad", "a := \"oops").unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidConstruct);
    assert_eq!(err.detail, "Unterminated string");
}

/// Unterminated blocks are reported.
#[test]
fn unterminated_block() {
    let err = parse("bad", "if true { a := 1").unwrap_err();
    assert_eq!(err.detail, "Unterminated block");
}

/// Assignment needs an assignable left side.
#[test]
fn invalid_assignment_target() {
    let err = parse("bad", "1 + 2 := 3").unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidConstruct);
    assert!(err.detail.starts_with("Cannot assign to"));
}

/// Duplicate sink clauses are rejected.
#[test]
fn duplicate_sink_clause() {
    let err = parse(
        "bad",
        "sink s kindmatch [\"a\"], kindmatch [\"b\"] { x := 1 }",
    )
    .unwrap_err();
    assert_eq!(err.detail, "Duplicate sink clause: Kindmatch");
}

// =============================================================================
// 3. Pretty-printing
// =============================================================================

/// Formatting is stable: printing a parsed program and reparsing it prints
/// the same text.
#[test]
fn format_is_idempotent() {
    let src = "
a := 1
if a > 0 {
    b := [1, 2, {\"k\" : 3}]
} else {
    b := null
}
func f(x, y=2) {
    return x * y
}
for i in range(1, 10) {
    a := a + f(i)
}
sink s
    kindmatch [\"a.*\"],
    priority 5
{
    log(\"fired\")
}
try {
    raise(\"x\")
} except e {
    log(e)
} finally {
    a := 0
}";
    let once = parse("fmt", src).unwrap().to_source();
    let twice = parse("fmt", &once).unwrap().to_source();
    assert_eq!(once, twice);
}

/// The printer re-inserts parentheses only where precedence demands them.
#[test]
fn parentheses() {
    let printed = parse("p", "(1 + 2) * 3").unwrap().to_source();
    assert_eq!(printed, "(1 + 2) * 3");
    let printed = parse("p", "1 + (2 * 3)").unwrap().to_source();
    assert_eq!(printed, "1 + 2 * 3");
}

/// String escapes survive printing.
#[test]
fn string_escapes() {
    let printed = parse("p", "\"a\\\"b\\nc\"").unwrap().to_source();
    assert_eq!(printed, "\"a\\\"b\\nc\"");
}
