//! Tests for the variable scope tree: parent chain lookup, dotted path
//! mutation and the structured path errors.

use ecal::{MapKey, Scope, Value, ValueMap};
use pretty_assertions::assert_eq;

fn map(entries: Vec<(&str, Value)>) -> Value {
    let mut out = ValueMap::new();
    for (key, value) in entries {
        out.insert(MapKey::Str(key.to_owned()), value);
    }
    Value::Map(out)
}

// =============================================================================
// 1. Parent chain lookup and assignment
// =============================================================================

/// A name declared in an ancestor is visible from a descendant scope.
#[test]
fn lookup_walks_parent_chain() {
    let root = Scope::new("global");
    root.set_value("a", Value::Number(1.0)).unwrap();
    let child = Scope::new_with_parent("child", &root);
    let grandchild = Scope::new_with_parent("grandchild", &child);
    assert_eq!(grandchild.get_value("a").unwrap(), Some(Value::Number(1.0)));
}

/// Assigning a name defined in an ancestor mutates the ancestor's slot,
/// not the assigning scope.
#[test]
fn assignment_mutates_owning_ancestor() {
    let root = Scope::new("global");
    root.set_value("a", Value::Number(1.0)).unwrap();
    let child = Scope::new_with_parent("child", &root);
    child.set_value("a", Value::Number(2.0)).unwrap();
    assert!(!child.is_local("a"));
    assert_eq!(root.get_value("a").unwrap(), Some(Value::Number(2.0)));
}

/// Assigning an unknown name defines it in the current scope.
#[test]
fn assignment_defines_locally_when_unknown() {
    let root = Scope::new("global");
    let child = Scope::new_with_parent("child", &root);
    child.set_value("b", Value::Number(3.0)).unwrap();
    assert!(child.is_local("b"));
    assert_eq!(root.get_value("b").unwrap(), None);
}

/// `set_local_value` shadows an ancestor's slot instead of mutating it.
#[test]
fn set_local_value_forces_local_definition() {
    let root = Scope::new("global");
    root.set_value("a", Value::Number(1.0)).unwrap();
    let child = Scope::new_with_parent("child", &root);
    child.set_local_value("a", Value::Number(9.0)).unwrap();
    assert_eq!(root.get_value("a").unwrap(), Some(Value::Number(1.0)));
    assert_eq!(child.get_value("a").unwrap(), Some(Value::Number(9.0)));
}

/// An unknown first path component reads as not found, without an error.
#[test]
fn unknown_name_reads_as_none() {
    let root = Scope::new("global");
    assert_eq!(root.get_value("nothing").unwrap(), None);
}

// =============================================================================
// 2. Dotted path mutation
// =============================================================================

/// Nested container mutation through dotted paths, including a numeric
/// leaf key on a map.
#[test]
fn dotted_mutation_round_trip() {
    let scope = Scope::new("global");
    scope.set_value("xx", map(vec![("foo", map(vec![]))])).unwrap();
    scope.set_value("xx.foo.bar", map(vec![])).unwrap();
    scope
        .set_value("xx.foo.bar.99", Value::Str("tester".into()))
        .unwrap();
    assert_eq!(
        scope.get_value("xx.foo.bar.99").unwrap(),
        Some(Value::Str("tester".into()))
    );
}

/// Any value written under a path reads back unchanged.
#[test]
fn set_then_get_same_path() {
    let scope = Scope::new("global");
    scope
        .set_value(
            "xx",
            Value::List(vec![
                Value::Number(1.0),
                Value::Number(2.0),
                Value::List(vec![Value::Number(3.0), Value::Number(4.0)]),
            ]),
        )
        .unwrap();
    scope.set_value("xx.2.0", Value::Str("replaced".into())).unwrap();
    assert_eq!(
        scope.get_value("xx.2.0").unwrap(),
        Some(Value::Str("replaced".into()))
    );
}

/// Negative list indices count from the end.
#[test]
fn negative_list_index() {
    let scope = Scope::new("global");
    scope
        .set_value(
            "xx",
            Value::List(vec![Value::Number(1.0), Value::Number(2.0), Value::Number(3.0)]),
        )
        .unwrap();
    assert_eq!(scope.get_value("xx.-1").unwrap(), Some(Value::Number(3.0)));
}

// =============================================================================
// 3. Structured path errors
// =============================================================================

/// Out of bounds writes name the failing list and index.
#[test]
fn out_of_bounds_error_message() {
    let scope = Scope::new("global");
    scope
        .set_value(
            "xx",
            Value::List(vec![
                Value::Number(1.0),
                Value::Number(2.0),
                Value::List(vec![Value::Number(3.0), Value::Number(4.0)]),
            ]),
        )
        .unwrap();
    let err = scope.set_value("xx.5", Value::Null).unwrap_err();
    assert_eq!(
        err.to_string(),
        "Out of bounds access to list xx with index: 5"
    );
}

/// A non-numeric list index is rejected with the failing prefix.
#[test]
fn list_index_must_be_numeric() {
    let scope = Scope::new("global");
    scope.set_value("xx", Value::List(vec![Value::Number(1.0)])).unwrap();
    let err = scope.get_value("xx.first").unwrap_err();
    assert_eq!(err.to_string(), "List xx needs a number index not: first");
}

/// Navigating into a scalar reports the prefix that is not a container.
#[test]
fn not_a_container_error() {
    let scope = Scope::new("global");
    scope.set_value("xx", Value::Number(1.0)).unwrap();
    let err = scope.set_value("xx.foo", Value::Null).unwrap_err();
    assert_eq!(err.to_string(), "Variable xx is not a container");
}

/// A missing intermediate map key reports the failing prefix.
#[test]
fn missing_container_error() {
    let scope = Scope::new("global");
    scope.set_value("xx", map(vec![("foo", map(vec![]))])).unwrap();
    let err = scope.set_value("xx.bar.baz", Value::Null).unwrap_err();
    assert_eq!(err.to_string(), "Container field xx.bar does not exist");
}

// =============================================================================
// 4. Children, clearing and dumps
// =============================================================================

/// `new_child` dedupes by name and returns the existing child.
#[test]
fn new_child_dedupes_by_name() {
    let root = Scope::new("global");
    let a = root.new_child("sub");
    a.set_value("x", Value::Number(1.0)).unwrap();
    let b = root.new_child("sub");
    assert_eq!(b.get_value("x").unwrap(), Some(Value::Number(1.0)));
}

/// `clear` wipes storage and children but keeps the parent link.
#[test]
fn clear_keeps_parent() {
    let root = Scope::new("global");
    root.set_value("a", Value::Number(1.0)).unwrap();
    let child = root.new_child("sub");
    child.set_value("b", Value::Number(2.0)).unwrap();
    child.clear();
    assert_eq!(child.get_value("b").unwrap(), None);
    // The parent chain is intact: a is still reachable.
    assert_eq!(child.get_value("a").unwrap(), Some(Value::Number(1.0)));
    root.clear();
    assert_eq!(root.get_value("a").unwrap(), None);
}

/// The JSON projection is shallow and replaces functions by a sentinel.
#[test]
fn json_projection() {
    let scope = Scope::new("global");
    scope.set_value("n", Value::Number(42.0)).unwrap();
    scope.set_value("s", Value::Str("x".into())).unwrap();
    let obj = scope.to_json_object();
    assert_eq!(obj["n"], serde_json::json!(42));
    assert_eq!(obj["s"], serde_json::json!("x"));
}

/// The scope dump names the scope and lists variables with their kinds.
#[test]
fn scope_dump_format() {
    let scope = Scope::new("global");
    scope.set_value("a", Value::Number(1.0)).unwrap();
    let dump = scope.to_string();
    assert!(dump.starts_with("global {"));
    assert!(dump.contains("a (number) : 1"));
}
