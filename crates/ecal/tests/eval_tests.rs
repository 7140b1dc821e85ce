//! End to end evaluation tests: expressions, control flow, functions,
//! template strings and the user visible error format.

use ecal::{
    EvalResult, MemoryImportLocator, MemoryLogger, RuntimeProvider, RuntimeError, Value,
    parse,
};
use pretty_assertions::assert_eq;

fn provider() -> RuntimeProvider {
    RuntimeProvider::new(
        "test",
        Box::new(MemoryImportLocator::new()),
        Box::new(MemoryLogger::new()),
    )
}

fn eval_src(src: &str) -> EvalResult<Value> {
    let rtp = provider();
    let ast = parse("test", src)?;
    rtp.validate(&ast)?;
    rtp.eval(&ast, rtp.global_scope())
}

fn eval_ok(src: &str) -> Value {
    eval_src(src).expect("evaluation succeeds")
}

fn eval_err(src: &str) -> RuntimeError {
    eval_src(src).expect_err("evaluation fails")
}

fn num(n: f64) -> Value {
    Value::Number(n)
}

// =============================================================================
// 1. Expressions
// =============================================================================

/// Plain arithmetic over assigned variables.
#[test]
fn arithmetic() {
    assert_eq!(eval_ok("a:=2;b:=a*4;a+b"), num(10.0));
}

/// Operator precedence and parentheses.
#[test]
fn precedence() {
    assert_eq!(eval_ok("1 + 2 * 3"), num(7.0));
    assert_eq!(eval_ok("(1 + 2) * 3"), num(9.0));
    assert_eq!(eval_ok("7 // 2"), num(3.0));
    assert_eq!(eval_ok("7 % 3"), num(1.0));
    assert_eq!(eval_ok("-2 + 5"), num(3.0));
}

/// Boolean operators require boolean operands and short-circuit.
#[test]
fn boolean_logic() {
    assert_eq!(eval_ok("true and false"), Value::Bool(false));
    assert_eq!(eval_ok("true or false"), Value::Bool(true));
    assert_eq!(eval_ok("not false"), Value::Bool(true));
    // The right side of a short-circuited operator is not evaluated.
    assert_eq!(eval_ok("false and undefinedvar"), Value::Bool(false));
}

/// Comparison over numbers and strings.
#[test]
fn comparison() {
    assert_eq!(eval_ok("2 > 1"), Value::Bool(true));
    assert_eq!(eval_ok("2 <= 1"), Value::Bool(false));
    assert_eq!(eval_ok("\"abc\" < \"abd\""), Value::Bool(true));
    assert_eq!(eval_ok("1 == 1.0"), Value::Bool(true));
    assert_eq!(eval_ok("\"a\" != \"b\""), Value::Bool(true));
}

/// Membership tests over lists and maps.
#[test]
fn membership() {
    assert_eq!(eval_ok("2 in [1, 2, 3]"), Value::Bool(true));
    assert_eq!(eval_ok("4 notin [1, 2, 3]"), Value::Bool(true));
    assert_eq!(eval_ok("\"a\" in {\"a\" : 1}"), Value::Bool(true));
}

/// Container literals, member access and indexing.
#[test]
fn containers() {
    assert_eq!(eval_ok("m := {\"a\" : {\"b\" : 42}}; m.a.b"), num(42.0));
    assert_eq!(eval_ok("l := [1, [2, 3]]; l[1][0]"), num(2.0));
    assert_eq!(eval_ok("l := [1, 2, 3]; l[-1]"), num(3.0));
    // Numeric map keys match their decimal string spelling.
    assert_eq!(eval_ok("m := {1 : \"one\"}; m[\"1\"]"), Value::Str("one".into()));
}

/// Template strings evaluate embedded expressions at runtime.
#[test]
fn template_strings() {
    assert_eq!(
        eval_ok("a:=2;b:=8;\"Result is {{a+b}}\""),
        Value::Str("Result is 10".into())
    );
    assert_eq!(
        eval_ok("\"{{1+1}} and {{2*2}}\""),
        Value::Str("2 and 4".into())
    );
}

/// Multi-assignment distributes a list over the targets.
#[test]
fn multi_assignment() {
    assert_eq!(eval_ok("a, b := [1, 2]; a + b"), num(3.0));
}

/// Dotted assignment mutates nested state in place.
#[test]
fn dotted_assignment() {
    assert_eq!(
        eval_ok("m := {\"a\" : [10, 20]}; m.a[1] := 5; m.a[0] + m.a[1]"),
        num(15.0)
    );
}

// =============================================================================
// 2. Control flow
// =============================================================================

/// if / elif / else guards.
#[test]
fn if_guards() {
    let src = "
a := 5
r := 0
if a > 10 {
    r := 1
} elif a > 3 {
    r := 2
} else {
    r := 3
}
r";
    assert_eq!(eval_ok(src), num(2.0));
}

/// Iterating a list, with break and continue.
#[test]
fn loop_over_list() {
    let src = "
sum := 0
for x in [1, 2, 3, 4, 5] {
    if x == 2 {
        continue
    }
    if x == 5 {
        break
    }
    sum := sum + x
}
sum";
    assert_eq!(eval_ok(src), num(8.0));
}

/// The range iterator is inclusive and supports a step.
#[test]
fn loop_over_range() {
    assert_eq!(eval_ok("x := 0; for i in range(1, 4) { x := x + i }; x"), num(10.0));
    assert_eq!(
        eval_ok("x := 0; for i in range(10, 0, -2) { x := x + i }; x"),
        num(30.0)
    );
}

/// Two sequential loops over the same range call site start fresh.
#[test]
fn sequential_range_loops() {
    let src = "
total := 0
for rounds in [1, 2] {
    for i in range(1, 3) {
        total := total + i
    }
}
total";
    assert_eq!(eval_ok(src), num(12.0));
}

/// Iterating a map yields its keys.
#[test]
fn loop_over_map() {
    let src = "
count := 0
for k in {\"a\" : 1, \"b\" : 2} {
    count := count + 1
}
count";
    assert_eq!(eval_ok(src), num(2.0));
}

/// Loop statements outside a loop are rejected by validation.
#[test]
fn break_outside_loop_is_invalid() {
    let rtp = provider();
    let ast = parse("test", "break").unwrap();
    let err = rtp.validate(&ast).unwrap_err();
    assert_eq!(err.detail, "Can only be used inside a loop");
}

// =============================================================================
// 3. Functions
// =============================================================================

/// Declaration, defaults and explicit return.
#[test]
fn functions() {
    let src = "
func add(a, b=3) {
    return a + b
}
add(2)";
    assert_eq!(eval_ok(src), num(5.0));
}

/// A body without return yields null.
#[test]
fn function_without_return() {
    assert_eq!(eval_ok("func f() { 1 + 1 }; f()"), Value::Null);
}

/// Functions are values and can be passed around.
#[test]
fn function_values() {
    let src = "
f := func (x) {
    return x * 2
}
f(21)";
    assert_eq!(eval_ok(src), num(42.0));
}

/// Recursion terminates through the return sentinel.
#[test]
fn recursion() {
    let src = "
func fac(n) {
    if n == 0 {
        return 1
    }
    return n * fac(n - 1)
}
fac(5)";
    assert_eq!(eval_ok(src), num(120.0));
}

/// Calling with too many arguments is an error.
#[test]
fn too_many_arguments() {
    let err = eval_err("func f(a) { return a }; f(1, 2)");
    assert_eq!(err.detail, "Too many parameters in call to f");
}

// =============================================================================
// 4. Error handling constructs
// =============================================================================

/// try / except binds the error map, finally always runs.
#[test]
fn try_except_finally() {
    let src = "
r := \"\"
fin := false
try {
    raise(\"boom\")
} except e {
    r := e.error
} finally {
    fin := true
}
\"{{r}}-{{fin}}\"";
    assert_eq!(eval_ok(src), Value::Str("boom-true".into()));
}

/// otherwise runs only when the try block succeeded.
#[test]
fn try_otherwise() {
    let src = "
r := 0
try {
    1 + 1
} otherwise {
    r := 1
}
r";
    assert_eq!(eval_ok(src), num(1.0));
}

/// Without a handler the error propagates after finally.
#[test]
fn try_without_except_propagates() {
    let err = eval_err("fin := false; try { raise(\"x\") } finally { fin := true }");
    assert_eq!(err.detail, "x");
}

/// The user visible error format.
#[test]
fn error_format() {
    let err = eval_err("1 + true");
    assert_eq!(
        err.to_string(),
        "ECAL error in test: Operand is not a number (true) (Line:1 Pos:5)"
    );
}

/// Errors propagating through calls pick up stack trace frames.
#[test]
fn error_trace() {
    let src = "
func inner() {
    return 1 + true
}
func outer() {
    return inner()
}
outer()";
    let err = eval_err(src);
    let trace = err.format_with_trace();
    assert!(trace.contains("inner() (test:6)"));
    assert!(trace.contains("outer() (test:8)"));
}

/// Reading an undefined variable is a variable access error.
#[test]
fn undefined_variable() {
    let err = eval_err("nothere + 1");
    assert_eq!(err.detail, "nothere is not defined");
    assert_eq!(err.kind, ecal::ErrorKind::VarAccess);
}

// =============================================================================
// 5. Imports and mutexes
// =============================================================================

/// Imported modules are bound to their alias as a map of definitions.
#[test]
fn imports() {
    let locator = MemoryImportLocator::new();
    locator.add("lib/helper", "twice := func (x) { return x * 2 }; magic := 7");
    let rtp = RuntimeProvider::new("test", Box::new(locator), Box::new(MemoryLogger::new()));
    let ast = parse("test", "import \"lib/helper\" as helper; helper.twice(helper.magic)").unwrap();
    rtp.validate(&ast).unwrap();
    assert_eq!(rtp.eval(&ast, rtp.global_scope()).unwrap(), num(14.0));
}

/// An unknown module reports the import path.
#[test]
fn unknown_import() {
    let err = eval_err("import \"nope\" as nope");
    assert_eq!(err.detail, "Could not import nope: unknown module");
}

/// The file locator resolves modules relative to its root directory.
#[test]
fn file_imports() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("lib")).unwrap();
    std::fs::write(dir.path().join("lib/const.ecal"), "answer := 42").unwrap();
    let rtp = RuntimeProvider::new(
        "test",
        Box::new(ecal::FileImportLocator::new(dir.path())),
        Box::new(MemoryLogger::new()),
    );
    let ast = parse("test", "import \"lib/const.ecal\" as c; c.answer").unwrap();
    rtp.validate(&ast).unwrap();
    assert_eq!(rtp.eval(&ast, rtp.global_scope()).unwrap(), num(42.0));
}

/// Mutex blocks evaluate their body and return its value.
#[test]
fn mutex_block() {
    assert_eq!(eval_ok("mutex lock { 40 + 2 }"), num(42.0));
}

// =============================================================================
// 6. Logging
// =============================================================================

/// The log functions write through the provider's logger.
#[test]
fn logging_functions() {
    let logger = std::sync::Arc::new(MemoryLogger::new());
    let rtp = RuntimeProvider::new(
        "test",
        Box::new(MemoryImportLocator::new()),
        Box::new(std::sync::Arc::clone(&logger)),
    );
    let ast = parse("test", "log(\"hello\", 42); error(\"bad\")").unwrap();
    rtp.validate(&ast).unwrap();
    rtp.eval(&ast, rtp.global_scope()).unwrap();
    assert_eq!(logger.lines(), vec!["hello 42".to_owned(), "error: bad".to_owned()]);
}
