//! Tests for the stdlib registry, the function bridge coercion rules and
//! the shipped packages.

use std::sync::Arc;

use ecal::{
    EvalResult, MemoryImportLocator, MemoryLogger, NativeFunction, RuntimeProvider, Value,
    check_max_args, num_arg, parse,
};
use pretty_assertions::assert_eq;

fn provider() -> RuntimeProvider {
    RuntimeProvider::new(
        "test",
        Box::new(MemoryImportLocator::new()),
        Box::new(MemoryLogger::new()),
    )
}

fn eval_with(rtp: &RuntimeProvider, src: &str) -> EvalResult<Value> {
    let ast = parse("test", src)?;
    rtp.validate(&ast)?;
    rtp.eval(&ast, rtp.global_scope())
}

fn eval_ok(src: &str) -> Value {
    eval_with(&provider(), src).expect("evaluation succeeds")
}

fn num(n: f64) -> Value {
    Value::Number(n)
}

// =============================================================================
// 1. Registry namespaces
// =============================================================================

/// Registering an existing package name fails.
#[test]
fn duplicate_package_is_rejected() {
    let rtp = provider();
    let err = rtp.stdlib().add_package("math", "again").unwrap_err();
    assert_eq!(err.detail, "Package math already exists");
}

/// Functions can only land in existing packages.
#[test]
fn function_needs_existing_package() {
    let rtp = provider();
    let func = Arc::new(NativeFunction::new("f", "noop", |_args, _ctx| Ok(Value::Null)));
    let err = rtp.stdlib().add_function("nosuch", "f", func).unwrap_err();
    assert_eq!(err.detail, "Unknown package: nosuch");
}

/// Host registered functions are callable as `<pkg>.<name>`.
#[test]
fn host_function_call() {
    let rtp = provider();
    rtp.stdlib().add_package("host", "Host helpers.").unwrap();
    rtp.stdlib()
        .add_function(
            "host",
            "double",
            Arc::new(NativeFunction::new(
                "double",
                "Doubles a number.",
                |args, _ctx| {
                    check_max_args("double", args, 1)?;
                    Ok(Value::Number(num_arg("double", args, 0)? * 2.0))
                },
            )),
        )
        .unwrap();
    assert_eq!(eval_with(&rtp, "host.double(21)").unwrap(), num(42.0));
    assert_eq!(
        rtp.stdlib().doc("host.double"),
        Some(String::from("Doubles a number."))
    );
}

/// Symbol lookup splits on the first dot only.
#[test]
fn lookup_splits_on_first_dot() {
    let rtp = provider();
    // math.Pi resolves even though the expression contains further dots.
    assert_eq!(
        eval_with(&rtp, "math.floor(math.Pi)").unwrap(),
        num(3.0)
    );
}

/// A variable shadows a stdlib package of the same name.
#[test]
fn variables_shadow_packages() {
    let rtp = provider();
    let result = eval_with(&rtp, "math := {\"Pi\" : 1}; math.Pi").unwrap();
    assert_eq!(result, num(1.0));
}

// =============================================================================
// 2. Bridge coercion
// =============================================================================

/// Integer typed host parameters truncate their double arguments.
#[test]
fn integer_parameters_truncate() {
    assert_eq!(
        eval_ok("str.substr(\"hello\", 1.9, 3.2)"),
        Value::Str("ell".into())
    );
}

/// Calls with too many arguments are rejected.
#[test]
fn too_many_parameters() {
    let err = eval_with(&provider(), "len([1], 2)").unwrap_err();
    assert!(err.detail.contains("too many parameters"));
}

/// Wrong argument kinds name the parameter and the expected kind.
#[test]
fn wrong_parameter_kind() {
    let err = eval_with(&provider(), "math.sqrt(\"nope\")").unwrap_err();
    assert_eq!(
        err.detail,
        "Function sqrt: parameter 1 must be a number not a string"
    );
}

// =============================================================================
// 3. Inbuild functions
// =============================================================================

/// len over the three sized kinds.
#[test]
fn len() {
    assert_eq!(eval_ok("len([1, 2, 3])"), num(3.0));
    assert_eq!(eval_ok("len({\"a\" : 1})"), num(1.0));
    assert_eq!(eval_ok("len(\"abcd\")"), num(4.0));
}

/// add, del and concat operate on copies.
#[test]
fn list_helpers() {
    assert_eq!(eval_ok("l := [1, 3]; add(l, 2, 1)"), Value::List(vec![num(1.0), num(2.0), num(3.0)]));
    assert_eq!(eval_ok("l := [1, 2, 3]; del(l, 1)"), Value::List(vec![num(1.0), num(3.0)]));
    assert_eq!(
        eval_ok("concat([1], [2], [3])"),
        Value::List(vec![num(1.0), num(2.0), num(3.0)])
    );
    // The original list is unchanged.
    assert_eq!(
        eval_ok("l := [1, 2]; x := add(l, 3); len(l)"),
        num(2.0)
    );
}

/// doc returns help text for function values and symbol names.
#[test]
fn doc_lookup() {
    assert_eq!(
        eval_ok("doc(len)"),
        Value::Str("Returns the size of a list, map or string.".into())
    );
    assert_eq!(
        eval_ok("doc(\"math.pow\")"),
        Value::Str("Returns base raised to the power of the exponent.".into())
    );
}

/// raise produces a runtime error carrying the message.
#[test]
fn raise() {
    let err = eval_with(&provider(), "raise(\"custom failure\")").unwrap_err();
    assert_eq!(err.detail, "custom failure");
}

// =============================================================================
// 4. Packages
// =============================================================================

/// A sample of the math package.
#[test]
fn math_package() {
    assert_eq!(eval_ok("math.floor(3.7)"), num(3.0));
    assert_eq!(eval_ok("math.abs(0 - 5)"), num(5.0));
    assert_eq!(eval_ok("math.pow(2, 10)"), num(1024.0));
    assert_eq!(eval_ok("math.sqrt(49)"), num(7.0));
}

/// A sample of the str package.
#[test]
fn str_package() {
    assert_eq!(eval_ok("str.upper(\"abc\")"), Value::Str("ABC".into()));
    assert_eq!(
        eval_ok("str.split(\"a,b,c\", \",\")"),
        Value::List(vec![
            Value::Str("a".into()),
            Value::Str("b".into()),
            Value::Str("c".into()),
        ])
    );
    assert_eq!(
        eval_ok("str.join([1, 2, 3], \"-\")"),
        Value::Str("1-2-3".into())
    );
    assert_eq!(
        eval_ok("str.replace(\"aaa\", \"a\", \"b\")"),
        Value::Str("bbb".into())
    );
}

/// Package listings carry symbols for the console reports.
#[test]
fn package_listings() {
    let rtp = provider();
    let packages = rtp.stdlib().packages();
    assert!(packages.iter().any(|(name, _)| name == "math"));
    assert!(packages.iter().any(|(name, _)| name == "str"));
    let symbols = rtp.stdlib().package_symbols("math");
    assert!(symbols.iter().any(|(name, _)| name == "Pi"));
    assert!(symbols.iter().any(|(name, _)| name == "sqrt"));
    assert!(rtp.stdlib().internal_names().contains(&String::from("range")));
}

// =============================================================================
// 5. Plugins
// =============================================================================

/// With the plugins feature, a descriptor whose library cannot be loaded
/// is a fatal error naming the plugin and the failure.
#[cfg(feature = "plugins")]
#[test]
fn plugin_load_corruption_is_fatal() {
    let rtp = provider();
    let err = rtp
        .stdlib()
        .load_plugins(&[ecal::PluginDescriptor {
            package: "p".into(),
            name: "f".into(),
            path: "/nonexistent/libplugin.so".into(),
            symbol: "construct".into(),
        }])
        .unwrap_err();
    assert_eq!(err.kind, ecal::ErrorKind::Fatal);
    assert!(err.detail.contains("cannot load library"));
    assert!(err.detail.contains("p.f"));
}

/// Without the plugins feature, loading descriptors reports unsupported;
/// an empty descriptor list is fine.
#[cfg(not(feature = "plugins"))]
#[test]
fn plugins_unsupported_without_feature() {
    let rtp = provider();
    assert!(rtp.stdlib().load_plugins(&[]).is_ok());
    let err = rtp
        .stdlib()
        .load_plugins(&[ecal::PluginDescriptor {
            package: "p".into(),
            name: "f".into(),
            path: "libplugin.so".into(),
            symbol: "construct".into(),
        }])
        .unwrap_err();
    assert!(err.detail.contains("unsupported"));
}
