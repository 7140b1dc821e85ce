//! Tests for the thread-aware debugger: breakpoints, suspension, state
//! inspection, value injection/extraction and the kill protocol.

use std::{sync::Arc, time::Duration};

use ecal::{
    ContMode, EcalDebugger, MemoryImportLocator, MemoryLogger, RuntimeProvider, Scope, Value,
    parse,
};

const SOURCE: &str = "a := 1
b := 2
c := a + b
c";

fn provider() -> RuntimeProvider {
    RuntimeProvider::new(
        "test",
        Box::new(MemoryImportLocator::new()),
        Box::new(MemoryLogger::new()),
    )
}

/// Waits until the debugger reports exactly one suspended thread and
/// returns its id.
fn wait_for_suspension(debugger: &Arc<EcalDebugger>) -> u64 {
    for _ in 0..500 {
        let status = debugger.status();
        let threads = status["threads"].as_object().expect("threads is an object");
        for (tid, entry) in threads {
            if entry["status"] == "Suspended" {
                return tid.parse().expect("thread ids are numeric");
            }
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("no thread suspended");
}

/// Runs SOURCE on a worker thread against a child scope of global,
/// returning the scope and the join handle.
fn spawn_eval(
    rtp: &RuntimeProvider,
    debugger: &Arc<EcalDebugger>,
) -> (Scope, std::thread::JoinHandle<Result<Value, ecal::RuntimeError>>) {
    debugger.register_source("dbg", SOURCE);
    let scope = Scope::new_with_parent("main", rtp.global_scope());
    let ast = parse("dbg", SOURCE).expect("source parses");
    rtp.validate(&ast).expect("source validates");
    let thread_rtp = rtp.clone();
    let thread_scope = scope.clone();
    let handle = std::thread::spawn(move || thread_rtp.eval(&ast, &thread_scope));
    (scope, handle)
}

// =============================================================================
// 1. Breakpoints and suspension
// =============================================================================

/// A thread suspends exactly once on an enabled breakpoint and resumes to
/// completion.
#[test]
fn breakpoint_suspends_and_resumes() {
    let rtp = provider();
    let debugger = rtp.attach_debugger();
    debugger.set_breakpoint("dbg", 3);
    let (scope, handle) = spawn_eval(&rtp, &debugger);
    let tid = wait_for_suspension(&debugger);

    // Suspended before line 3 ran: a and b are set, c is not.
    assert_eq!(scope.get_value("a").unwrap(), Some(Value::Number(1.0)));
    assert_eq!(scope.get_value("c").unwrap(), None);

    debugger.cont(tid, ContMode::Resume).unwrap();
    let result = handle.join().expect("thread joins").expect("eval succeeds");
    assert_eq!(result, Value::Number(3.0));
    assert_eq!(scope.get_value("c").unwrap(), Some(Value::Number(3.0)));
}

/// A disabled breakpoint does not suspend.
#[test]
fn disabled_breakpoint_is_ignored() {
    let rtp = provider();
    let debugger = rtp.attach_debugger();
    debugger.set_breakpoint("dbg", 3);
    debugger.disable_breakpoint("dbg", 3);
    let (_scope, handle) = spawn_eval(&rtp, &debugger);
    let result = handle.join().expect("thread joins").expect("eval succeeds");
    assert_eq!(result, Value::Number(3.0));
}

/// Step in suspends again on the next visited node.
#[test]
fn step_in() {
    let rtp = provider();
    let debugger = rtp.attach_debugger();
    debugger.set_breakpoint("dbg", 2);
    let (_scope, handle) = spawn_eval(&rtp, &debugger);
    let tid = wait_for_suspension(&debugger);
    debugger.cont(tid, ContMode::StepIn).unwrap();
    let tid2 = wait_for_suspension(&debugger);
    assert_eq!(tid, tid2);
    debugger.cont(tid, ContMode::Resume).unwrap();
    handle.join().expect("thread joins").expect("eval succeeds");
}

// =============================================================================
// 2. Inspection, extraction, injection
// =============================================================================

/// `inspect` reports the current node, location and scope layers.
#[test]
fn inspect_suspended_thread() {
    let rtp = provider();
    let debugger = rtp.attach_debugger();
    debugger.set_breakpoint("dbg", 3);
    let (_scope, handle) = spawn_eval(&rtp, &debugger);
    let tid = wait_for_suspension(&debugger);

    let inspection = debugger.inspect(tid).unwrap();
    assert_eq!(inspection["status"], "Suspended");
    assert_eq!(inspection["location"], "dbg:3");
    let scopes = inspection["scopes"].as_array().expect("scopes is an array");
    assert!(
        scopes
            .iter()
            .any(|layer| layer["vars"].get("a") == Some(&serde_json::json!(1)))
    );

    debugger.cont(tid, ContMode::Resume).unwrap();
    handle.join().expect("thread joins").expect("eval succeeds");
}

/// `extract` copies a variable into the global scope, `inject` assigns an
/// expression result into the suspended thread's scope.
#[test]
fn extract_and_inject() {
    let rtp = provider();
    let debugger = rtp.attach_debugger();
    debugger.set_breakpoint("dbg", 3);
    let (scope, handle) = spawn_eval(&rtp, &debugger);
    let tid = wait_for_suspension(&debugger);

    debugger.extract(tid, "a", "extracted").unwrap();
    assert_eq!(
        rtp.global_scope().get_value("extracted").unwrap(),
        Some(Value::Number(1.0))
    );

    debugger.inject(tid, "b", "20 + 20").unwrap();
    debugger.cont(tid, ContMode::Resume).unwrap();
    let result = handle.join().expect("thread joins").expect("eval succeeds");
    assert_eq!(result, Value::Number(41.0));
    assert_eq!(scope.get_value("c").unwrap(), Some(Value::Number(41.0)));
}

/// Commands against a running (not suspended) thread are rejected.
#[test]
fn commands_need_suspension() {
    let rtp = provider();
    let debugger = rtp.attach_debugger();
    debugger.set_breakpoint("dbg", 3);
    let (_scope, handle) = spawn_eval(&rtp, &debugger);
    let tid = wait_for_suspension(&debugger);
    debugger.cont(tid, ContMode::Resume).unwrap();
    handle.join().expect("thread joins").expect("eval succeeds");
    let err = debugger.extract(tid, "a", "x").unwrap_err();
    assert!(err.detail.contains("not suspended"));
}

// =============================================================================
// 3. The command wire format
// =============================================================================

/// Breakpoints can be managed through the command line syntax, and status
/// reports them together with known sources.
#[test]
fn command_wire() {
    let rtp = provider();
    let debugger = rtp.attach_debugger();
    debugger.register_source("wire", "x := 1");
    debugger.handle_command("break wire:1").unwrap();
    let status = debugger.handle_command("status").unwrap();
    assert_eq!(status["breakpoints"]["wire:1"], serde_json::json!(true));
    assert!(
        status["sources"]
            .as_array()
            .expect("sources is an array")
            .contains(&serde_json::json!("wire"))
    );
    debugger.handle_command("disable wire:1").unwrap();
    let status = debugger.handle_command("status").unwrap();
    assert_eq!(status["breakpoints"]["wire:1"], serde_json::json!(false));
    debugger.handle_command("remove wire:1").unwrap();
    let status = debugger.handle_command("status").unwrap();
    assert!(status["breakpoints"].as_object().expect("object").is_empty());
}

/// An identifier resolves to the first source line mentioning it.
#[test]
fn identifier_breakpoint() {
    let rtp = provider();
    let debugger = rtp.attach_debugger();
    debugger.register_source("dbg", SOURCE);
    let (source, line) = debugger.resolve_location("c").unwrap();
    assert_eq!((source.as_str(), line), ("dbg", 3));
}

/// Unknown commands are rejected.
#[test]
fn unknown_command() {
    let rtp = provider();
    let debugger = rtp.attach_debugger();
    let err = debugger.handle_command("teleport 1").unwrap_err();
    assert!(err.detail.contains("Unknown command"));
}

// =============================================================================
// 4. Kill protocol
// =============================================================================

/// `stop_threads` releases suspended threads with a killed error and
/// returns after the state settles.
#[test]
fn stop_threads_kills_suspended() {
    let rtp = provider();
    let debugger = rtp.attach_debugger();
    debugger.set_breakpoint("dbg", 3);
    let (_scope, handle) = spawn_eval(&rtp, &debugger);
    wait_for_suspension(&debugger);

    debugger.stop_threads(Duration::from_millis(50));
    let err = handle.join().expect("thread joins").expect_err("eval was killed");
    assert_eq!(err.detail, "Thread was killed");
}

/// Threads suspend on the first statement when break on start is set.
#[test]
fn break_on_start() {
    let rtp = provider();
    let debugger = rtp.attach_debugger();
    debugger.set_break_on_start(true);
    let (scope, handle) = spawn_eval(&rtp, &debugger);
    let tid = wait_for_suspension(&debugger);
    // Nothing ran yet.
    assert_eq!(scope.get_value("a").unwrap(), None);
    debugger.set_break_on_start(false);
    debugger.cont(tid, ContMode::Resume).unwrap();
    handle.join().expect("thread joins").expect("eval succeeds");
}
