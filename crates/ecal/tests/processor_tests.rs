//! Tests for the event processor: rule matching, priority and suppression,
//! monitors and the stop protocol.

use std::time::Duration;

use ecal::{
    Event, MapKey, MemoryImportLocator, MemoryLogger, RuntimeProvider, Value, ValueMap, parse,
};

fn provider() -> RuntimeProvider {
    RuntimeProvider::new(
        "test",
        Box::new(MemoryImportLocator::new()),
        Box::new(MemoryLogger::new()),
    )
}

fn run(rtp: &RuntimeProvider, src: &str) -> Value {
    let ast = parse("test", src).expect("source parses");
    rtp.validate(&ast).expect("source validates");
    rtp.eval(&ast, rtp.global_scope()).expect("source evaluates")
}

fn global(rtp: &RuntimeProvider, name: &str) -> Value {
    rtp.global_scope()
        .get_value(name)
        .expect("path resolves")
        .expect("variable exists")
}

fn state(entries: Vec<(&str, Value)>) -> ValueMap {
    let mut out = ValueMap::new();
    for (key, value) in entries {
        out.insert(MapKey::Str(key.to_owned()), value);
    }
    out
}

fn kind(path: &str) -> Vec<String> {
    path.split('.').map(str::to_owned).collect()
}

// =============================================================================
// 1. Rule matching and execution
// =============================================================================

/// A sink with a glob kind match fires once for a matching event; a second
/// sink raising an error reports it through the root monitor.
#[test]
fn rule_fires_and_errors_aggregate() {
    let rtp = provider();
    run(
        &rtp,
        "
result := 0
sink mysink
    kindmatch [ \"foo.*\" ],
    priority 0
{
    result := event.state.op1 + event.state.op2
}
sink errsink
    kindmatch [ \"foo.bar\" ]
{
    raise(\"Some error\")
}",
    );
    rtp.start();
    let monitor = rtp.processor().add_event_and_wait(
        Event::new(
            "MyEvent",
            kind("foo.bar"),
            state(vec![
                ("op1", Value::Number(5.2)),
                ("op2", Value::Number(5.3)),
            ]),
        ),
        None,
    );
    assert!(monitor.is_finished());

    let result = global(&rtp, "result").as_number().expect("result is numeric");
    assert!((result - 10.5).abs() < 1e-9, "got {result}");

    let errors = monitor.root_monitor().all_errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].sink, "errsink");
    assert_eq!(errors[0].event, "MyEvent");
    assert_eq!(errors[0].error.error.detail, "Some error");
    // The error snapshot carries the sink's environment.
    assert!(errors[0].error.environment.is_object());
    rtp.stop();
}

/// Kind patterns match the full path: component counts must be equal.
#[test]
fn kind_match_is_full_path() {
    let rtp = provider();
    run(
        &rtp,
        "
hits := 0
sink onefoo
    kindmatch [ \"foo\" ]
{
    hits := hits + 1
}",
    );
    rtp.start();
    rtp.processor()
        .add_event_and_wait(Event::new("E1", kind("foo.bar"), ValueMap::new()), None);
    assert_eq!(global(&rtp, "hits"), Value::Number(0.0));
    rtp.processor()
        .add_event_and_wait(Event::new("E2", kind("foo"), ValueMap::new()), None);
    assert_eq!(global(&rtp, "hits"), Value::Number(1.0));
    rtp.stop();
}

/// State match entries compare globs against the stringified state values;
/// a missing key is a mismatch.
#[test]
fn state_match() {
    let rtp = provider();
    run(
        &rtp,
        "
hits := 0
sink sm
    kindmatch [ \"x\" ],
    statematch { \"op\" : \"4*\" }
{
    hits := hits + 1
}",
    );
    rtp.start();
    rtp.processor().add_event_and_wait(
        Event::new("E", kind("x"), state(vec![("op", Value::Str("42".into()))])),
        None,
    );
    assert_eq!(global(&rtp, "hits"), Value::Number(1.0));
    rtp.processor().add_event_and_wait(
        Event::new("E", kind("x"), state(vec![("op", Value::Str("13".into()))])),
        None,
    );
    assert_eq!(global(&rtp, "hits"), Value::Number(1.0));
    rtp.processor()
        .add_event_and_wait(Event::new("E", kind("x"), ValueMap::new()), None);
    assert_eq!(global(&rtp, "hits"), Value::Number(1.0));
    rtp.stop();
}

/// Re-registering a sink under the same name replaces the prior rule.
#[test]
fn sink_registration_is_idempotent_by_name() {
    let rtp = provider();
    run(
        &rtp,
        "
marker := \"\"
sink s
    kindmatch [ \"a\" ]
{
    marker := \"old\"
}
sink s
    kindmatch [ \"a\" ]
{
    marker := \"new\"
}",
    );
    assert_eq!(rtp.processor().rule_names(), vec![String::from("s")]);
    rtp.start();
    rtp.processor()
        .add_event_and_wait(Event::new("E", kind("a"), ValueMap::new()), None);
    assert_eq!(global(&rtp, "marker"), Value::Str("new".into()));
    rtp.stop();
}

// =============================================================================
// 2. Priority and suppression
// =============================================================================

/// A high priority sink suppresses a named sink; unrelated sinks still run.
#[test]
fn suppression() {
    let rtp = provider();
    run(
        &rtp,
        "
ran := []
sink high
    kindmatch [ \"t\" ],
    priority 10,
    suppresses [ \"low\" ]
{
    mutex ranlock {
        ran := add(ran, \"high\")
    }
}
sink low
    kindmatch [ \"t\" ]
{
    mutex ranlock {
        ran := add(ran, \"low\")
    }
}
sink other
    kindmatch [ \"t\" ],
    priority 5
{
    mutex ranlock {
        ran := add(ran, \"other\")
    }
}",
    );
    rtp.start();
    rtp.processor()
        .add_event_and_wait(Event::new("E", kind("t"), ValueMap::new()), None);
    let Value::List(ran) = global(&rtp, "ran") else {
        panic!("ran is a list");
    };
    let names: Vec<String> = ran
        .iter()
        .map(|v| v.as_str().expect("marker is a string").to_owned())
        .collect();
    assert_eq!(ran.len(), 2);
    assert!(names.contains(&String::from("high")));
    assert!(names.contains(&String::from("other")));
    assert!(!names.contains(&String::from("low")));
    rtp.stop();
}

// =============================================================================
// 3. Monitors
// =============================================================================

/// Events raised inside a sink attach to the current monitor: waiting on
/// the root covers transitively triggered rules.
#[test]
fn cascading_events_complete_before_wait_returns() {
    let rtp = provider();
    run(
        &rtp,
        "
secondran := false
sink first
    kindmatch [ \"a\" ]
{
    addEvent(\"chained\", \"b\", {})
}
sink second
    kindmatch [ \"b\" ]
{
    secondran := true
}",
    );
    rtp.start();
    let monitor = rtp
        .processor()
        .add_event_and_wait(Event::new("E", kind("a"), ValueMap::new()), None);
    assert!(monitor.is_finished());
    assert_eq!(global(&rtp, "secondran"), Value::Bool(true));
    rtp.stop();
}

/// The error list is stable once the wait returns.
#[test]
fn monitor_errors_are_stable_after_wait() {
    let rtp = provider();
    run(
        &rtp,
        "
sink failing
    kindmatch [ \"a\" ]
{
    raise(\"expected\")
}",
    );
    rtp.start();
    let monitor = rtp
        .processor()
        .add_event_and_wait(Event::new("E", kind("a"), ValueMap::new()), None);
    let count = monitor.all_errors().len();
    assert_eq!(count, 1);
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(monitor.all_errors().len(), count);
    rtp.stop();
}

/// The script level addEventAndWait returns the collected errors.
#[test]
fn add_event_and_wait_from_script() {
    let rtp = provider();
    run(
        &rtp,
        "
sink failing
    kindmatch [ \"q.*\" ]
{
    raise(\"scripted\")
}",
    );
    rtp.start();
    let errors = run(&rtp, "addEventAndWait(\"E\", \"q.x\", {})");
    let Value::List(errors) = errors else {
        panic!("addEventAndWait returns a list");
    };
    assert_eq!(errors.len(), 1);
    let Value::Map(entry) = &errors[0] else {
        panic!("error entries are maps");
    };
    assert_eq!(
        entry.get(&MapKey::Str("error".into())),
        Some(&Value::Str("scripted".into()))
    );
    assert_eq!(
        entry.get(&MapKey::Str("sink".into())),
        Some(&Value::Str("failing".into()))
    );
    rtp.stop();
}

// =============================================================================
// 4. Stop protocol
// =============================================================================

/// After stop, new events are refused and the monitor carries the
/// processor-stopped error.
#[test]
fn stopped_processor_refuses_events() {
    let rtp = provider();
    rtp.start();
    rtp.stop();
    let monitor = rtp
        .processor()
        .add_event_and_wait(Event::new("E", kind("a"), ValueMap::new()), None);
    assert!(monitor.is_finished());
    let errors = monitor.all_errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].error.error.detail, "Processor is stopped");
}

/// A stopped processor can be started again.
#[test]
fn restart_after_stop() {
    let rtp = provider();
    run(
        &rtp,
        "
hits := 0
sink s
    kindmatch [ \"a\" ]
{
    hits := hits + 1
}",
    );
    rtp.start();
    rtp.processor()
        .add_event_and_wait(Event::new("E", kind("a"), ValueMap::new()), None);
    rtp.stop();
    rtp.start();
    rtp.processor()
        .add_event_and_wait(Event::new("E", kind("a"), ValueMap::new()), None);
    assert_eq!(global(&rtp, "hits"), Value::Number(2.0));
    rtp.stop();
}
