//! Tests for the cron spec parser and the time-triggered event injection.

use std::time::Duration;

use chrono::{TimeZone, Utc};
use ecal::{CronSpec, MemoryImportLocator, MemoryLogger, RuntimeProvider, Value, parse};

fn provider() -> RuntimeProvider {
    RuntimeProvider::new(
        "test",
        Box::new(MemoryImportLocator::new()),
        Box::new(MemoryLogger::new()),
    )
}

// =============================================================================
// 1. Spec parsing and matching
// =============================================================================

/// Wildcard, step and list fields.
#[test]
fn spec_matching() {
    let noon = Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap();
    let spec = CronSpec::parse("0 0 12 * * *").unwrap();
    assert!(spec.matches(noon));
    assert!(!spec.matches(Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 1).unwrap()));

    let every_five_seconds = CronSpec::parse("*/5 * * * * *").unwrap();
    assert!(every_five_seconds.matches(Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 10).unwrap()));
    assert!(!every_five_seconds.matches(Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 11).unwrap()));

    let weekdays = CronSpec::parse("0 0 9 * * 1,2,3,4,5").unwrap();
    // 2026-03-02 is a Monday.
    assert!(weekdays.matches(Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()));
    // 2026-03-01 is a Sunday.
    assert!(!weekdays.matches(Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()));
}

/// Malformed specs are rejected with the failing field.
#[test]
fn invalid_specs() {
    assert!(CronSpec::parse("* * *").is_err());
    assert!(CronSpec::parse("* * * * * x").is_err());
    assert!(CronSpec::parse("*/0 * * * * *").is_err());
    let err = CronSpec::parse("a * * * * *").unwrap_err();
    assert!(err.detail.contains("Invalid cron field a"));
}

// =============================================================================
// 2. Scheduled event injection
// =============================================================================

/// A tick matching a registered trigger injects the configured event.
#[test]
fn tick_injects_event() {
    let rtp = provider();
    let ast = parse(
        "test",
        "
ticked := false
sink ontick
    kindmatch [ \"test.tick\" ]
{
    ticked := true
}",
    )
    .unwrap();
    rtp.validate(&ast).unwrap();
    rtp.eval(&ast, rtp.global_scope()).unwrap();

    rtp.cron()
        .add_spec_trigger("* * * * * *", "tick", "test.tick")
        .unwrap();
    assert_eq!(rtp.cron().trigger_specs(), vec![String::from("* * * * * *")]);

    rtp.processor().start();
    rtp.cron().tick(Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap());

    let mut ticked = false;
    for _ in 0..200 {
        if rtp.global_scope().get_value("ticked").unwrap() == Some(Value::Bool(true)) {
            ticked = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(ticked, "cron tick did not fire the sink");
    rtp.stop();
}

/// Script code registers cron triggers through setCronTrigger.
#[test]
fn set_cron_trigger_from_script() {
    let rtp = provider();
    let ast = parse(
        "test",
        "setCronTrigger(\"0 * * * * *\", \"minutely\", \"time.minute\")",
    )
    .unwrap();
    rtp.validate(&ast).unwrap();
    let result = rtp.eval(&ast, rtp.global_scope()).unwrap();
    assert_eq!(result, Value::Str("0 * * * * *".into()));
    assert_eq!(
        rtp.cron().trigger_specs(),
        vec![String::from("0 * * * * *")]
    );
}

/// A bad spec surfaces as a runtime error at the call site.
#[test]
fn bad_spec_from_script() {
    let rtp = provider();
    let ast = parse("test", "setCronTrigger(\"nope\", \"e\", \"k\")").unwrap();
    rtp.validate(&ast).unwrap();
    let err = rtp.eval(&ast, rtp.global_scope()).unwrap_err();
    assert!(err.detail.contains("Cron spec must have 6 fields"));
}
