//! Cron style scheduler injecting events at scheduled instants.
//!
//! A spec has six whitespace separated fields: second, minute, hour, day of
//! month, month, weekday (0 = Sunday). Each field is `*`, `*/n` or a comma
//! separated value list. The clock source is a trait so tests drive the
//! scheduler deterministically through [`CronScheduler::tick`].

use std::{
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
    time::Duration,
};

use chrono::{DateTime, Datelike, Timelike, Utc};

use crate::{
    engine::Event,
    errors::{ErrorKind, EvalResult, RuntimeError},
    provider::ProviderCore,
    value::{MapKey, Value, ValueMap},
};

/// Time source for the scheduler.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for deterministic tests.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().expect("clock lock poisoned");
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("clock lock poisoned")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum CronField {
    Any,
    Every(u32),
    List(Vec<u32>),
}

impl CronField {
    fn matches(&self, value: u32) -> bool {
        match self {
            Self::Any => true,
            Self::Every(n) => value % n == 0,
            Self::List(values) => values.contains(&value),
        }
    }
}

/// A parsed scheduling spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSpec {
    text: String,
    second: CronField,
    minute: CronField,
    hour: CronField,
    day: CronField,
    month: CronField,
    weekday: CronField,
}

impl CronSpec {
    /// Parses a six field spec such as `0 * * * * *` (once a minute).
    pub fn parse(spec: &str) -> EvalResult<Self> {
        let fields: Vec<&str> = spec.split_whitespace().collect();
        if fields.len() != 6 {
            return Err(RuntimeError::new(
                ErrorKind::InvalidState,
                format!("Cron spec must have 6 fields: {spec}"),
            ));
        }
        let parsed: EvalResult<Vec<CronField>> =
            fields.iter().map(|field| parse_field(spec, field)).collect();
        let mut parsed = parsed?.into_iter();
        Ok(Self {
            text: spec.to_owned(),
            second: parsed.next().expect("six fields"),
            minute: parsed.next().expect("six fields"),
            hour: parsed.next().expect("six fields"),
            day: parsed.next().expect("six fields"),
            month: parsed.next().expect("six fields"),
            weekday: parsed.next().expect("six fields"),
        })
    }

    /// True when the spec fires at the given instant.
    pub fn matches(&self, t: DateTime<Utc>) -> bool {
        self.second.matches(t.second())
            && self.minute.matches(t.minute())
            && self.hour.matches(t.hour())
            && self.day.matches(t.day())
            && self.month.matches(t.month())
            && self.weekday.matches(t.weekday().num_days_from_sunday())
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}

fn parse_field(spec: &str, field: &str) -> EvalResult<CronField> {
    if field == "*" {
        return Ok(CronField::Any);
    }
    let invalid = || {
        RuntimeError::new(
            ErrorKind::InvalidState,
            format!("Invalid cron field {field} in spec: {spec}"),
        )
    };
    if let Some(every) = field.strip_prefix("*/") {
        let n: u32 = every.parse().map_err(|_| invalid())?;
        if n == 0 {
            return Err(invalid());
        }
        return Ok(CronField::Every(n));
    }
    let values: Result<Vec<u32>, _> = field.split(',').map(str::parse).collect();
    Ok(CronField::List(values.map_err(|_| invalid())?))
}

struct CronEntry {
    spec: CronSpec,
    event_name: String,
    event_kind: Vec<String>,
}

/// Scheduler holding spec and event pairs, ticking once per second.
pub struct CronScheduler {
    provider: Weak<ProviderCore>,
    clock: Arc<dyn Clock>,
    entries: Mutex<Vec<CronEntry>>,
    stop: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl CronScheduler {
    pub(crate) fn new(provider: Weak<ProviderCore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            provider,
            clock,
            entries: Mutex::new(Vec::new()),
            stop: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
        }
    }

    /// Registers a trigger: at every instant `spec` matches, an event with
    /// the given name and dotted kind path is injected.
    pub fn add_spec_trigger(&self, spec: &str, event_name: &str, event_kind: &str) -> EvalResult<()> {
        let spec = CronSpec::parse(spec)?;
        self.entries
            .lock()
            .expect("cron lock poisoned")
            .push(CronEntry {
                spec,
                event_name: event_name.to_owned(),
                event_kind: event_kind.split('.').map(str::to_owned).collect(),
            });
        Ok(())
    }

    pub fn trigger_specs(&self) -> Vec<String> {
        self.entries
            .lock()
            .expect("cron lock poisoned")
            .iter()
            .map(|entry| entry.spec.text().to_owned())
            .collect()
    }

    /// Fires all entries matching the given instant.
    pub fn tick(&self, t: DateTime<Utc>) {
        let Some(provider) = self.provider.upgrade() else {
            return;
        };
        let entries = self.entries.lock().expect("cron lock poisoned");
        for entry in entries.iter().filter(|entry| entry.spec.matches(t)) {
            let mut state = ValueMap::new();
            state.insert(
                MapKey::Str("time".into()),
                Value::Number(t.timestamp_micros() as f64),
            );
            state.insert(
                MapKey::Str("spec".into()),
                Value::Str(entry.spec.text().to_owned()),
            );
            provider.processor.add_event(
                Event::new(entry.event_name.clone(), entry.event_kind.clone(), state),
                None,
            );
        }
    }

    /// Starts the ticking task. Each wall clock second is evaluated once.
    pub(crate) fn start(&self) {
        let mut thread = self.thread.lock().expect("cron lock poisoned");
        if thread.is_some() {
            return;
        }
        self.stop.store(false, Ordering::SeqCst);
        let stop = Arc::clone(&self.stop);
        let clock = Arc::clone(&self.clock);
        let provider = self.provider.clone();
        *thread = Some(
            std::thread::Builder::new()
                .name("ecal-cron".into())
                .spawn(move || {
                    let mut last = clock.now().timestamp();
                    while !stop.load(Ordering::SeqCst) {
                        std::thread::sleep(Duration::from_millis(200));
                        let now = clock.now();
                        if now.timestamp() != last {
                            last = now.timestamp();
                            if let Some(core) = provider.upgrade() {
                                core.cron.tick(now);
                            }
                        }
                    }
                })
                .expect("failed to spawn cron thread"),
        );
    }

    pub(crate) fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread.lock().expect("cron lock poisoned").take() {
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for CronScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "CronScheduler(entries:{})",
            self.entries.lock().expect("cron lock poisoned").len()
        )
    }
}
