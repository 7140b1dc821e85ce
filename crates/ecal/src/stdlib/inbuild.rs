//! Internal functions callable without a package prefix.

use std::sync::Arc;

use crate::{
    bridge::{
        self, EcalFunction, NativeFunction, check_max_args, check_min_args, int_arg, num_arg,
        opt_num_arg, str_arg,
    },
    engine::{Event, now_micros},
    errors::{ErrorKind, EvalResult, RuntimeError},
    eval::FunctionContext,
    stdlib::StdlibRegistry,
    value::{FuncValue, MapKey, Value, ValueMap},
};

fn native(
    name: &'static str,
    doc: &'static str,
    run: impl Fn(&[Value], &mut FunctionContext<'_>) -> EvalResult<Value> + Send + Sync + 'static,
) -> Arc<dyn EcalFunction> {
    Arc::new(NativeFunction::new(name, doc, run))
}

pub(crate) fn register(registry: &StdlibRegistry) {
    registry.add_internal("range", Arc::new(RangeFunction));

    registry.add_internal(
        "len",
        native("len", "Returns the size of a list, map or string.", |args, _ctx| {
            check_min_args("len", args, 1)?;
            check_max_args("len", args, 1)?;
            let len = match &args[0] {
                Value::List(items) => items.len(),
                Value::Map(map) => map.len(),
                Value::Str(s) => s.chars().count(),
                other => {
                    return Err(RuntimeError::new(
                        ErrorKind::NotAListOrMap,
                        format!("Cannot take the length of a {}", other.kind_name()),
                    ));
                }
            };
            Ok(Value::Number(len as f64))
        }),
    );

    registry.add_internal(
        "del",
        native("del", "Removes an entry from a list or a map.", |args, _ctx| {
            check_min_args("del", args, 2)?;
            check_max_args("del", args, 2)?;
            match &args[0] {
                Value::List(items) => {
                    let index = int_arg("del", args, 1)?;
                    let index = if index < 0 { index + items.len() as i64 } else { index };
                    if index < 0 || index as usize >= items.len() {
                        return Err(RuntimeError::new(
                            ErrorKind::Runtime,
                            format!("Out of bounds access to list with index: {index}"),
                        ));
                    }
                    let mut items = items.clone();
                    items.remove(index as usize);
                    Ok(Value::List(items))
                }
                Value::Map(map) => {
                    let key = MapKey::from_value(&args[1]).map_err(|kind| {
                        RuntimeError::new(
                            ErrorKind::Runtime,
                            format!("Cannot use a {kind} as a map key"),
                        )
                    })?;
                    let mut map = map.clone();
                    map.shift_remove(&key);
                    Ok(Value::Map(map))
                }
                other => Err(RuntimeError::new(
                    ErrorKind::NotAListOrMap,
                    format!("Cannot delete from a {}", other.kind_name()),
                )),
            }
        }),
    );

    registry.add_internal(
        "add",
        native(
            "add",
            "Adds an item to a list, optionally at a given index.",
            |args, _ctx| {
                check_min_args("add", args, 2)?;
                check_max_args("add", args, 3)?;
                let items = bridge::list_arg("add", args, 0)?;
                let mut items = items.to_vec();
                match args.get(2) {
                    None => items.push(args[1].clone()),
                    Some(_) => {
                        let index = int_arg("add", args, 2)?;
                        let index = (index.max(0) as usize).min(items.len());
                        items.insert(index, args[1].clone());
                    }
                }
                Ok(Value::List(items))
            },
        ),
    );

    registry.add_internal(
        "concat",
        native("concat", "Joins several lists into a new list.", |args, _ctx| {
            check_min_args("concat", args, 1)?;
            let mut out = Vec::new();
            for (i, _) in args.iter().enumerate() {
                out.extend(bridge::list_arg("concat", args, i)?.iter().cloned());
            }
            Ok(Value::List(out))
        }),
    );

    registry.add_internal(
        "now",
        native("now", "Returns the current time in microseconds since the epoch.", |args, _ctx| {
            check_max_args("now", args, 0)?;
            Ok(Value::Number(now_micros()))
        }),
    );

    registry.add_internal(
        "sleep",
        native("sleep", "Pauses the current evaluation for given microseconds.", |args, _ctx| {
            check_max_args("sleep", args, 1)?;
            let micros = num_arg("sleep", args, 0)?.max(0.0);
            std::thread::sleep(std::time::Duration::from_micros(micros as u64));
            Ok(Value::Null)
        }),
    );

    registry.add_internal(
        "doc",
        native("doc", "Returns the doc string of a function.", |args, ctx| {
            check_min_args("doc", args, 1)?;
            check_max_args("doc", args, 1)?;
            match &args[0] {
                Value::Func(FuncValue::Stdlib(func)) => Ok(Value::Str(func.doc_string())),
                Value::Func(FuncValue::User(func)) => Ok(Value::Str(format!(
                    "Function {}",
                    func.name.as_deref().unwrap_or("anonymous")
                ))),
                Value::Str(symbol) => ctx
                    .provider
                    .stdlib
                    .doc(symbol)
                    .map(Value::Str)
                    .ok_or_else(|| {
                        RuntimeError::new(
                            ErrorKind::Runtime,
                            format!("Unknown symbol: {symbol}"),
                        )
                    }),
                other => Err(RuntimeError::new(
                    ErrorKind::Runtime,
                    format!("Cannot document a {}", other.kind_name()),
                )),
            }
        }),
    );

    registry.add_internal(
        "raise",
        native("raise", "Raises an error with the given message.", |args, _ctx| {
            check_max_args("raise", args, 1)?;
            let detail = match args.first() {
                Some(value) => value.to_string(),
                None => String::new(),
            };
            Err(RuntimeError::new(ErrorKind::Runtime, detail))
        }),
    );

    registry.add_internal(
        "dumpenv",
        native("dumpenv", "Returns the current variable environment as a string.", |args, ctx| {
            check_max_args("dumpenv", args, 0)?;
            Ok(Value::Str(ctx.scope().to_string()))
        }),
    );

    registry.add_internal(
        "log",
        native("log", "Writes a log message.", |args, ctx| {
            ctx.log_info(&join_args(args));
            Ok(Value::Null)
        }),
    );
    registry.add_internal(
        "debug",
        native("debug", "Writes a debug level log message.", |args, ctx| {
            ctx.log_debug(&join_args(args));
            Ok(Value::Null)
        }),
    );
    registry.add_internal(
        "error",
        native("error", "Writes an error level log message.", |args, ctx| {
            ctx.log_error(&join_args(args));
            Ok(Value::Null)
        }),
    );

    registry.add_internal(
        "addEvent",
        native(
            "addEvent",
            "Adds an event to the processor. Inside a sink body the event becomes a child of the current event.",
            |args, ctx| {
                check_min_args("addEvent", args, 2)?;
                check_max_args("addEvent", args, 3)?;
                let event = event_from_args("addEvent", args)?;
                let monitor = ctx.monitor().cloned();
                ctx.provider.processor.add_event(event, monitor.as_ref());
                Ok(Value::Null)
            },
        ),
    );

    registry.add_internal(
        "addEventAndWait",
        native(
            "addEventAndWait",
            "Adds an event as a new root event and waits for all triggered rules. Returns the collected errors.",
            |args, ctx| {
                check_min_args("addEventAndWait", args, 2)?;
                check_max_args("addEventAndWait", args, 3)?;
                let event = event_from_args("addEventAndWait", args)?;
                let monitor = ctx.provider.processor.add_event_and_wait(event, None);
                let mut out = Vec::new();
                for entry in monitor.all_errors() {
                    let mut map = ValueMap::new();
                    map.insert(MapKey::Str("event".into()), Value::Str(entry.event));
                    map.insert(MapKey::Str("sink".into()), Value::Str(entry.sink));
                    map.insert(
                        MapKey::Str("type".into()),
                        Value::Str(entry.error.error.kind.to_string()),
                    );
                    map.insert(
                        MapKey::Str("error".into()),
                        Value::Str(entry.error.error.detail.clone()),
                    );
                    out.push(Value::Map(map));
                }
                Ok(Value::List(out))
            },
        ),
    );

    registry.add_internal(
        "setCronTrigger",
        native(
            "setCronTrigger",
            "Adds a cron trigger injecting an event at the scheduled instants.",
            |args, ctx| {
                check_min_args("setCronTrigger", args, 3)?;
                check_max_args("setCronTrigger", args, 3)?;
                let spec = str_arg("setCronTrigger", args, 0)?;
                let name = str_arg("setCronTrigger", args, 1)?;
                let kind = str_arg("setCronTrigger", args, 2)?;
                ctx.provider.cron.add_spec_trigger(spec, name, kind)?;
                Ok(Value::Str(spec.to_owned()))
            },
        ),
    );
}

fn join_args(args: &[Value]) -> String {
    args.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Builds an event from `(name, kind, state?)` arguments. The kind is a
/// dotted string or a list of strings.
fn event_from_args(func: &str, args: &[Value]) -> EvalResult<Event> {
    let name = str_arg(func, args, 0)?;
    let kind = match &args[1] {
        Value::Str(kind) => kind.split('.').map(str::to_owned).collect(),
        Value::List(_) => bridge::str_list_arg(func, args, 1)?,
        other => {
            return Err(RuntimeError::new(
                ErrorKind::Runtime,
                format!(
                    "Function {func}: parameter 2 must be a kind path string or list not a {}",
                    other.kind_name()
                ),
            ));
        }
    };
    let state = match args.get(2) {
        Some(_) => bridge::map_arg(func, args, 2)?.clone(),
        None => ValueMap::new(),
    };
    Ok(Event::new(name, kind, state))
}

/// The `range` iterator: `range(end)`, `range(start, end)` or
/// `range(start, end, step)`, iterating inclusively.
struct RangeFunction;

impl EcalFunction for RangeFunction {
    fn name(&self) -> &str {
        "range"
    }

    fn run(&self, args: &[Value], ctx: &mut FunctionContext<'_>) -> EvalResult<Value> {
        if let Some(Value::List(state)) = ctx.instance_get() {
            let cursor = state[0].as_number().expect("cursor is numeric");
            let end = state[1].as_number().expect("end is numeric");
            let step = state[2].as_number().expect("step is numeric");
            let in_range = if step > 0.0 { cursor <= end } else { cursor >= end };
            if in_range {
                ctx.instance_set(Value::List(vec![
                    Value::Number(cursor + step),
                    Value::Number(end),
                    Value::Number(step),
                ]));
                return Ok(Value::Number(cursor));
            }
            ctx.instance_clear();
            return Err(RuntimeError::new(ErrorKind::EndOfIteration, ""));
        }

        check_min_args("range", args, 1)?;
        check_max_args("range", args, 3)?;
        let (start, end) = if args.len() == 1 {
            (0.0, num_arg("range", args, 0)?)
        } else {
            (num_arg("range", args, 0)?, num_arg("range", args, 1)?)
        };
        let step = opt_num_arg("range", args, 2, 1.0)?;
        if step == 0.0 {
            return Err(RuntimeError::new(
                ErrorKind::Runtime,
                "Function range: step must not be 0",
            ));
        }
        ctx.instance_set(Value::List(vec![
            Value::Number(start),
            Value::Number(end),
            Value::Number(step),
        ]));
        Err(RuntimeError::new(ErrorKind::IsIterator, ""))
    }

    fn doc_string(&self) -> String {
        String::from("Iterates over numbers from start to end inclusive with a given step.")
    }
}
