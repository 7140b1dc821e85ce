//! Bridge adapting host callables into the language's value domain.
//!
//! Host functions implement [`EcalFunction`]. Argument access goes through
//! the checked extractors below, which implement the numeric coercion rules:
//! every number in the language is a double, so integer-typed host parameters
//! truncate and float-typed parameters cast. Host results travel back as a
//! single [`Value`]; functions with several results return a list. A panic
//! inside host code is caught and surfaced as a regular runtime error.

use std::panic::{AssertUnwindSafe, catch_unwind};

use crate::{
    errors::{ErrorKind, EvalResult, RuntimeError},
    eval::FunctionContext,
    value::{Value, ValueMap},
};

/// A host callable exposed to the language.
pub trait EcalFunction: Send + Sync {
    /// Name the function was registered under.
    fn name(&self) -> &str;

    /// Runs the function with already evaluated arguments.
    fn run(&self, args: &[Value], ctx: &mut FunctionContext<'_>) -> EvalResult<Value>;

    /// One line help text shown by `doc` and the console.
    fn doc_string(&self) -> String;
}

/// Invokes a host function, converting panics into runtime errors.
pub(crate) fn call_host_function(
    func: &dyn EcalFunction,
    args: &[Value],
    ctx: &mut FunctionContext<'_>,
) -> EvalResult<Value> {
    match catch_unwind(AssertUnwindSafe(|| func.run(args, ctx))) {
        Ok(result) => result,
        Err(panic) => {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_owned())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| String::from("unknown panic"));
            Err(RuntimeError::new(
                ErrorKind::Runtime,
                format!("error: {reason}"),
            ))
        }
    }
}

/// An [`EcalFunction`] built from a closure. Used for internal registration
/// and plugin shims.
pub struct NativeFunction {
    name: String,
    doc: String,
    run: Box<dyn Fn(&[Value], &mut FunctionContext<'_>) -> EvalResult<Value> + Send + Sync>,
}

impl NativeFunction {
    pub fn new(
        name: impl Into<String>,
        doc: impl Into<String>,
        run: impl Fn(&[Value], &mut FunctionContext<'_>) -> EvalResult<Value> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            doc: doc.into(),
            run: Box::new(run),
        }
    }
}

impl EcalFunction for NativeFunction {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, args: &[Value], ctx: &mut FunctionContext<'_>) -> EvalResult<Value> {
        (self.run)(args, ctx)
    }

    fn doc_string(&self) -> String {
        self.doc.clone()
    }
}

// ---------------------------------------------------------------------------
// Argument extraction and coercion
// ---------------------------------------------------------------------------

fn arg_error(func: &str, detail: String) -> RuntimeError {
    RuntimeError::new(ErrorKind::Runtime, format!("Function {func}: {detail}"))
}

/// Rejects calls with more than `max` arguments.
pub fn check_max_args(func: &str, args: &[Value], max: usize) -> EvalResult<()> {
    if args.len() > max {
        return Err(arg_error(
            func,
            format!("too many parameters, expected at most {max} got {}", args.len()),
        ));
    }
    Ok(())
}

/// Rejects calls with fewer than `min` arguments.
pub fn check_min_args(func: &str, args: &[Value], min: usize) -> EvalResult<()> {
    if args.len() < min {
        return Err(arg_error(
            func,
            format!("requires at least {min} parameter(s) got {}", args.len()),
        ));
    }
    Ok(())
}

fn wrong_kind(func: &str, index: usize, wanted: &str, got: &Value) -> RuntimeError {
    arg_error(
        func,
        format!(
            "parameter {} must be a {wanted} not a {}",
            index + 1,
            got.kind_name()
        ),
    )
}

/// A required double parameter.
pub fn num_arg(func: &str, args: &[Value], index: usize) -> EvalResult<f64> {
    match args.get(index) {
        Some(Value::Number(n)) => Ok(*n),
        Some(other) => Err(wrong_kind(func, index, "number", other)),
        None => Err(arg_error(func, format!("parameter {} is missing", index + 1))),
    }
}

/// A required integer-typed host parameter. The double argument truncates.
pub fn int_arg(func: &str, args: &[Value], index: usize) -> EvalResult<i64> {
    Ok(num_arg(func, args, index)? as i64)
}

/// An optional integer parameter with a default.
pub fn opt_int_arg(func: &str, args: &[Value], index: usize, default: i64) -> EvalResult<i64> {
    match args.get(index) {
        None => Ok(default),
        Some(_) => int_arg(func, args, index),
    }
}

/// An optional double parameter with a default.
pub fn opt_num_arg(func: &str, args: &[Value], index: usize, default: f64) -> EvalResult<f64> {
    match args.get(index) {
        None => Ok(default),
        Some(_) => num_arg(func, args, index),
    }
}

/// A required string parameter.
pub fn str_arg<'a>(func: &str, args: &'a [Value], index: usize) -> EvalResult<&'a str> {
    match args.get(index) {
        Some(Value::Str(s)) => Ok(s),
        Some(other) => Err(wrong_kind(func, index, "string", other)),
        None => Err(arg_error(func, format!("parameter {} is missing", index + 1))),
    }
}

/// A required list parameter.
pub fn list_arg<'a>(func: &str, args: &'a [Value], index: usize) -> EvalResult<&'a [Value]> {
    match args.get(index) {
        Some(Value::List(items)) => Ok(items),
        Some(other) => Err(wrong_kind(func, index, "list", other)),
        None => Err(arg_error(func, format!("parameter {} is missing", index + 1))),
    }
}

/// A required map parameter.
pub fn map_arg<'a>(func: &str, args: &'a [Value], index: usize) -> EvalResult<&'a ValueMap> {
    match args.get(index) {
        Some(Value::Map(map)) => Ok(map),
        Some(other) => Err(wrong_kind(func, index, "map", other)),
        None => Err(arg_error(func, format!("parameter {} is missing", index + 1))),
    }
}

/// A list of strings, as used by event kind paths and suppression lists.
pub fn str_list_arg(func: &str, args: &[Value], index: usize) -> EvalResult<Vec<String>> {
    let items = list_arg(func, args, index)?;
    items
        .iter()
        .map(|item| match item {
            Value::Str(s) => Ok(s.clone()),
            other => Err(wrong_kind(func, index, "list of strings", other)),
        })
        .collect()
}
