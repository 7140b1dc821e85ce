//! The `str` package.

use std::sync::Arc;

use crate::{
    bridge::{EcalFunction, NativeFunction, check_max_args, check_min_args, int_arg, str_arg},
    eval::FunctionContext,
    errors::EvalResult,
    stdlib::StdlibRegistry,
    value::Value,
};

fn add(
    registry: &StdlibRegistry,
    name: &'static str,
    doc: &'static str,
    run: impl Fn(&[Value], &mut FunctionContext<'_>) -> EvalResult<Value> + Send + Sync + 'static,
) {
    let func: Arc<dyn EcalFunction> = Arc::new(NativeFunction::new(name, doc, run));
    registry
        .add_function("str", name, func)
        .expect("str package exists");
}

pub(crate) fn register(registry: &StdlibRegistry) {
    registry
        .add_package("str", "String manipulation functions.")
        .expect("registry starts empty");

    add(registry, "upper", "Converts a string to upper case.", |args, _ctx| {
        check_min_args("upper", args, 1)?;
        check_max_args("upper", args, 1)?;
        Ok(Value::Str(str_arg("upper", args, 0)?.to_uppercase()))
    });

    add(registry, "lower", "Converts a string to lower case.", |args, _ctx| {
        check_min_args("lower", args, 1)?;
        check_max_args("lower", args, 1)?;
        Ok(Value::Str(str_arg("lower", args, 0)?.to_lowercase()))
    });

    add(registry, "trim", "Removes leading and trailing whitespace.", |args, _ctx| {
        check_min_args("trim", args, 1)?;
        check_max_args("trim", args, 1)?;
        Ok(Value::Str(str_arg("trim", args, 0)?.trim().to_owned()))
    });

    add(registry, "split", "Splits a string on a separator into a list.", |args, _ctx| {
        check_min_args("split", args, 2)?;
        check_max_args("split", args, 2)?;
        let s = str_arg("split", args, 0)?;
        let sep = str_arg("split", args, 1)?;
        Ok(Value::List(
            s.split(sep).map(|part| Value::Str(part.to_owned())).collect(),
        ))
    });

    add(registry, "join", "Joins a list of values into a string with a separator.", |args, _ctx| {
        check_min_args("join", args, 2)?;
        check_max_args("join", args, 2)?;
        let items = crate::bridge::list_arg("join", args, 0)?;
        let sep = str_arg("join", args, 1)?;
        let parts: Vec<String> = items.iter().map(ToString::to_string).collect();
        Ok(Value::Str(parts.join(sep)))
    });

    add(registry, "replace", "Replaces all occurrences of a substring.", |args, _ctx| {
        check_min_args("replace", args, 3)?;
        check_max_args("replace", args, 3)?;
        let s = str_arg("replace", args, 0)?;
        let from = str_arg("replace", args, 1)?;
        let to = str_arg("replace", args, 2)?;
        Ok(Value::Str(s.replace(from, to)))
    });

    add(registry, "substr", "Returns a substring given a start index and a length.", |args, _ctx| {
        check_min_args("substr", args, 3)?;
        check_max_args("substr", args, 3)?;
        let s = str_arg("substr", args, 0)?;
        let chars: Vec<char> = s.chars().collect();
        let start = int_arg("substr", args, 1)?.max(0) as usize;
        let len = int_arg("substr", args, 2)?.max(0) as usize;
        let start = start.min(chars.len());
        let end = (start + len).min(chars.len());
        Ok(Value::Str(chars[start..end].iter().collect()))
    });
}
