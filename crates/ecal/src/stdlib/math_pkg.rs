//! The `math` package.

use std::sync::Arc;

use crate::{
    bridge::{NativeFunction, check_max_args, check_min_args, num_arg},
    stdlib::StdlibRegistry,
    value::Value,
};

/// Golden ratio.
const PHI: f64 = 1.618_033_988_749_895;

fn unary(registry: &StdlibRegistry, name: &'static str, doc: &'static str, f: fn(f64) -> f64) {
    registry
        .add_function(
            "math",
            name,
            Arc::new(NativeFunction::new(name, doc, move |args, _ctx| {
                check_min_args(name, args, 1)?;
                check_max_args(name, args, 1)?;
                Ok(Value::Number(f(num_arg(name, args, 0)?)))
            })),
        )
        .expect("math package exists");
}

pub(crate) fn register(registry: &StdlibRegistry) {
    registry
        .add_package("math", "Mathematical functions and constants.")
        .expect("registry starts empty");
    registry
        .add_constant("math", "Pi", Value::Number(std::f64::consts::PI))
        .expect("math package exists");
    registry
        .add_constant("math", "E", Value::Number(std::f64::consts::E))
        .expect("math package exists");
    registry
        .add_constant("math", "Phi", Value::Number(PHI))
        .expect("math package exists");

    unary(registry, "abs", "Returns the absolute value of a number.", f64::abs);
    unary(registry, "ceil", "Rounds a number up to the nearest integer.", f64::ceil);
    unary(registry, "floor", "Rounds a number down to the nearest integer.", f64::floor);
    unary(registry, "round", "Rounds a number to the nearest integer.", f64::round);
    unary(registry, "trunc", "Drops the fractional part of a number.", f64::trunc);
    unary(registry, "sqrt", "Returns the square root of a number.", f64::sqrt);
    unary(registry, "log", "Returns the natural logarithm of a number.", f64::ln);
    unary(registry, "log2", "Returns the base 2 logarithm of a number.", f64::log2);
    unary(registry, "log10", "Returns the base 10 logarithm of a number.", f64::log10);
    unary(registry, "sin", "Returns the sine of a radian argument.", f64::sin);
    unary(registry, "cos", "Returns the cosine of a radian argument.", f64::cos);
    unary(registry, "tan", "Returns the tangent of a radian argument.", f64::tan);
    unary(registry, "asin", "Returns the arcsine of a number.", f64::asin);
    unary(registry, "acos", "Returns the arccosine of a number.", f64::acos);
    unary(registry, "atan", "Returns the arctangent of a number.", f64::atan);

    registry
        .add_function(
            "math",
            "pow",
            Arc::new(NativeFunction::new(
                "pow",
                "Returns base raised to the power of the exponent.",
                |args, _ctx| {
                    check_min_args("pow", args, 2)?;
                    check_max_args("pow", args, 2)?;
                    Ok(Value::Number(
                        num_arg("pow", args, 0)?.powf(num_arg("pow", args, 1)?),
                    ))
                },
            )),
        )
        .expect("math package exists");
}
