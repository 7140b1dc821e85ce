//! Tree-walking evaluator.
//!
//! Each logical evaluation runs under a thread id and an [`EvalCtx`] which
//! carries the runtime provider, the per-evaluation instance state (iterator
//! cursors), the monitor of the triggering event (inside sink bodies) and
//! the call depth the debugger steps against.
//!
//! Control flow uses error sentinels: `return`, `break` and `continue`
//! propagate as errors with the matching sentinel kind and are caught by the
//! nearest function call or loop. The iterator protocol works the same way:
//! an iterator function answers its first call with the `*isiterator*`
//! sentinel, then yields one value per re-evaluation until it answers
//! `*endofiteration*`.

use std::sync::Arc;

use ahash::AHashMap;
use smallvec::SmallVec;

use crate::{
    ast::{AstNode, CodeLoc, NodeKind, NodeValue},
    bridge::{self, EcalFunction},
    engine::{Monitor, Rule},
    errors::{ErrorKind, EvalResult, RuntimeError},
    provider::ProviderCore,
    scope::Scope,
    value::{FuncParam, FuncValue, MapKey, UserFunction, Value, ValueMap},
};

/// Per-evaluation state threaded through every node visit.
pub(crate) struct EvalCtx<'p> {
    provider: &'p Arc<ProviderCore>,
    tid: u64,
    monitor: Option<Monitor>,
    instance: AHashMap<String, Value>,
    depth: usize,
    stack: Vec<String>,
    /// When false, the debug hook is not notified. Used for expressions the
    /// debugger itself evaluates (`inject`).
    debug: bool,
    /// Set once the hook has seen the currently propagating error.
    reported_error: bool,
}

impl EvalCtx<'_> {
    fn hook(&self) -> Option<Arc<dyn crate::debugger::DebugHook>> {
        if self.debug {
            self.provider.debug_hook()
        } else {
            None
        }
    }
}

/// Evaluates a validated AST with a fresh evaluation context.
pub(crate) fn eval_with_monitor(
    node: &AstNode,
    scope: &Scope,
    provider: &Arc<ProviderCore>,
    tid: u64,
    monitor: Option<Monitor>,
) -> EvalResult<Value> {
    let mut ctx = EvalCtx {
        provider,
        tid,
        monitor,
        instance: AHashMap::new(),
        depth: 0,
        stack: Vec::new(),
        debug: true,
        reported_error: false,
    };
    let result = match eval_node(node, scope, &mut ctx) {
        // A top level return ends the evaluation with the returned value;
        // this is how an entry script chooses the process exit code.
        Err(err) if err.kind == ErrorKind::Return => Ok(err.value.unwrap_or(Value::Null)),
        other => other,
    };
    if let Some(hook) = provider.debug_hook() {
        hook.thread_finished(tid);
    }
    result
}

/// Evaluates without notifying an attached debugger.
pub(crate) fn eval_silent(
    node: &AstNode,
    scope: &Scope,
    provider: &Arc<ProviderCore>,
    tid: u64,
) -> EvalResult<Value> {
    let mut ctx = EvalCtx {
        provider,
        tid,
        monitor: None,
        instance: AHashMap::new(),
        depth: 0,
        stack: Vec::new(),
        debug: false,
        reported_error: false,
    };
    eval_node(node, scope, &mut ctx)
}

/// Key under which a call site stores iterator state. The call depth
/// disambiguates recursive re-entry of the same source position.
fn instance_key(loc: &CodeLoc, depth: usize) -> String {
    format!("{}:{}:{}@{depth}", loc.source, loc.line, loc.pos)
}

fn eval_node(node: &AstNode, scope: &Scope, ctx: &mut EvalCtx<'_>) -> EvalResult<Value> {
    if let Some(hook) = ctx.hook() {
        hook.visit_state(node, scope, ctx.tid, ctx.depth, &ctx.stack)?;
    }
    let result = eval_node_inner(node, scope, ctx);
    // Report an error once, at the innermost node that sees it.
    match &result {
        Err(err) if !err.is_control_flow() => {
            if !ctx.reported_error {
                ctx.reported_error = true;
                if let Some(hook) = ctx.hook() {
                    hook.visit_error(node, scope, ctx.tid, err)?;
                }
            }
        }
        Ok(_) => ctx.reported_error = false,
        Err(_) => {}
    }
    result
}

fn eval_node_inner(node: &AstNode, scope: &Scope, ctx: &mut EvalCtx<'_>) -> EvalResult<Value> {
    match node.kind {
        NodeKind::Number => match node.value {
            NodeValue::Num(n) => Ok(Value::Number(n)),
            _ => Err(invalid(node, "Number literal without value")),
        },
        NodeKind::StringLit => match &node.value {
            NodeValue::Str(s) if s.contains("{{") => render_template(s, scope, ctx, node),
            NodeValue::Str(s) => Ok(Value::Str(s.clone())),
            _ => Err(invalid(node, "String literal without value")),
        },
        NodeKind::True => Ok(Value::Bool(true)),
        NodeKind::False => Ok(Value::Bool(false)),
        NodeKind::Null => Ok(Value::Null),
        NodeKind::Identifier => eval_identifier(node, scope, ctx),
        NodeKind::ListLit => {
            let mut items = Vec::with_capacity(node.children.len());
            for child in &node.children {
                items.push(eval_node(child, scope, ctx)?);
            }
            Ok(Value::List(items))
        }
        NodeKind::MapLit => {
            let mut map = ValueMap::new();
            for entry in &node.children {
                let key = eval_node(&entry.children[0], scope, ctx)?;
                let value = eval_node(&entry.children[1], scope, ctx)?;
                let key = MapKey::from_value(&key).map_err(|kind| {
                    RuntimeError::new(
                        ErrorKind::Runtime,
                        format!("Cannot use a {kind} as a map key"),
                    )
                    .at_node(&entry.children[0])
                })?;
                map.insert(key, value);
            }
            Ok(Value::Map(map))
        }
        NodeKind::Access | NodeKind::Index => eval_access(node, scope, ctx),
        NodeKind::Call => eval_call(node, scope, ctx),

        NodeKind::Neg => Ok(Value::Number(-eval_num(&node.children[0], scope, ctx)?)),
        NodeKind::Pos => Ok(Value::Number(eval_num(&node.children[0], scope, ctx)?)),
        NodeKind::Not => Ok(Value::Bool(!eval_bool(&node.children[0], scope, ctx)?)),
        NodeKind::Plus => eval_arith(node, scope, ctx, |a, b| Ok(a + b)),
        NodeKind::Minus => eval_arith(node, scope, ctx, |a, b| Ok(a - b)),
        NodeKind::Times => eval_arith(node, scope, ctx, |a, b| Ok(a * b)),
        NodeKind::Div => eval_arith(node, scope, ctx, |a, b| Ok(a / b)),
        NodeKind::DivInt => eval_arith(node, scope, ctx, |a, b| {
            if b == 0.0 {
                Err(String::from("Division by zero"))
            } else {
                Ok((a / b).trunc())
            }
        }),
        NodeKind::ModInt => eval_arith(node, scope, ctx, |a, b| {
            if b as i64 == 0 {
                Err(String::from("Division by zero"))
            } else {
                Ok((a as i64 % b as i64) as f64)
            }
        }),
        NodeKind::And => {
            if !eval_bool(&node.children[0], scope, ctx)? {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(eval_bool(&node.children[1], scope, ctx)?))
        }
        NodeKind::Or => {
            if eval_bool(&node.children[0], scope, ctx)? {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(eval_bool(&node.children[1], scope, ctx)?))
        }
        NodeKind::Eq => Ok(Value::Bool(
            eval_node(&node.children[0], scope, ctx)? == eval_node(&node.children[1], scope, ctx)?,
        )),
        NodeKind::Neq => Ok(Value::Bool(
            eval_node(&node.children[0], scope, ctx)? != eval_node(&node.children[1], scope, ctx)?,
        )),
        NodeKind::Gt => eval_compare(node, scope, ctx, |o| o == std::cmp::Ordering::Greater),
        NodeKind::Gte => eval_compare(node, scope, ctx, |o| o != std::cmp::Ordering::Less),
        NodeKind::Lt => eval_compare(node, scope, ctx, |o| o == std::cmp::Ordering::Less),
        NodeKind::Lte => eval_compare(node, scope, ctx, |o| o != std::cmp::Ordering::Greater),
        NodeKind::In => eval_membership(node, scope, ctx, false),
        NodeKind::NotIn => eval_membership(node, scope, ctx, true),

        NodeKind::Statements => {
            let mut result = Value::Null;
            for child in &node.children {
                result = eval_node(child, scope, ctx)?;
            }
            Ok(result)
        }
        NodeKind::Assign => {
            let value = eval_node(&node.children[1], scope, ctx)?;
            assign_target(&node.children[0], value, scope, ctx)?;
            Ok(Value::Null)
        }
        NodeKind::If => eval_if(node, scope, ctx),
        NodeKind::Loop => eval_loop(node, scope, ctx),
        // break ends the iteration, continue skips to the next one. Both
        // travel as sentinels to the nearest enclosing loop.
        NodeKind::Break => Err(RuntimeError::new(ErrorKind::EndOfIteration, "").at_node(node)),
        NodeKind::Continue => {
            Err(RuntimeError::new(ErrorKind::ContinueIteration, "").at_node(node))
        }
        NodeKind::Return => {
            let value = match node.children.first() {
                Some(child) => eval_node(child, scope, ctx)?,
                None => Value::Null,
            };
            Err(RuntimeError::new(ErrorKind::Return, "")
                .with_value(value)
                .at_node(node))
        }
        NodeKind::FuncDecl => eval_func_decl(node, scope),
        NodeKind::Sink => eval_sink_decl(node, scope, ctx),
        NodeKind::Import => eval_import(node, scope, ctx),
        NodeKind::Try => eval_try(node, scope, ctx),
        NodeKind::Mutex => {
            let mutex = ctx.provider.mutex(node.value.name());
            let _guard = mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            let block_scope =
                Scope::new_with_parent(format!("block: mutex (Line:{})", node.loc.line), scope);
            eval_node(&node.children[0], &block_scope, ctx)
        }
        _ => Err(RuntimeError::new(
            ErrorKind::UnknownConstruct,
            format!("Cannot evaluate: {}", node.kind),
        )
        .at_node(node)),
    }
}

fn invalid(node: &AstNode, detail: &str) -> RuntimeError {
    RuntimeError::new(ErrorKind::InvalidConstruct, detail).at_node(node)
}

// ---------------------------------------------------------------------------
// Operand helpers
// ---------------------------------------------------------------------------

fn eval_num(node: &AstNode, scope: &Scope, ctx: &mut EvalCtx<'_>) -> EvalResult<f64> {
    let value = eval_node(node, scope, ctx)?;
    value
        .as_number()
        .ok_or_else(|| RuntimeError::new(ErrorKind::NotANumber, node.describe()).at_node(node))
}

fn eval_bool(node: &AstNode, scope: &Scope, ctx: &mut EvalCtx<'_>) -> EvalResult<bool> {
    let value = eval_node(node, scope, ctx)?;
    value
        .as_bool()
        .ok_or_else(|| RuntimeError::new(ErrorKind::NotABoolean, node.describe()).at_node(node))
}

fn eval_arith(
    node: &AstNode,
    scope: &Scope,
    ctx: &mut EvalCtx<'_>,
    op: impl Fn(f64, f64) -> Result<f64, String>,
) -> EvalResult<Value> {
    let a = eval_num(&node.children[0], scope, ctx)?;
    let b = eval_num(&node.children[1], scope, ctx)?;
    op(a, b)
        .map(Value::Number)
        .map_err(|detail| RuntimeError::new(ErrorKind::Runtime, detail).at_node(node))
}

fn eval_compare(
    node: &AstNode,
    scope: &Scope,
    ctx: &mut EvalCtx<'_>,
    test: impl Fn(std::cmp::Ordering) -> bool,
) -> EvalResult<Value> {
    let a = eval_node(&node.children[0], scope, ctx)?;
    let b = eval_node(&node.children[1], scope, ctx)?;
    let ordering = match (&a, &b) {
        (Value::Number(x), Value::Number(y)) => x
            .partial_cmp(y)
            .unwrap_or(std::cmp::Ordering::Greater),
        (Value::Str(x), Value::Str(y)) => x.cmp(y),
        (Value::Number(_), _) | (Value::Str(_), _) => {
            return Err(RuntimeError::new(ErrorKind::NotANumber, node.children[1].describe())
                .at_node(&node.children[1]));
        }
        _ => {
            return Err(RuntimeError::new(ErrorKind::NotANumber, node.children[0].describe())
                .at_node(&node.children[0]));
        }
    };
    Ok(Value::Bool(test(ordering)))
}

fn eval_membership(
    node: &AstNode,
    scope: &Scope,
    ctx: &mut EvalCtx<'_>,
    negate: bool,
) -> EvalResult<Value> {
    let needle = eval_node(&node.children[0], scope, ctx)?;
    let haystack = eval_node(&node.children[1], scope, ctx)?;
    let found = match &haystack {
        Value::List(items) => items.contains(&needle),
        Value::Map(map) => container_key(map, &needle).is_some(),
        _ => {
            return Err(RuntimeError::new(
                ErrorKind::NotAListOrMap,
                node.children[1].describe(),
            )
            .at_node(&node.children[1]));
        }
    };
    Ok(Value::Bool(found != negate))
}

/// Probes a map for a key value, cross-matching numbers against their
/// decimal string spelling.
fn container_key(map: &ValueMap, key: &Value) -> Option<MapKey> {
    if let Ok(direct) = MapKey::from_value(key) {
        if map.contains_key(&direct) {
            return Some(direct);
        }
    }
    match key {
        Value::Number(n) => {
            let spelled = MapKey::Str(Value::Number(*n).to_string());
            map.contains_key(&spelled).then_some(spelled)
        }
        Value::Str(s) => {
            let n: f64 = s.parse().ok()?;
            let numeric = MapKey::num(n);
            map.contains_key(&numeric).then_some(numeric)
        }
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Variable access
// ---------------------------------------------------------------------------

fn eval_identifier(node: &AstNode, scope: &Scope, ctx: &mut EvalCtx<'_>) -> EvalResult<Value> {
    let name = node.value.name();
    if let Some(value) = scope.get_value(name).map_err(|e| RuntimeError::from(e).at_node(node))? {
        return Ok(value);
    }
    if let Some(func) = ctx.provider.stdlib.internal_function(name) {
        return Ok(Value::Func(FuncValue::Stdlib(func)));
    }
    Err(RuntimeError::new(ErrorKind::VarAccess, format!("{name} is not defined")).at_node(node))
}

/// Flattens a static access chain (`a.b[2].c`) rooted at an identifier into
/// dotted path components. Index key expressions are evaluated here, so a
/// chain is flattened at most once per evaluation.
fn flatten_path(
    node: &AstNode,
    scope: &Scope,
    ctx: &mut EvalCtx<'_>,
) -> EvalResult<Option<Vec<String>>> {
    match node.kind {
        NodeKind::Identifier => Ok(Some(vec![node.value.name().to_owned()])),
        NodeKind::Access => {
            let Some(mut components) = flatten_path(&node.children[0], scope, ctx)? else {
                return Ok(None);
            };
            components.push(node.value.name().to_owned());
            Ok(Some(components))
        }
        NodeKind::Index => {
            let Some(mut components) = flatten_path(&node.children[0], scope, ctx)? else {
                return Ok(None);
            };
            let key = eval_node(&node.children[1], scope, ctx)?;
            components.push(key.to_string());
            Ok(Some(components))
        }
        _ => Ok(None),
    }
}

fn eval_access(node: &AstNode, scope: &Scope, ctx: &mut EvalCtx<'_>) -> EvalResult<Value> {
    if let Some(components) = flatten_path(node, scope, ctx)? {
        let path = components.join(".");
        if let Some(value) = scope.get_value(&path).map_err(|e| RuntimeError::from(e).at_node(node))? {
            return Ok(value);
        }
        // Not a variable: try the stdlib (package constant or function).
        if let Some(value) = ctx.provider.stdlib.lookup(&path) {
            return Ok(value);
        }
        return Err(
            RuntimeError::new(ErrorKind::VarAccess, format!("{path} is not defined")).at_node(node),
        );
    }
    // Dynamic base expression: index into the evaluated value.
    let container = eval_node(&node.children[0], scope, ctx)?;
    let key = match node.kind {
        NodeKind::Access => Value::Str(node.value.name().to_owned()),
        _ => eval_node(&node.children[1], scope, ctx)?,
    };
    index_value(&container, &key, node)
}

fn index_value(container: &Value, key: &Value, node: &AstNode) -> EvalResult<Value> {
    match container {
        Value::Map(map) => match container_key(map, key) {
            Some(map_key) => Ok(map[&map_key].clone()),
            None => Err(RuntimeError::new(
                ErrorKind::VarAccess,
                format!("Container field {key} does not exist"),
            )
            .at_node(node)),
        },
        Value::List(items) => {
            let Some(raw) = key.as_number() else {
                return Err(RuntimeError::new(
                    ErrorKind::VarAccess,
                    format!("List needs a number index not: {key}"),
                )
                .at_node(node));
            };
            let raw = raw as i64;
            let index = if raw < 0 { raw + items.len() as i64 } else { raw };
            if index < 0 || index as usize >= items.len() {
                return Err(RuntimeError::new(
                    ErrorKind::VarAccess,
                    format!("Out of bounds access to list with index: {raw}"),
                )
                .at_node(node));
            }
            Ok(items[index as usize].clone())
        }
        _ => Err(
            RuntimeError::new(ErrorKind::NotAListOrMap, node.children[0].describe()).at_node(node),
        ),
    }
}

fn assign_target(
    target: &AstNode,
    value: Value,
    scope: &Scope,
    ctx: &mut EvalCtx<'_>,
) -> EvalResult<()> {
    if target.kind == NodeKind::TargetList {
        let Value::List(items) = value else {
            return Err(RuntimeError::new(
                ErrorKind::Runtime,
                format!(
                    "Must have a list with {} values on the right side of the assignment",
                    target.children.len()
                ),
            )
            .at_node(target));
        };
        if items.len() != target.children.len() {
            return Err(RuntimeError::new(
                ErrorKind::Runtime,
                format!(
                    "Must have a list with {} values on the right side of the assignment",
                    target.children.len()
                ),
            )
            .at_node(target));
        }
        for (child, item) in target.children.iter().zip(items) {
            assign_target(child, item, scope, ctx)?;
        }
        return Ok(());
    }
    let Some(components) = flatten_path(target, scope, ctx)? else {
        return Err(invalid(target, "Cannot assign to this expression"));
    };
    scope
        .set_value(&components.join("."), value)
        .map_err(|e| RuntimeError::from(e).at_node(target))
}

// ---------------------------------------------------------------------------
// Control flow
// ---------------------------------------------------------------------------

fn eval_if(node: &AstNode, scope: &Scope, ctx: &mut EvalCtx<'_>) -> EvalResult<Value> {
    for guard in &node.children {
        if eval_bool(&guard.children[0], scope, ctx)? {
            let block_scope =
                Scope::new_with_parent(format!("block: if (Line:{})", guard.loc.line), scope);
            return eval_node(&guard.children[1], &block_scope, ctx);
        }
    }
    Ok(Value::Null)
}

fn eval_loop(node: &AstNode, scope: &Scope, ctx: &mut EvalCtx<'_>) -> EvalResult<Value> {
    let var = node.children[0].value.name().to_owned();
    let iterable = &node.children[1];
    let body = &node.children[2];
    let loop_scope = Scope::new_with_parent(format!("block: for (Line:{})", node.loc.line), scope);

    let mut run_body = |item: Value, ctx: &mut EvalCtx<'_>| -> EvalResult<bool> {
        loop_scope
            .set_local_value(&var, item)
            .map_err(|e| RuntimeError::from(e).at_node(&node.children[0]))?;
        match eval_node(body, &loop_scope, ctx) {
            Ok(_) => Ok(true),
            Err(err) if err.kind == ErrorKind::ContinueIteration => Ok(true),
            Err(err) if err.kind == ErrorKind::EndOfIteration => Ok(false),
            Err(err) => Err(err),
        }
    };

    match eval_node(iterable, scope, ctx) {
        Ok(Value::List(items)) => {
            for item in items {
                if !run_body(item, ctx)? {
                    break;
                }
            }
        }
        Ok(Value::Map(map)) => {
            let keys: Vec<Value> = map.keys().map(MapKey::to_value).collect();
            for key in keys {
                if !run_body(key, ctx)? {
                    break;
                }
            }
        }
        Ok(other) => {
            return Err(RuntimeError::new(
                ErrorKind::NotAList,
                format!("Cannot iterate over a {}", other.kind_name()),
            )
            .at_node(iterable));
        }
        Err(err) if err.kind == ErrorKind::IsIterator => loop {
            match eval_node(iterable, scope, ctx) {
                Ok(item) => {
                    if !run_body(item, ctx)? {
                        // Drop the iterator state so the next entry of this
                        // loop starts fresh.
                        ctx.instance.remove(&instance_key(&iterable.loc, ctx.depth));
                        break;
                    }
                }
                Err(err) if err.kind == ErrorKind::EndOfIteration => break,
                Err(err) => return Err(err),
            }
        },
        Err(err) => return Err(err),
    }
    Ok(Value::Null)
}

fn eval_try(node: &AstNode, scope: &Scope, ctx: &mut EvalCtx<'_>) -> EvalResult<Value> {
    let try_scope = Scope::new_with_parent(format!("block: try (Line:{})", node.loc.line), scope);
    let result = eval_node(&node.children[0], &try_scope, ctx);
    let handlers = &node.children[1..];

    let handled = match result {
        Err(err) if !err.is_control_flow() => {
            if let Some(handler) = handlers.iter().find(|h| h.kind == NodeKind::Except) {
                let except_scope =
                    Scope::new_with_parent(format!("block: except (Line:{})", handler.loc.line), scope);
                if let NodeValue::Name(var) = &handler.value {
                    except_scope
                        .set_local_value(var, error_to_value(&err))
                        .map_err(|e| RuntimeError::from(e).at_node(handler))?;
                }
                eval_node(&handler.children[0], &except_scope, ctx)
            } else {
                Err(err)
            }
        }
        Ok(value) => {
            if let Some(handler) = handlers.iter().find(|h| h.kind == NodeKind::Otherwise) {
                let otherwise_scope = Scope::new_with_parent(
                    format!("block: otherwise (Line:{})", handler.loc.line),
                    scope,
                );
                eval_node(&handler.children[0], &otherwise_scope, ctx)?;
            }
            Ok(value)
        }
        control => control,
    };

    if let Some(handler) = handlers.iter().find(|h| h.kind == NodeKind::Finally) {
        let finally_scope =
            Scope::new_with_parent(format!("block: finally (Line:{})", handler.loc.line), scope);
        eval_node(&handler.children[0], &finally_scope, ctx)?;
    }
    handled
}

/// The map bound to an `except` variable: error kind, detail and position.
fn error_to_value(err: &RuntimeError) -> Value {
    let mut map = ValueMap::new();
    map.insert(MapKey::Str("type".into()), Value::Str(err.kind.to_string()));
    map.insert(MapKey::Str("error".into()), Value::Str(err.detail.clone()));
    map.insert(MapKey::Str("source".into()), Value::Str(err.source.clone()));
    if let Some(loc) = &err.loc {
        map.insert(MapKey::Str("line".into()), Value::Number(f64::from(loc.line)));
        map.insert(MapKey::Str("pos".into()), Value::Number(f64::from(loc.pos)));
    }
    Value::Map(map)
}

// ---------------------------------------------------------------------------
// Functions and calls
// ---------------------------------------------------------------------------

fn eval_func_decl(node: &AstNode, scope: &Scope) -> EvalResult<Value> {
    let params = node.children[0]
        .children
        .iter()
        .map(|param| FuncParam {
            name: param.value.name().to_owned(),
            default: param.children.first().cloned(),
        })
        .collect();
    let name = match &node.value {
        NodeValue::Name(name) => Some(name.clone()),
        _ => None,
    };
    let func = Value::Func(FuncValue::User(Arc::new(UserFunction {
        name: name.clone(),
        params,
        body: node.children[1].clone(),
    })));
    if let Some(name) = name {
        scope
            .set_value(&name, func.clone())
            .map_err(|e| RuntimeError::from(e).at_node(node))?;
    }
    Ok(func)
}

/// Call argument buffer; most calls have only a handful of arguments.
type ArgVec = SmallVec<[Value; 8]>;

fn eval_call(node: &AstNode, scope: &Scope, ctx: &mut EvalCtx<'_>) -> EvalResult<Value> {
    let callee = eval_node(&node.children[0], scope, ctx)?;
    let mut args = ArgVec::with_capacity(node.children.len() - 1);
    for arg in &node.children[1..] {
        args.push(eval_node(arg, scope, ctx)?);
    }
    let result = match callee {
        Value::Func(FuncValue::User(func)) => call_user_function(&func, args, node, scope, ctx),
        Value::Func(FuncValue::Stdlib(func)) => call_stdlib_function(&func, &args, node, scope, ctx),
        _ => Err(RuntimeError::new(
            ErrorKind::Runtime,
            format!("Cannot call: {}", node.children[0].describe()),
        )
        .at_node(node)),
    };
    result.map_err(|mut err| {
        if !err.is_control_flow() {
            err.add_trace(node);
        }
        err
    })
}

fn call_user_function(
    func: &Arc<UserFunction>,
    args: ArgVec,
    node: &AstNode,
    scope: &Scope,
    ctx: &mut EvalCtx<'_>,
) -> EvalResult<Value> {
    let name = func.name.as_deref().unwrap_or("anonymous");
    if args.len() > func.params.len() {
        return Err(RuntimeError::new(
            ErrorKind::Runtime,
            format!("Too many parameters in call to {name}"),
        )
        .at_node(node));
    }
    let func_scope = Scope::new_with_parent(
        format!("func: {name} (Line:{})", node.loc.line),
        scope,
    );
    let mut args = args.into_iter();
    for param in &func.params {
        let value = match args.next() {
            Some(value) => value,
            None => match &param.default {
                Some(default) => eval_node(default, &func_scope, ctx)?,
                None => Value::Null,
            },
        };
        func_scope
            .set_local_value(&param.name, value)
            .map_err(|e| RuntimeError::from(e).at_node(node))?;
    }

    if let Some(hook) = ctx.hook() {
        hook.visit_step_in_state(node, ctx.tid, ctx.depth)?;
    }
    ctx.depth += 1;
    ctx.stack.push(format!("{name} ({})", node.loc));
    let result = eval_node(&func.body, &func_scope, ctx);
    ctx.stack.pop();
    ctx.depth -= 1;
    if let Some(hook) = ctx.hook() {
        hook.visit_step_out_state(node, ctx.tid, ctx.depth)?;
    }

    match result {
        // A function body without an explicit return yields null.
        Ok(_) => Ok(Value::Null),
        Err(err) if err.kind == ErrorKind::Return => Ok(err.value.unwrap_or(Value::Null)),
        Err(err) => Err(err),
    }
}

fn call_stdlib_function(
    func: &Arc<dyn EcalFunction>,
    args: &[Value],
    node: &AstNode,
    scope: &Scope,
    ctx: &mut EvalCtx<'_>,
) -> EvalResult<Value> {
    let mut fctx = FunctionContext {
        provider: Arc::clone(ctx.provider),
        scope: scope.clone(),
        tid: ctx.tid,
        monitor: ctx.monitor.clone(),
        instance_key: instance_key(&node.loc, ctx.depth),
        instance: &mut ctx.instance,
    };
    bridge::call_host_function(func.as_ref(), args, &mut fctx).map_err(|err| err.at_node(node))
}

/// Context handed to stdlib and host functions.
pub struct FunctionContext<'e> {
    pub(crate) provider: Arc<ProviderCore>,
    pub(crate) scope: Scope,
    pub(crate) tid: u64,
    pub(crate) monitor: Option<Monitor>,
    pub(crate) instance_key: String,
    pub(crate) instance: &'e mut AHashMap<String, Value>,
}

impl FunctionContext<'_> {
    /// The scope of the calling code.
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// The thread id of the calling evaluation.
    pub fn tid(&self) -> u64 {
        self.tid
    }

    /// The monitor of the event whose sink body is running, if any.
    pub fn monitor(&self) -> Option<&Monitor> {
        self.monitor.as_ref()
    }

    pub fn log_info(&self, msg: &str) {
        self.provider.logger.log_info("", format_args!("{msg}"));
    }

    pub fn log_debug(&self, msg: &str) {
        self.provider.logger.log_debug("", format_args!("{msg}"));
    }

    pub fn log_error(&self, msg: &str) {
        self.provider.logger.log_error("", format_args!("{msg}"));
    }

    /// Per call-site instance state, used by iterator functions to keep
    /// their cursor between re-evaluations.
    pub fn instance_get(&self) -> Option<&Value> {
        self.instance.get(&self.instance_key)
    }

    pub fn instance_set(&mut self, value: Value) {
        self.instance.insert(self.instance_key.clone(), value);
    }

    pub fn instance_clear(&mut self) {
        self.instance.remove(&self.instance_key);
    }
}

// ---------------------------------------------------------------------------
// Declarations
// ---------------------------------------------------------------------------

fn eval_sink_decl(node: &AstNode, scope: &Scope, ctx: &mut EvalCtx<'_>) -> EvalResult<Value> {
    let name = node.value.name().to_owned();
    let mut kind_match: Option<Vec<String>> = None;
    let mut state_match: Option<ValueMap> = None;
    let mut suppresses: Vec<String> = Vec::new();
    let mut priority: i64 = 0;
    for clause in &node.children[..node.children.len() - 1] {
        let value = eval_node(&clause.children[0], scope, ctx)?;
        match clause.kind {
            NodeKind::Kindmatch => {
                kind_match = Some(string_list(&value).ok_or_else(|| {
                    invalid(clause, "kindmatch needs a list of strings")
                })?);
            }
            NodeKind::Statematch => match value {
                Value::Map(map) => state_match = Some(map),
                _ => return Err(invalid(clause, "statematch needs a map")),
            },
            NodeKind::Suppresses => {
                suppresses = string_list(&value)
                    .ok_or_else(|| invalid(clause, "suppresses needs a list of strings"))?;
            }
            NodeKind::Priority => {
                priority = value.as_number().ok_or_else(|| {
                    invalid(clause, "priority needs a number")
                })? as i64;
            }
            _ => return Err(invalid(clause, "Unknown sink clause")),
        }
    }
    let Some(kind_match) = kind_match else {
        return Err(invalid(node, &format!("Sink {name} needs a kindmatch clause")));
    };
    let body = node.children.last().expect("sink has a body");
    let rule = Rule::new(
        name,
        kind_match,
        state_match,
        suppresses,
        priority,
        Some(Arc::new(body.clone())),
    )
    .map_err(|err| err.at_node(node))?;
    ctx.provider.processor.add_rule(rule);
    Ok(Value::Null)
}

fn string_list(value: &Value) -> Option<Vec<String>> {
    match value {
        Value::List(items) => items
            .iter()
            .map(|item| item.as_str().map(str::to_owned))
            .collect(),
        _ => None,
    }
}

fn eval_import(node: &AstNode, scope: &Scope, ctx: &mut EvalCtx<'_>) -> EvalResult<Value> {
    let NodeValue::Str(path) = &node.children[0].value else {
        return Err(invalid(node, "Import needs a path string"));
    };
    let alias = node.value.name();
    let module = match ctx.provider.cached_import(path) {
        Some(module) => module,
        None => {
            let source = ctx
                .provider
                .import_locator
                .resolve(path)
                .map_err(|err| err.at_node(node))?;
            let ast = crate::parser::parse(path, &source)?;
            let module_scope =
                Scope::new_with_parent(format!("module: {path}"), &ctx.provider.global_scope);
            eval_node(&ast, &module_scope, ctx).map_err(|mut err| {
                err.add_trace(node);
                err
            })?;
            let mut map = ValueMap::new();
            for (name, value) in module_scope.local_values() {
                map.insert(MapKey::Str(name), value);
            }
            let module = Value::Map(map);
            ctx.provider.cache_import(path, module.clone());
            module
        }
    };
    scope
        .set_value(alias, module)
        .map_err(|e| RuntimeError::from(e).at_node(node))?;
    Ok(Value::Null)
}

// ---------------------------------------------------------------------------
// Template strings
// ---------------------------------------------------------------------------

/// Replaces `{{expr}}` segments in a string literal with the display form of
/// the evaluated expression.
fn render_template(
    template: &str,
    scope: &Scope,
    ctx: &mut EvalCtx<'_>,
    node: &AstNode,
) -> EvalResult<Value> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            return Err(invalid(node, "Unterminated {{ in template string"));
        };
        let ast = crate::parser::parse(&node.loc.source, &after[..end])?;
        let value = eval_node(&ast, scope, ctx)?;
        out.push_str(&value.to_string());
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(Value::Str(out))
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Structural checks run before the first evaluation: loop-only statements
/// outside loops, duplicate parameter names, sinks without a kindmatch
/// clause.
pub(crate) fn validate_node(node: &AstNode, in_loop: bool) -> EvalResult<()> {
    match node.kind {
        NodeKind::Break | NodeKind::Continue if !in_loop => {
            return Err(invalid(node, "Can only be used inside a loop"));
        }
        NodeKind::Loop => {
            for child in &node.children {
                validate_node(child, true)?;
            }
            return Ok(());
        }
        NodeKind::FuncDecl => {
            let params = &node.children[0];
            let mut names: Vec<&str> = params.children.iter().map(|p| p.value.name()).collect();
            names.sort_unstable();
            if names.windows(2).any(|pair| pair[0] == pair[1]) {
                return Err(invalid(node, "Duplicate parameter name"));
            }
            // A function body is a fresh loop context.
            for child in &node.children {
                validate_node(child, false)?;
            }
            return Ok(());
        }
        NodeKind::Sink => {
            if !node.children[..node.children.len() - 1]
                .iter()
                .any(|clause| clause.kind == NodeKind::Kindmatch)
            {
                return Err(invalid(
                    node,
                    &format!("Sink {} needs a kindmatch clause", node.value.name()),
                ));
            }
            for child in &node.children {
                validate_node(child, false)?;
            }
            return Ok(());
        }
        _ => {}
    }
    for child in &node.children {
        validate_node(child, in_loop)?;
    }
    Ok(())
}
