//! Thread-aware debugger.
//!
//! The evaluator reports progress through the [`DebugHook`] trait, whose
//! default methods are no-ops so evaluation without an attached debugger
//! pays a single optional check per node. [`EcalDebugger`] implements the
//! hook with a per-thread registry: a thread suspends on a breakpoint hit, a
//! step boundary or a start break, and blocks on its condition variable
//! until a `cont` command (or a kill) releases it.
//!
//! All command output is JSON so the debug wire can ship it unchanged.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    str::FromStr,
    sync::{
        Arc, Condvar, Mutex, RwLock, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use serde_json::json;
use strum::{Display, EnumString};

use crate::{
    ast::{AstNode, CodeLoc},
    errors::{ErrorKind, EvalResult, RuntimeError},
    eval,
    provider::ProviderCore,
    scope::Scope,
};

/// Evaluator-side hook points. All methods default to no-ops.
pub trait DebugHook: Send + Sync {
    /// Called on entry to every AST node evaluation. May block the calling
    /// thread; an error aborts the evaluation (thread kill).
    fn visit_state(
        &self,
        _node: &AstNode,
        _scope: &Scope,
        _tid: u64,
        _depth: usize,
        _stack: &[String],
    ) -> EvalResult<()> {
        Ok(())
    }

    /// Called when a function call pushes a new frame.
    fn visit_step_in_state(&self, _node: &AstNode, _tid: u64, _depth: usize) -> EvalResult<()> {
        Ok(())
    }

    /// Called when a function call pops its frame. `depth` is the depth
    /// after the pop.
    fn visit_step_out_state(&self, _node: &AstNode, _tid: u64, _depth: usize) -> EvalResult<()> {
        Ok(())
    }

    /// Called once at the node an evaluation error originates from, before
    /// the error propagates.
    fn visit_error(
        &self,
        _node: &AstNode,
        _scope: &Scope,
        _tid: u64,
        _err: &RuntimeError,
    ) -> EvalResult<()> {
        Ok(())
    }

    /// Called once when an evaluation finishes.
    fn thread_finished(&self, _tid: u64) {}
}

/// Continuation mode of the `cont` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
pub enum ContMode {
    #[strum(serialize = "resume")]
    Resume,
    #[strum(serialize = "stepIn")]
    StepIn,
    #[strum(serialize = "stepOver")]
    StepOver,
    #[strum(serialize = "stepOut")]
    StepOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
enum ThreadStatus {
    Running,
    Suspended,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepMode {
    /// Break on the next node visit.
    In,
    /// Break on the next node visit at or above the recorded depth.
    Over,
    /// Arm an `In` break when the call at the recorded depth returns.
    Out,
}

struct ThreadState {
    status: ThreadStatus,
    node_desc: String,
    loc: Option<CodeLoc>,
    scope: Option<Scope>,
    stack: Vec<String>,
    depth: usize,
    last_break: Option<(String, u32)>,
    step_mode: Option<StepMode>,
    step_depth: usize,
    kill: bool,
    resume: bool,
}

struct ThreadRecord {
    state: Mutex<ThreadState>,
    cond: Condvar,
}

impl ThreadRecord {
    fn new() -> Self {
        Self {
            state: Mutex::new(ThreadState {
                status: ThreadStatus::Running,
                node_desc: String::new(),
                loc: None,
                scope: None,
                stack: Vec::new(),
                depth: 0,
                last_break: None,
                step_mode: None,
                step_depth: 0,
                kill: false,
                resume: false,
            }),
            cond: Condvar::new(),
        }
    }
}

fn killed_error() -> RuntimeError {
    RuntimeError::new(ErrorKind::Runtime, "Thread was killed")
}

/// The interactive debugger.
pub struct EcalDebugger {
    provider: Weak<ProviderCore>,
    breakpoints: RwLock<BTreeMap<(String, u32), bool>>,
    break_on_start: AtomicBool,
    break_on_error: AtomicBool,
    sources: RwLock<BTreeSet<String>>,
    source_texts: RwLock<HashMap<String, String>>,
    threads: RwLock<HashMap<u64, Arc<ThreadRecord>>>,
    /// Bumped on every observable thread state change; `stop_threads` waits
    /// for this to go quiet.
    change_counter: AtomicU64,
}

impl EcalDebugger {
    pub(crate) fn new(provider: Weak<ProviderCore>) -> Self {
        Self {
            provider,
            breakpoints: RwLock::new(BTreeMap::new()),
            break_on_start: AtomicBool::new(false),
            break_on_error: AtomicBool::new(false),
            sources: RwLock::new(BTreeSet::new()),
            source_texts: RwLock::new(HashMap::new()),
            threads: RwLock::new(HashMap::new()),
            change_counter: AtomicU64::new(0),
        }
    }

    fn bump(&self) {
        self.change_counter.fetch_add(1, Ordering::SeqCst);
    }

    /// Makes a source (and its text, for identifier breakpoints) known to
    /// the debugger.
    pub fn register_source(&self, name: &str, text: &str) {
        self.sources
            .write()
            .expect("debugger lock poisoned")
            .insert(name.to_owned());
        self.source_texts
            .write()
            .expect("debugger lock poisoned")
            .insert(name.to_owned(), text.to_owned());
    }

    pub fn set_break_on_start(&self, flag: bool) {
        self.break_on_start.store(flag, Ordering::SeqCst);
    }

    pub fn set_break_on_error(&self, flag: bool) {
        self.break_on_error.store(flag, Ordering::SeqCst);
    }

    /// Sets an enabled breakpoint.
    pub fn set_breakpoint(&self, source: &str, line: u32) {
        self.breakpoints
            .write()
            .expect("debugger lock poisoned")
            .insert((source.to_owned(), line), true);
    }

    /// Disables (but keeps) a breakpoint.
    pub fn disable_breakpoint(&self, source: &str, line: u32) {
        if let Some(enabled) = self
            .breakpoints
            .write()
            .expect("debugger lock poisoned")
            .get_mut(&(source.to_owned(), line))
        {
            *enabled = false;
        }
    }

    /// Deletes a breakpoint.
    pub fn remove_breakpoint(&self, source: &str, line: u32) {
        self.breakpoints
            .write()
            .expect("debugger lock poisoned")
            .remove(&(source.to_owned(), line));
    }

    /// Resolves `source:line` or a bare identifier (first line mentioning
    /// it in a registered source) to a breakpoint location.
    pub fn resolve_location(&self, location: &str) -> EvalResult<(String, u32)> {
        if let Some((source, line)) = location.rsplit_once(':') {
            let line: u32 = line.parse().map_err(|_| {
                RuntimeError::new(
                    ErrorKind::InvalidState,
                    format!("Invalid line number in: {location}"),
                )
            })?;
            return Ok((source.to_owned(), line));
        }
        let word = regex::Regex::new(&format!(r"\b{}\b", regex::escape(location)))
            .expect("escaped identifier is a valid pattern");
        let texts = self.source_texts.read().expect("debugger lock poisoned");
        for (source, text) in texts.iter() {
            for (i, line) in text.lines().enumerate() {
                if word.is_match(line) {
                    return Ok((source.clone(), i as u32 + 1));
                }
            }
        }
        Err(RuntimeError::new(
            ErrorKind::InvalidState,
            format!("Cannot find: {location}"),
        ))
    }

    /// The `status` command.
    pub fn status(&self) -> serde_json::Value {
        let breakpoints: serde_json::Map<String, serde_json::Value> = self
            .breakpoints
            .read()
            .expect("debugger lock poisoned")
            .iter()
            .map(|((source, line), enabled)| (format!("{source}:{line}"), json!(enabled)))
            .collect();
        let sources: Vec<String> = self
            .sources
            .read()
            .expect("debugger lock poisoned")
            .iter()
            .cloned()
            .collect();
        let mut threads = serde_json::Map::new();
        for (tid, record) in self.threads.read().expect("debugger lock poisoned").iter() {
            let state = record.state.lock().expect("debugger lock poisoned");
            let mut entry = serde_json::Map::new();
            entry.insert("status".into(), json!(state.status.to_string()));
            if let Some(loc) = &state.loc {
                entry.insert("source".into(), json!(loc.source.as_ref()));
                entry.insert("line".into(), json!(loc.line));
            }
            threads.insert(tid.to_string(), serde_json::Value::Object(entry));
        }
        json!({
            "breakonstart": self.break_on_start.load(Ordering::SeqCst),
            "breakpoints": breakpoints,
            "sources": sources,
            "threads": threads,
        })
    }

    /// The `inspect` command: current node, call stack and scope layers of
    /// a thread.
    pub fn inspect(&self, tid: u64) -> EvalResult<serde_json::Value> {
        let record = self.record(tid)?;
        let state = record.state.lock().expect("debugger lock poisoned");
        let mut layers = Vec::new();
        let mut scope = state.scope.clone();
        while let Some(current) = scope {
            layers.push(json!({
                "name": current.name(),
                "vars": serde_json::Value::Object(current.to_json_object()),
            }));
            scope = current.parent();
        }
        Ok(json!({
            "status": state.status.to_string(),
            "node": state.node_desc,
            "location": state.loc.as_ref().map(|loc| format!("{loc}")),
            "callStack": state.stack,
            "scopes": layers,
        }))
    }

    /// The `extract` command: copies a variable from a suspended thread's
    /// scope into the global scope.
    pub fn extract(&self, tid: u64, var: &str, dest: &str) -> EvalResult<serde_json::Value> {
        let provider = self.provider()?;
        let record = self.record(tid)?;
        let scope = {
            let state = record.state.lock().expect("debugger lock poisoned");
            if state.status != ThreadStatus::Suspended {
                return Err(not_suspended(tid));
            }
            state.scope.clone().ok_or_else(|| not_suspended(tid))?
        };
        let value = scope
            .get_value(var)
            .map_err(RuntimeError::from)?
            .ok_or_else(|| {
                RuntimeError::new(ErrorKind::VarAccess, format!("{var} is not defined"))
            })?;
        provider
            .global_scope
            .set_value(dest, value.clone())
            .map_err(RuntimeError::from)?;
        Ok(value.to_json())
    }

    /// The `inject` command: evaluates an expression against the global
    /// scope and assigns the result into a suspended thread's scope.
    pub fn inject(&self, tid: u64, var: &str, expr: &str) -> EvalResult<serde_json::Value> {
        let provider = self.provider()?;
        let record = self.record(tid)?;
        let scope = {
            let state = record.state.lock().expect("debugger lock poisoned");
            if state.status != ThreadStatus::Suspended {
                return Err(not_suspended(tid));
            }
            state.scope.clone().ok_or_else(|| not_suspended(tid))?
        };
        let ast = crate::parser::parse("inject", expr)?;
        let value = eval::eval_silent(&ast, &provider.global_scope, &provider, provider.new_tid())?;
        scope.set_value(var, value.clone()).map_err(RuntimeError::from)?;
        Ok(value.to_json())
    }

    /// The `cont` command: releases a suspended thread with a step mode.
    pub fn cont(&self, tid: u64, mode: ContMode) -> EvalResult<()> {
        let record = self.record(tid)?;
        let mut state = record.state.lock().expect("debugger lock poisoned");
        if state.status != ThreadStatus::Suspended {
            return Err(not_suspended(tid));
        }
        match mode {
            ContMode::Resume => state.step_mode = None,
            ContMode::StepIn => state.step_mode = Some(StepMode::In),
            ContMode::StepOver => {
                state.step_mode = Some(StepMode::Over);
                state.step_depth = state.depth;
            }
            ContMode::StepOut => {
                state.step_mode = Some(StepMode::Out);
                state.step_depth = state.depth.saturating_sub(1);
            }
        }
        state.resume = true;
        record.cond.notify_all();
        Ok(())
    }

    /// Kills all suspended threads and returns once no thread state change
    /// has been observed for `quiet`.
    pub fn stop_threads(&self, quiet: Duration) {
        {
            let threads = self.threads.read().expect("debugger lock poisoned");
            for record in threads.values() {
                let mut state = record.state.lock().expect("debugger lock poisoned");
                if state.status == ThreadStatus::Suspended {
                    state.kill = true;
                    record.cond.notify_all();
                }
            }
        }
        loop {
            let seen = self.change_counter.load(Ordering::SeqCst);
            std::thread::sleep(quiet);
            if self.change_counter.load(Ordering::SeqCst) == seen {
                return;
            }
        }
    }

    /// Parses and executes a debugger command line (the `##` wire format).
    pub fn handle_command(&self, line: &str) -> EvalResult<serde_json::Value> {
        let mut tokens = line.split_whitespace();
        let command = tokens.next().unwrap_or("");
        let args: Vec<&str> = tokens.collect();
        let usage = |what: &str| {
            RuntimeError::new(ErrorKind::InvalidState, format!("Usage: {what}"))
        };
        match command {
            "break" => {
                let location = args.first().ok_or_else(|| usage("break <source:line>"))?;
                let (source, bp_line) = self.resolve_location(location)?;
                self.set_breakpoint(&source, bp_line);
                Ok(json!(format!("{source}:{bp_line}")))
            }
            "disable" => {
                let location = args.first().ok_or_else(|| usage("disable <source:line>"))?;
                let (source, bp_line) = self.resolve_location(location)?;
                self.disable_breakpoint(&source, bp_line);
                Ok(json!(format!("{source}:{bp_line}")))
            }
            "remove" => {
                let location = args.first().ok_or_else(|| usage("remove <source:line>"))?;
                let (source, bp_line) = self.resolve_location(location)?;
                self.remove_breakpoint(&source, bp_line);
                Ok(json!(format!("{source}:{bp_line}")))
            }
            "status" => Ok(self.status()),
            "inspect" => self.inspect(parse_tid(args.first(), "inspect <tid>")?),
            "extract" => {
                let [tid, var, dest] = args[..] else {
                    return Err(usage("extract <tid> <var> <dest>"));
                };
                self.extract(parse_tid(Some(&tid), "extract <tid> <var> <dest>")?, var, dest)
            }
            "inject" => {
                if args.len() < 3 {
                    return Err(usage("inject <tid> <var> <expression>"));
                }
                let tid = parse_tid(args.first(), "inject <tid> <var> <expression>")?;
                self.inject(tid, args[1], &args[2..].join(" "))
            }
            "cont" => {
                let [tid, mode] = args[..] else {
                    return Err(usage("cont <tid> <resume|stepIn|stepOver|stepOut>"));
                };
                let mode = ContMode::from_str(mode).map_err(|_| {
                    RuntimeError::new(ErrorKind::InvalidState, format!("Unknown mode: {mode}"))
                })?;
                self.cont(parse_tid(Some(&tid), "cont <tid> <mode>")?, mode)?;
                Ok(json!("OK"))
            }
            other => Err(RuntimeError::new(
                ErrorKind::InvalidState,
                format!("Unknown command: {other}"),
            )),
        }
    }

    fn provider(&self) -> EvalResult<Arc<ProviderCore>> {
        self.provider.upgrade().ok_or_else(|| {
            RuntimeError::new(ErrorKind::InvalidState, "Runtime provider is gone")
        })
    }

    fn record(&self, tid: u64) -> EvalResult<Arc<ThreadRecord>> {
        self.threads
            .read()
            .expect("debugger lock poisoned")
            .get(&tid)
            .cloned()
            .ok_or_else(|| {
                RuntimeError::new(ErrorKind::InvalidState, format!("Unknown thread: {tid}"))
            })
    }

    /// Suspends the calling thread until a `cont` command or a kill.
    fn suspend_current(
        &self,
        record: &Arc<ThreadRecord>,
        mut state: std::sync::MutexGuard<'_, ThreadState>,
        break_key: Option<(String, u32)>,
    ) -> EvalResult<()> {
        state.status = ThreadStatus::Suspended;
        state.step_mode = None;
        state.resume = false;
        self.bump();
        loop {
            state = record.cond.wait(state).expect("debugger lock poisoned");
            if state.kill {
                state.status = ThreadStatus::Running;
                self.bump();
                return Err(killed_error());
            }
            if state.resume {
                state.resume = false;
                break;
            }
        }
        state.status = ThreadStatus::Running;
        state.last_break = break_key;
        self.bump();
        Ok(())
    }

    fn ensure_record(&self, tid: u64) -> (Arc<ThreadRecord>, bool) {
        if let Some(record) = self.threads.read().expect("debugger lock poisoned").get(&tid) {
            return (Arc::clone(record), false);
        }
        let record = Arc::new(ThreadRecord::new());
        self.threads
            .write()
            .expect("debugger lock poisoned")
            .insert(tid, Arc::clone(&record));
        self.bump();
        (record, true)
    }
}

fn parse_tid(arg: Option<&&str>, usage: &str) -> EvalResult<u64> {
    arg.and_then(|tid| tid.parse().ok()).ok_or_else(|| {
        RuntimeError::new(ErrorKind::InvalidState, format!("Usage: {usage}"))
    })
}

fn not_suspended(tid: u64) -> RuntimeError {
    RuntimeError::new(
        ErrorKind::InvalidState,
        format!("Thread {tid} is not suspended"),
    )
}

impl DebugHook for EcalDebugger {
    fn visit_state(
        &self,
        node: &AstNode,
        scope: &Scope,
        tid: u64,
        depth: usize,
        stack: &[String],
    ) -> EvalResult<()> {
        let (record, is_new) = self.ensure_record(tid);
        let mut state = record.state.lock().expect("debugger lock poisoned");
        if state.kill {
            return Err(killed_error());
        }
        state.node_desc = node.describe();
        state.loc = Some(node.loc.clone());
        state.depth = depth;
        state.stack = stack.to_vec();
        state.scope = Some(scope.clone());

        let key = (node.loc.source.to_string(), node.loc.line);
        if state.last_break.as_ref() != Some(&key) {
            state.last_break = None;
        }

        let mut should_break = is_new && self.break_on_start.load(Ordering::SeqCst);
        match state.step_mode {
            Some(StepMode::In) => should_break = true,
            Some(StepMode::Over) if depth <= state.step_depth => should_break = true,
            _ => {}
        }
        if !should_break && state.last_break.is_none() {
            should_break = self
                .breakpoints
                .read()
                .expect("debugger lock poisoned")
                .get(&key)
                .copied()
                .unwrap_or(false);
        }
        if !should_break {
            return Ok(());
        }
        self.suspend_current(&record, state, Some(key))
    }

    fn visit_error(
        &self,
        node: &AstNode,
        scope: &Scope,
        tid: u64,
        err: &RuntimeError,
    ) -> EvalResult<()> {
        if !self.break_on_error.load(Ordering::SeqCst) {
            return Ok(());
        }
        let (record, _) = self.ensure_record(tid);
        let mut state = record.state.lock().expect("debugger lock poisoned");
        if state.kill {
            return Err(killed_error());
        }
        state.node_desc = format!("{} <- {}", node.describe(), err.detail);
        state.loc = Some(node.loc.clone());
        state.scope = Some(scope.clone());
        self.suspend_current(&record, state, None)
    }

    fn visit_step_out_state(&self, _node: &AstNode, tid: u64, depth: usize) -> EvalResult<()> {
        let (record, _) = self.ensure_record(tid);
        let mut state = record.state.lock().expect("debugger lock poisoned");
        if state.kill {
            return Err(killed_error());
        }
        if state.step_mode == Some(StepMode::Out) && depth == state.step_depth {
            // The stepped-over call has returned: break on the next node.
            state.step_mode = Some(StepMode::In);
        }
        Ok(())
    }

    fn thread_finished(&self, tid: u64) {
        if let Some(record) = self.threads.read().expect("debugger lock poisoned").get(&tid) {
            let mut state = record.state.lock().expect("debugger lock poisoned");
            state.status = ThreadStatus::Finished;
            state.scope = None;
        }
        self.bump();
    }
}

impl std::fmt::Debug for EcalDebugger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "EcalDebugger(breakpoints:{} threads:{})",
            self.breakpoints.read().expect("debugger lock poisoned").len(),
            self.threads.read().expect("debugger lock poisoned").len()
        )
    }
}
