//! ECAL is an embedded Event-Condition-Action scripting language runtime.
//!
//! User written rules (sinks) react to events dispatched from host code or
//! internal triggers, with concurrency, priorities and suppression. The
//! crate is designed to be embedded: the host injects events, reads log
//! output and observes results.
//!
//! ```
//! use ecal::{MemoryImportLocator, MemoryLogger, RuntimeProvider, Value, parse};
//!
//! let rtp = RuntimeProvider::new(
//!     "demo",
//!     Box::new(MemoryImportLocator::new()),
//!     Box::new(MemoryLogger::new()),
//! );
//! let ast = parse("demo", "a := 2; b := a * 4; a + b").unwrap();
//! rtp.validate(&ast).unwrap();
//! let result = rtp.eval(&ast, rtp.global_scope()).unwrap();
//! assert_eq!(result, Value::Number(10.0));
//! ```

mod ast;
mod bridge;
mod cron;
mod debugger;
mod engine;
mod errors;
mod eval;
mod import;
mod lexer;
mod logger;
mod parser;
mod provider;
mod scope;
mod stdlib;
mod value;

pub use crate::{
    ast::{AstNode, CodeLoc, NodeKind, NodeValue},
    bridge::{
        EcalFunction, NativeFunction, check_max_args, check_min_args, int_arg, list_arg, map_arg,
        num_arg, opt_int_arg, opt_num_arg, str_arg, str_list_arg,
    },
    cron::{Clock, CronScheduler, CronSpec, ManualClock, SystemClock},
    debugger::{ContMode, DebugHook, EcalDebugger},
    engine::{Event, Monitor, MonitorError, Processor, Rule},
    errors::{ErrorKind, EvalResult, RuntimeError, RuntimeErrorWithDetail, TraceFrame},
    eval::FunctionContext,
    import::{FileImportLocator, ImportLocator, MemoryImportLocator},
    logger::{
        BufferLogger, LevelFilterLogger, LogLevel, Logger, MemoryLogger, RingLogger, StderrLogger,
        StdoutLogger,
    },
    parser::parse,
    provider::{CONFIG_FILE, RuntimeProvider},
    scope::{GLOBAL_SCOPE, Scope, ScopeError},
    stdlib::{PluginDescriptor, StdlibRegistry},
    value::{FuncParam, FuncValue, MapKey, UserFunction, Value, ValueMap},
};
