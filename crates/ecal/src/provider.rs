//! Runtime provider wiring all components together.

use std::{
    path::Path,
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicU64, Ordering},
    },
};

use ahash::AHashMap;
use serde::Deserialize;

use crate::{
    ast::AstNode,
    cron::{Clock, CronScheduler, SystemClock},
    debugger::{DebugHook, EcalDebugger},
    engine::Processor,
    errors::{ErrorKind, EvalResult, RuntimeError},
    eval,
    import::ImportLocator,
    logger::Logger,
    scope::{GLOBAL_SCOPE, Scope},
    stdlib::{PluginDescriptor, StdlibRegistry},
    value::Value,
};

/// Name of the plugin configuration file looked up in the root directory.
pub const CONFIG_FILE: &str = ".ecal.json";

/// Shared state behind a [`RuntimeProvider`].
pub(crate) struct ProviderCore {
    pub(crate) name: String,
    pub(crate) import_locator: Box<dyn ImportLocator>,
    pub(crate) logger: Box<dyn Logger>,
    pub(crate) stdlib: StdlibRegistry,
    pub(crate) processor: Processor,
    pub(crate) cron: CronScheduler,
    pub(crate) global_scope: Scope,
    debugger: RwLock<Option<Arc<dyn DebugHook>>>,
    tid_counter: AtomicU64,
    mutexes: Mutex<AHashMap<String, Arc<Mutex<()>>>>,
    imports: Mutex<AHashMap<String, Value>>,
}

impl ProviderCore {
    /// Hands out a unique, monotonically increasing thread id.
    pub(crate) fn new_tid(&self) -> u64 {
        self.tid_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn debug_hook(&self) -> Option<Arc<dyn DebugHook>> {
        self.debugger.read().expect("provider lock poisoned").clone()
    }

    /// The named mutex used by `mutex` blocks.
    pub(crate) fn mutex(&self, name: &str) -> Arc<Mutex<()>> {
        let mut mutexes = self.mutexes.lock().expect("provider lock poisoned");
        Arc::clone(mutexes.entry(name.to_owned()).or_default())
    }

    pub(crate) fn cached_import(&self, path: &str) -> Option<Value> {
        self.imports
            .lock()
            .expect("provider lock poisoned")
            .get(path)
            .cloned()
    }

    pub(crate) fn cache_import(&self, path: &str, module: Value) {
        self.imports
            .lock()
            .expect("provider lock poisoned")
            .insert(path.to_owned(), module);
    }
}

/// Shape of the `.ecal.json` configuration file.
#[derive(Debug, Deserialize)]
struct PluginConfig {
    #[serde(rename = "stdlibPlugins", default)]
    stdlib_plugins: Vec<PluginDescriptor>,
}

/// Central object wiring scopes, stdlib, processor, cron scheduler and
/// debugger, and assigning thread ids.
#[derive(Clone)]
pub struct RuntimeProvider {
    core: Arc<ProviderCore>,
}

impl RuntimeProvider {
    /// Creates a provider with the default worker pool size and the wall
    /// clock.
    pub fn new(
        name: impl Into<String>,
        import_locator: Box<dyn ImportLocator>,
        logger: Box<dyn Logger>,
    ) -> Self {
        let workers = std::thread::available_parallelism().map_or(4, std::num::NonZero::get);
        Self::with_config(name, import_locator, logger, workers, Arc::new(SystemClock))
    }

    /// Creates a provider with an explicit worker pool size and clock
    /// source.
    pub fn with_config(
        name: impl Into<String>,
        import_locator: Box<dyn ImportLocator>,
        logger: Box<dyn Logger>,
        workers: usize,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let core = Arc::new_cyclic(|weak| ProviderCore {
            name: name.into(),
            import_locator,
            logger,
            stdlib: StdlibRegistry::with_defaults(),
            processor: Processor::new(weak.clone(), workers),
            cron: CronScheduler::new(weak.clone(), clock),
            global_scope: Scope::new(GLOBAL_SCOPE),
            debugger: RwLock::new(None),
            tid_counter: AtomicU64::new(0),
            mutexes: Mutex::new(AHashMap::new()),
            imports: Mutex::new(AHashMap::new()),
        });
        Self { core }
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn processor(&self) -> &Processor {
        &self.core.processor
    }

    pub fn cron(&self) -> &CronScheduler {
        &self.core.cron
    }

    pub fn stdlib(&self) -> &StdlibRegistry {
        &self.core.stdlib
    }

    pub fn global_scope(&self) -> &Scope {
        &self.core.global_scope
    }

    pub fn new_tid(&self) -> u64 {
        self.core.new_tid()
    }

    /// Starts the event processor and the cron scheduler.
    pub fn start(&self) {
        self.core.processor.start();
        self.core.cron.start();
    }

    /// Stops the cron scheduler and drains the event processor.
    pub fn stop(&self) {
        self.core.cron.stop();
        self.core.processor.stop();
    }

    /// Creates, registers and returns the interactive debugger. The
    /// evaluator notifies it from then on.
    pub fn attach_debugger(&self) -> Arc<EcalDebugger> {
        let debugger = Arc::new(EcalDebugger::new(Arc::downgrade(&self.core)));
        *self.core.debugger.write().expect("provider lock poisoned") =
            Some(Arc::clone(&debugger) as Arc<dyn DebugHook>);
        debugger
    }

    /// Registers a custom debug hook instead of the interactive debugger.
    pub fn set_debug_hook(&self, hook: Arc<dyn DebugHook>) {
        *self.core.debugger.write().expect("provider lock poisoned") = Some(hook);
    }

    /// Structural validation of a parsed AST. Must run before `eval`.
    pub fn validate(&self, ast: &AstNode) -> EvalResult<()> {
        eval::validate_node(ast, false)
    }

    /// Evaluates an AST under a fresh thread id.
    pub fn eval(&self, ast: &AstNode, scope: &Scope) -> EvalResult<Value> {
        self.eval_with_tid(ast, scope, self.core.new_tid())
    }

    /// Evaluates an AST under a caller-chosen thread id.
    pub fn eval_with_tid(&self, ast: &AstNode, scope: &Scope, tid: u64) -> EvalResult<Value> {
        eval::eval_with_monitor(ast, scope, &self.core, tid, None)
    }

    /// Loads the `.ecal.json` plugin configuration from a root directory,
    /// if present.
    pub fn load_plugin_config(&self, root: &Path) -> EvalResult<()> {
        let path = root.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(());
        }
        let text = std::fs::read_to_string(&path).map_err(|err| {
            RuntimeError::new(
                ErrorKind::InvalidState,
                format!("Cannot read {}: {err}", path.display()),
            )
        })?;
        let config: PluginConfig = serde_json::from_str(&text).map_err(|err| {
            RuntimeError::new(
                ErrorKind::InvalidState,
                format!("Cannot parse {}: {err}", path.display()),
            )
        })?;
        self.core.stdlib.load_plugins(&config.stdlib_plugins)
    }
}

impl std::fmt::Debug for RuntimeProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RuntimeProvider({})", self.core.name)
    }
}
