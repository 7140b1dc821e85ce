//! Standard library registry.
//!
//! Two namespaces: internal functions callable without a package prefix
//! (`len`, `range`, `addEvent`, ...) and packages addressed as
//! `<pkg>.<symbol>` holding functions and constants. Host code extends both
//! at runtime; the `plugins` feature additionally loads functions from
//! host-native shared libraries described in the `.ecal.json` config.

mod inbuild;
mod math_pkg;
mod str_pkg;

use std::sync::{Arc, RwLock};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{
    bridge::EcalFunction,
    errors::{ErrorKind, EvalResult, RuntimeError},
    value::{FuncValue, Value},
};

/// Descriptor of one pluggable stdlib function, as found in the
/// `stdlibPlugins` section of `.ecal.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginDescriptor {
    pub package: String,
    pub name: String,
    pub path: String,
    pub symbol: String,
}

struct Package {
    doc: String,
    constants: IndexMap<String, Value>,
    functions: IndexMap<String, Arc<dyn EcalFunction>>,
}

/// Registry of packages, functions and constants.
pub struct StdlibRegistry {
    packages: RwLock<IndexMap<String, Package>>,
    internal: RwLock<IndexMap<String, Arc<dyn EcalFunction>>>,
    #[cfg(feature = "plugins")]
    libraries: std::sync::Mutex<Vec<libloading::Library>>,
}

impl StdlibRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            packages: RwLock::new(IndexMap::new()),
            internal: RwLock::new(IndexMap::new()),
            #[cfg(feature = "plugins")]
            libraries: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// The registry every runtime provider starts from: internal functions
    /// plus the `math` and `str` packages.
    pub(crate) fn with_defaults() -> Self {
        let registry = Self::new();
        inbuild::register(&registry);
        math_pkg::register(&registry);
        str_pkg::register(&registry);
        registry
    }

    /// Registers a new package. Fails if the name is already taken.
    pub fn add_package(&self, name: &str, doc: &str) -> EvalResult<()> {
        let mut packages = self.packages.write().expect("stdlib lock poisoned");
        if packages.contains_key(name) {
            return Err(RuntimeError::new(
                ErrorKind::InvalidState,
                format!("Package {name} already exists"),
            ));
        }
        packages.insert(
            name.to_owned(),
            Package {
                doc: doc.to_owned(),
                constants: IndexMap::new(),
                functions: IndexMap::new(),
            },
        );
        Ok(())
    }

    /// Registers a function in an existing package.
    pub fn add_function(
        &self,
        pkg: &str,
        name: &str,
        func: Arc<dyn EcalFunction>,
    ) -> EvalResult<()> {
        let mut packages = self.packages.write().expect("stdlib lock poisoned");
        let package = packages.get_mut(pkg).ok_or_else(|| {
            RuntimeError::new(ErrorKind::InvalidState, format!("Unknown package: {pkg}"))
        })?;
        package.functions.insert(name.to_owned(), func);
        Ok(())
    }

    /// Registers a constant in an existing package.
    pub fn add_constant(&self, pkg: &str, name: &str, value: Value) -> EvalResult<()> {
        let mut packages = self.packages.write().expect("stdlib lock poisoned");
        let package = packages.get_mut(pkg).ok_or_else(|| {
            RuntimeError::new(ErrorKind::InvalidState, format!("Unknown package: {pkg}"))
        })?;
        package.constants.insert(name.to_owned(), value);
        Ok(())
    }

    /// Registers an internal function callable without a package prefix.
    pub fn add_internal(&self, name: &str, func: Arc<dyn EcalFunction>) {
        self.internal
            .write()
            .expect("stdlib lock poisoned")
            .insert(name.to_owned(), func);
    }

    pub(crate) fn internal_function(&self, name: &str) -> Option<Arc<dyn EcalFunction>> {
        self.internal
            .read()
            .expect("stdlib lock poisoned")
            .get(name)
            .cloned()
    }

    /// Looks up `<pkg>.<symbol>`, splitting on the first dot. Constants
    /// win over functions of the same name.
    pub(crate) fn lookup(&self, path: &str) -> Option<Value> {
        let (pkg, symbol) = path.split_once('.')?;
        let packages = self.packages.read().expect("stdlib lock poisoned");
        let package = packages.get(pkg)?;
        if let Some(constant) = package.constants.get(symbol) {
            return Some(constant.clone());
        }
        package
            .functions
            .get(symbol)
            .map(|func| Value::Func(FuncValue::Stdlib(Arc::clone(func))))
    }

    /// Help text for a symbol: an internal function name, a package name or
    /// `<pkg>.<function>`.
    pub fn doc(&self, symbol: &str) -> Option<String> {
        if let Some((pkg, name)) = symbol.split_once('.') {
            let packages = self.packages.read().expect("stdlib lock poisoned");
            return packages
                .get(pkg)?
                .functions
                .get(name)
                .map(|func| func.doc_string());
        }
        if let Some(func) = self.internal_function(symbol) {
            return Some(func.doc_string());
        }
        let packages = self.packages.read().expect("stdlib lock poisoned");
        packages.get(symbol).map(|package| package.doc.clone())
    }

    /// Package names with their doc strings.
    pub fn packages(&self) -> Vec<(String, String)> {
        self.packages
            .read()
            .expect("stdlib lock poisoned")
            .iter()
            .map(|(name, package)| (name.clone(), package.doc.clone()))
            .collect()
    }

    /// All symbols of one package: constants (with their display value as
    /// doc) followed by functions.
    pub fn package_symbols(&self, pkg: &str) -> Vec<(String, String)> {
        let packages = self.packages.read().expect("stdlib lock poisoned");
        let Some(package) = packages.get(pkg) else {
            return Vec::new();
        };
        let mut out: Vec<(String, String)> = package
            .constants
            .iter()
            .map(|(name, value)| (name.clone(), value.to_string()))
            .collect();
        out.extend(
            package
                .functions
                .iter()
                .map(|(name, func)| (name.clone(), func.doc_string())),
        );
        out
    }

    /// Names of all internal functions.
    pub fn internal_names(&self) -> Vec<String> {
        self.internal
            .read()
            .expect("stdlib lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Loads stdlib plugins from host-native shared libraries.
    ///
    /// Each library must export `symbol` as
    /// `fn() -> Box<dyn EcalFunction>`. Plugin functions land in their
    /// descriptor's package, which is created on demand.
    #[cfg(feature = "plugins")]
    pub fn load_plugins(&self, descriptors: &[PluginDescriptor]) -> EvalResult<()> {
        for descriptor in descriptors {
            // SAFETY: loading a library runs its initializers; the operator
            // vouches for the configured plugin paths.
            let library = unsafe { libloading::Library::new(&descriptor.path) }.map_err(|err| {
                plugin_error(descriptor, format_args!("cannot load library: {err}"))
            })?;
            let func = {
                // SAFETY: the exported symbol is required to have the
                // documented constructor signature.
                let constructor: libloading::Symbol<'_, fn() -> Box<dyn EcalFunction>> =
                    unsafe { library.get(descriptor.symbol.as_bytes()) }.map_err(|err| {
                        plugin_error(descriptor, format_args!("cannot find symbol: {err}"))
                    })?;
                constructor()
            };
            if !self
                .packages
                .read()
                .expect("stdlib lock poisoned")
                .contains_key(&descriptor.package)
            {
                self.add_package(&descriptor.package, "Plugin package")?;
            }
            self.add_function(&descriptor.package, &descriptor.name, Arc::from(func))?;
            self.libraries
                .lock()
                .expect("stdlib lock poisoned")
                .push(library);
        }
        Ok(())
    }

    /// Builds without the `plugins` feature cannot load shared libraries;
    /// internal registration remains available.
    #[cfg(not(feature = "plugins"))]
    pub fn load_plugins(&self, descriptors: &[PluginDescriptor]) -> EvalResult<()> {
        if descriptors.is_empty() {
            return Ok(());
        }
        Err(RuntimeError::new(
            ErrorKind::InvalidState,
            "Stdlib plugins are unsupported in this build",
        ))
    }
}

#[cfg(feature = "plugins")]
fn plugin_error(descriptor: &PluginDescriptor, detail: std::fmt::Arguments<'_>) -> RuntimeError {
    RuntimeError::new(
        ErrorKind::Fatal,
        format!(
            "Plugin {}.{} from {}: {detail}",
            descriptor.package, descriptor.name, descriptor.path
        ),
    )
}

impl Default for StdlibRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StdlibRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "StdlibRegistry(packages:{} internal:{})",
            self.packages.read().expect("stdlib lock poisoned").len(),
            self.internal.read().expect("stdlib lock poisoned").len()
        )
    }
}
