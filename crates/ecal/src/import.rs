//! Import locators resolving module names to source text.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::Mutex,
};

use crate::errors::{ErrorKind, EvalResult, RuntimeError};

/// Pluggable resolver from an import path to source text.
pub trait ImportLocator: Send + Sync {
    fn resolve(&self, path: &str) -> EvalResult<String>;
}

fn import_error(path: &str, detail: impl std::fmt::Display) -> RuntimeError {
    RuntimeError::new(
        ErrorKind::Runtime,
        format!("Could not import {path}: {detail}"),
    )
}

/// Locator reading modules from files below a root directory.
#[derive(Debug)]
pub struct FileImportLocator {
    root: PathBuf,
}

impl FileImportLocator {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ImportLocator for FileImportLocator {
    fn resolve(&self, path: &str) -> EvalResult<String> {
        let full = self.root.join(path);
        std::fs::read_to_string(&full).map_err(|err| import_error(path, err))
    }
}

/// Locator serving modules from an in-memory map. Used by the REPL, tests
/// and unpacked archives.
#[derive(Debug, Default)]
pub struct MemoryImportLocator {
    sources: Mutex<HashMap<String, String>>,
}

impl MemoryImportLocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, path: impl Into<String>, source: impl Into<String>) {
        self.sources
            .lock()
            .expect("locator lock poisoned")
            .insert(path.into(), source.into());
    }
}

impl ImportLocator for MemoryImportLocator {
    fn resolve(&self, path: &str) -> EvalResult<String> {
        self.sources
            .lock()
            .expect("locator lock poisoned")
            .get(path)
            .cloned()
            .ok_or_else(|| import_error(path, "unknown module"))
    }
}
