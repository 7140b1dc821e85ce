//! Nested variable scopes.
//!
//! A [`Scope`] is a cheap-clone handle onto a named node in a tree. Name
//! lookup walks the parent chain; plain assignment writes into the nearest
//! ancestor already holding the name and otherwise defines the name locally.
//! Dotted paths (`a.b.c.0`) navigate through maps and lists and mutate the
//! stored value in place.
//!
//! The parent back-reference is non-owning; the children list owns and is
//! only tracked for scopes created via [`Scope::new_child`]. All access goes
//! through per-node locks which are never held across a call into another
//! node, so lookups walking ancestor boundaries cannot deadlock against
//! mutators.

use std::{
    fmt,
    sync::{Arc, RwLock, Weak},
};

use ahash::AHashMap;

use crate::{
    errors::{ErrorKind, RuntimeError},
    value::{MapKey, Value, map_get, map_write_key},
};

/// Global scope name used by the runtime provider.
pub const GLOBAL_SCOPE: &str = "global";

/// A structured error from a scope operation, naming the failing path
/// prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeError {
    /// A path component does not exist in its container.
    ContainerNotFound(String),
    /// A path component is not a list or a map.
    NotAContainer(String),
    /// A list was indexed with a non-numeric component.
    IndexNotNumeric { prefix: String, index: String },
    /// A list index was outside the list bounds.
    OutOfBounds { prefix: String, index: i64 },
}

impl fmt::Display for ScopeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ContainerNotFound(prefix) => {
                write!(f, "Container field {prefix} does not exist")
            }
            Self::NotAContainer(prefix) => write!(f, "Variable {prefix} is not a container"),
            Self::IndexNotNumeric { prefix, index } => {
                write!(f, "List {prefix} needs a number index not: {index}")
            }
            Self::OutOfBounds { prefix, index } => {
                write!(f, "Out of bounds access to list {prefix} with index: {index}")
            }
        }
    }
}

impl std::error::Error for ScopeError {}

impl From<ScopeError> for RuntimeError {
    fn from(err: ScopeError) -> Self {
        Self::new(ErrorKind::VarAccess, err.to_string())
    }
}

struct ScopeInner {
    name: String,
    parent: RwLock<Option<Weak<ScopeInner>>>,
    children: RwLock<Vec<Scope>>,
    storage: RwLock<AHashMap<String, Value>>,
}

/// A named variable frame in a parent-linked tree.
#[derive(Clone)]
pub struct Scope {
    inner: Arc<ScopeInner>,
}

impl Scope {
    /// Creates a new root scope.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                name: name.into(),
                parent: RwLock::new(None),
                children: RwLock::new(Vec::new()),
                storage: RwLock::new(AHashMap::new()),
            }),
        }
    }

    /// Creates a scope with a parent without registering it in the parent's
    /// children list. Used for transient frames such as function calls.
    pub fn new_with_parent(name: impl Into<String>, parent: &Self) -> Self {
        let scope = Self::new(name);
        scope.set_parent(parent);
        scope
    }

    /// Creates (or returns the existing) tracked child scope with the given
    /// name.
    pub fn new_child(&self, name: impl Into<String>) -> Self {
        let name = name.into();
        let mut children = self.inner.children.write().expect("scope lock poisoned");
        if let Some(existing) = children.iter().find(|c| c.inner.name == name) {
            return existing.clone();
        }
        let child = Self::new(name);
        child.set_parent(self);
        children.push(child.clone());
        child
    }

    /// Sets (or replaces) the parent of this scope.
    pub fn set_parent(&self, parent: &Self) {
        *self.inner.parent.write().expect("scope lock poisoned") = Some(Arc::downgrade(&parent.inner));
    }

    pub fn name(&self) -> String {
        self.inner.name.clone()
    }

    pub fn parent(&self) -> Option<Self> {
        self.inner
            .parent
            .read()
            .expect("scope lock poisoned")
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|inner| Self { inner })
    }

    /// Wipes storage and tracked children. The parent link is kept.
    pub fn clear(&self) {
        self.inner.storage.write().expect("scope lock poisoned").clear();
        self.inner.children.write().expect("scope lock poisoned").clear();
    }

    /// The nearest scope (starting here, walking the parent chain) whose
    /// local storage holds `name`.
    fn owner_of(&self, name: &str) -> Option<Self> {
        let mut current = self.clone();
        loop {
            if current
                .inner
                .storage
                .read()
                .expect("scope lock poisoned")
                .contains_key(name)
            {
                return Some(current);
            }
            match current.parent() {
                Some(parent) => current = parent,
                None => return None,
            }
        }
    }

    /// Sets a value under `path`.
    ///
    /// A simple name is written into the nearest ancestor already holding
    /// it, or defined locally. A dotted path walks the container chain of
    /// the owning scope and mutates the leaf in place.
    pub fn set_value(&self, path: &str, value: Value) -> Result<(), ScopeError> {
        let components: Vec<&str> = path.split('.').collect();
        if components.len() == 1 {
            let target = self.owner_of(path).unwrap_or_else(|| self.clone());
            target
                .inner
                .storage
                .write()
                .expect("scope lock poisoned")
                .insert(path.to_owned(), value);
            return Ok(());
        }
        let owner = self
            .owner_of(components[0])
            .ok_or_else(|| ScopeError::ContainerNotFound(components[0].to_owned()))?;
        let mut storage = owner.inner.storage.write().expect("scope lock poisoned");
        let root = storage
            .get_mut(components[0])
            .expect("owner scope holds the name");
        set_path(root, &components, value)
    }

    /// Like [`Scope::set_value`] but forces the variable to be defined in
    /// this scope before the assignment.
    pub fn set_local_value(&self, path: &str, value: Value) -> Result<(), ScopeError> {
        let first = path.split('.').next().expect("split yields at least one component");
        {
            let mut storage = self.inner.storage.write().expect("scope lock poisoned");
            storage.entry(first.to_owned()).or_insert(Value::Null);
        }
        self.set_value(path, value)
    }

    /// Retrieves a value under `path`. Returns `Ok(None)` when the first
    /// component is not defined in this scope or any ancestor.
    pub fn get_value(&self, path: &str) -> Result<Option<Value>, ScopeError> {
        let components: Vec<&str> = path.split('.').collect();
        let Some(owner) = self.owner_of(components[0]) else {
            return Ok(None);
        };
        let storage = owner.inner.storage.read().expect("scope lock poisoned");
        let mut current = storage.get(components[0]).expect("owner scope holds the name");
        for (i, component) in components.iter().enumerate().skip(1) {
            let prefix = components[..i].join(".");
            current = resolve_component(current, component, &prefix)?;
        }
        Ok(Some(current.clone()))
    }

    /// True when `name` (a simple name, not a path) is defined locally.
    pub fn is_local(&self, name: &str) -> bool {
        self.inner
            .storage
            .read()
            .expect("scope lock poisoned")
            .contains_key(name)
    }

    /// Snapshot of the local storage as name and value pairs, sorted by
    /// name. Used when a module scope is bound to its import alias.
    pub fn local_values(&self) -> Vec<(String, Value)> {
        let storage = self.inner.storage.read().expect("scope lock poisoned");
        let mut entries: Vec<(String, Value)> = storage
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Shallow JSON projection of the local storage. Function references
    /// become sentinel strings.
    pub fn to_json_object(&self) -> serde_json::Map<String, serde_json::Value> {
        let storage = self.inner.storage.read().expect("scope lock poisoned");
        let mut names: Vec<&String> = storage.keys().collect();
        names.sort();
        let mut obj = serde_json::Map::new();
        for name in names {
            obj.insert(name.clone(), storage[name].to_json());
        }
        obj
    }

    fn dump(&self, level: usize, out: &mut String) {
        let pad = "    ".repeat(level);
        out.push_str(&pad);
        out.push_str(&self.inner.name);
        out.push_str(" {\n");
        {
            let storage = self.inner.storage.read().expect("scope lock poisoned");
            let mut names: Vec<&String> = storage.keys().collect();
            names.sort();
            for name in names {
                let value = &storage[name];
                out.push_str(&pad);
                out.push_str("    ");
                out.push_str(&format!("{name} ({}) : {value}\n", value.kind_name()));
            }
        }
        for child in self.inner.children.read().expect("scope lock poisoned").iter() {
            child.dump(level + 1, out);
        }
        out.push_str(&pad);
        out.push_str("}\n");
    }
}

impl fmt::Display for Scope {
    /// Human readable dump of this scope and its tracked descendants.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        self.dump(0, &mut out);
        f.write_str(&out)
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Scope({})", self.inner.name)
    }
}

/// Resolves one path component against a container value.
fn resolve_component<'v>(
    current: &'v Value,
    component: &str,
    prefix: &str,
) -> Result<&'v Value, ScopeError> {
    match current {
        Value::Map(map) => map_get(map, component)
            .ok_or_else(|| ScopeError::ContainerNotFound(format!("{prefix}.{component}"))),
        Value::List(list) => {
            let index = list_index(list.len(), component, prefix)?;
            Ok(&list[index])
        }
        _ => Err(ScopeError::NotAContainer(prefix.to_owned())),
    }
}

/// Parses and bounds-checks a list index component. Negative indices count
/// from the end.
fn list_index(len: usize, component: &str, prefix: &str) -> Result<usize, ScopeError> {
    let raw: i64 = component.parse().map_err(|_| ScopeError::IndexNotNumeric {
        prefix: prefix.to_owned(),
        index: component.to_owned(),
    })?;
    let index = if raw < 0 { raw + len as i64 } else { raw };
    if index < 0 || index as usize >= len {
        return Err(ScopeError::OutOfBounds {
            prefix: prefix.to_owned(),
            index: raw,
        });
    }
    Ok(index as usize)
}

/// Walks `root` along `components[1..]` and writes `value` at the leaf.
fn set_path(root: &mut Value, components: &[&str], value: Value) -> Result<(), ScopeError> {
    let mut current = root;
    for (i, component) in components[1..components.len() - 1].iter().enumerate() {
        let prefix = components[..i + 1].join(".");
        current = match current {
            Value::Map(map) => {
                let key = existing_map_key(map, component)
                    .ok_or_else(|| ScopeError::ContainerNotFound(format!("{prefix}.{component}")))?;
                map.get_mut(&key).expect("key existence checked above")
            }
            Value::List(list) => {
                let index = list_index(list.len(), component, &prefix)?;
                &mut list[index]
            }
            _ => return Err(ScopeError::NotAContainer(prefix)),
        };
    }
    let leaf = components[components.len() - 1];
    let prefix = components[..components.len() - 1].join(".");
    match current {
        Value::Map(map) => {
            let key = map_write_key(map, leaf);
            map.insert(key, value);
            Ok(())
        }
        Value::List(list) => {
            let index = list_index(list.len(), leaf, &prefix)?;
            list[index] = value;
            Ok(())
        }
        _ => Err(ScopeError::NotAContainer(prefix)),
    }
}

/// Finds the key an existing map entry is stored under for a string path
/// component, probing the number-typed key first.
fn existing_map_key(map: &crate::value::ValueMap, component: &str) -> Option<MapKey> {
    if let Ok(n) = component.parse::<f64>() {
        let key = MapKey::num(n);
        if map.contains_key(&key) {
            return Some(key);
        }
    }
    let key = MapKey::Str(component.to_owned());
    map.contains_key(&key).then_some(key)
}
