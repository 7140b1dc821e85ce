//! Runtime value domain.
//!
//! [`Value`] is the tagged variant every expression evaluates to. Numbers are
//! always IEEE-754 doubles; host integer types are coerced at the function
//! bridge. Map keys are values restricted to the hashable kinds, compared by
//! kind plus payload. A numeric map key also matches its decimal string
//! spelling: lookups probe the number-typed key first, then the string-typed
//! key.

use std::{fmt, sync::Arc};

use indexmap::IndexMap;

use crate::{ast::AstNode, bridge::EcalFunction};

/// Map storage: insertion ordered, keyed by hashable values.
pub type ValueMap = IndexMap<MapKey, Value>;

/// A value produced by evaluating an expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    /// Numbers are double precision throughout the runtime.
    Number(f64),
    Str(String),
    List(Vec<Value>),
    Map(ValueMap),
    /// Reference to a user defined or stdlib function.
    Func(FuncValue),
}

impl Value {
    /// Human readable kind name used in error details.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Number(_) => "number",
            Self::Str(_) => "string",
            Self::List(_) => "list",
            Self::Map(_) => "map",
            Self::Func(_) => "function",
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Converts a JSON value into a runtime value.
    pub fn from_json(v: &serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(*b),
            serde_json::Value::Number(n) => Self::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Self::Str(s.clone()),
            serde_json::Value::Array(items) => Self::List(items.iter().map(Self::from_json).collect()),
            serde_json::Value::Object(obj) => {
                let mut map = ValueMap::new();
                for (k, v) in obj {
                    map.insert(MapKey::Str(k.clone()), Self::from_json(v));
                }
                Self::Map(map)
            }
        }
    }

    /// Converts the value into JSON. Function references have no JSON form
    /// and are replaced by a sentinel string.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Bool(b) => (*b).into(),
            Self::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    serde_json::Value::from(*n as i64)
                } else {
                    serde_json::Value::from(*n)
                }
            }
            Self::Str(s) => s.clone().into(),
            Self::List(items) => items.iter().map(Self::to_json).collect(),
            Self::Map(map) => {
                let mut obj = serde_json::Map::new();
                for (k, v) in map {
                    obj.insert(k.to_string(), v.to_json());
                }
                serde_json::Value::Object(obj)
            }
            Self::Func(f) => format!("ecal.function: {}", f.name()).into(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Number(n) => {
                let mut out = String::new();
                crate::ast::print_number(*n, &mut out);
                f.write_str(&out)
            }
            Self::Str(s) => f.write_str(s),
            Self::List(_) | Self::Map(_) => f.write_str(
                &serde_json::to_string(&self.to_json()).unwrap_or_else(|_| String::from("{}")),
            ),
            Self::Func(func) => write!(f, "ecal.function: {}", func.name()),
        }
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Str(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

// ---------------------------------------------------------------------------
// Map keys
// ---------------------------------------------------------------------------

/// A map key: a value of one of the hashable kinds.
///
/// Numbers are stored by their bit pattern with negative zero normalized, so
/// key equality is kind plus payload equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MapKey {
    Null,
    Bool(bool),
    Num(u64),
    Str(String),
}

impl MapKey {
    pub fn num(n: f64) -> Self {
        let n = if n == 0.0 { 0.0 } else { n };
        Self::Num(n.to_bits())
    }

    /// Builds a key from a value. Lists, maps and functions are not
    /// hashable and are rejected with the offending kind name.
    pub fn from_value(v: &Value) -> Result<Self, &'static str> {
        match v {
            Value::Null => Ok(Self::Null),
            Value::Bool(b) => Ok(Self::Bool(*b)),
            Value::Number(n) => Ok(Self::num(*n)),
            Value::Str(s) => Ok(Self::Str(s.clone())),
            other => Err(other.kind_name()),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Bool(b) => Value::Bool(*b),
            Self::Num(bits) => Value::Number(f64::from_bits(*bits)),
            Self::Str(s) => Value::Str(s.clone()),
        }
    }
}

impl fmt::Display for MapKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.to_value().fmt(f)
    }
}

/// Looks up a map entry by a string path component.
///
/// A component that parses as a number probes the number-typed key first,
/// then falls back to the identical string-typed key.
pub(crate) fn map_get<'m>(map: &'m ValueMap, component: &str) -> Option<&'m Value> {
    if let Ok(n) = component.parse::<f64>() {
        if let Some(v) = map.get(&MapKey::num(n)) {
            return Some(v);
        }
    }
    map.get(&MapKey::Str(component.to_owned()))
}

/// The key under which a string path component writes into a map: an
/// existing number or string key is reused, otherwise the component is
/// inserted as a string key.
pub(crate) fn map_write_key(map: &ValueMap, component: &str) -> MapKey {
    if let Ok(n) = component.parse::<f64>() {
        let key = MapKey::num(n);
        if map.contains_key(&key) {
            return key;
        }
    }
    MapKey::Str(component.to_owned())
}

// ---------------------------------------------------------------------------
// Function references
// ---------------------------------------------------------------------------

/// A function reference value.
#[derive(Clone)]
pub enum FuncValue {
    /// A function declared in user code.
    User(Arc<UserFunction>),
    /// A registered stdlib function.
    Stdlib(Arc<dyn EcalFunction>),
}

impl FuncValue {
    pub fn name(&self) -> &str {
        match self {
            Self::User(f) => f.name.as_deref().unwrap_or("anonymous"),
            Self::Stdlib(f) => f.name(),
        }
    }
}

impl fmt::Debug for FuncValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FuncValue({})", self.name())
    }
}

impl PartialEq for FuncValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::User(a), Self::User(b)) => Arc::ptr_eq(a, b),
            (Self::Stdlib(a), Self::Stdlib(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// A user defined function: parameter list with optional defaults and the
/// body block.
#[derive(Debug, Clone, PartialEq)]
pub struct UserFunction {
    pub name: Option<String>,
    pub params: Vec<FuncParam>,
    pub body: AstNode,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FuncParam {
    pub name: String,
    pub default: Option<AstNode>,
}
