//! Runtime values.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value as JsonValue;

use super::ast::FunctionDef;
use super::builtins::Builtin;
use super::exception::ExceptionInfo;
use crate::namespace::Namespace;

/// Nesting depth after which containers are printed as `...`.
const MAX_DISPLAY_DEPTH: usize = 16;

/// Most nodes one display, comparison or JSON conversion may visit.
const MAX_WALK_NODES: usize = 1 << 20;

/// Mutable list with reference semantics.
pub type ListRef = Arc<Mutex<Vec<Value>>>;

/// Mutable string-keyed map with reference semantics.
pub type MapRef = Arc<Mutex<BTreeMap<String, Value>>>;

/// A user-defined function together with the scope it was defined in.
pub struct Function {
    pub def: Arc<FunctionDef>,
    pub env: Namespace,
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Function")
            .field("name", &self.def.name)
            .field("params", &self.def.params)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(ListRef),
    Map(MapRef),
    Range { start: i64, stop: i64, step: i64 },
    Function(Arc<Function>),
    Builtin(Builtin),
    Exception(ExceptionInfo),
    Namespace(Namespace),
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn addr<T>(shared: &Arc<T>) -> usize {
    Arc::as_ptr(shared) as *const () as usize
}

/// Bookkeeping for one walk over a value graph. `path` holds the containers
/// currently being visited, so a repeat is a cycle.
struct Walk {
    path: Vec<(usize, usize)>,
    remaining: usize,
}

impl Walk {
    fn new() -> Self {
        Self {
            path: Vec::new(),
            remaining: MAX_WALK_NODES,
        }
    }

    /// Count one node. `false` once the budget is spent.
    fn step(&mut self) -> bool {
        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        true
    }

    fn exhausted(&self) -> bool {
        self.remaining == 0
    }

    fn too_deep(&self) -> bool {
        self.path.len() > MAX_DISPLAY_DEPTH
    }

    fn on_path(&self, key: (usize, usize)) -> bool {
        self.path.contains(&key)
    }
}

impl Value {
    pub fn list(items: Vec<Value>) -> Value {
        Value::List(Arc::new(Mutex::new(items)))
    }

    pub fn map(entries: BTreeMap<String, Value>) -> Value {
        Value::Map(Arc::new(Mutex::new(entries)))
    }

    pub fn str(text: impl Into<String>) -> Value {
        Value::Str(text.into())
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "NoneType",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Range { .. } => "range",
            Value::Function(_) => "function",
            Value::Builtin(_) => "builtin",
            Value::Exception(_) => "exception",
            Value::Namespace(_) => "namespace",
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(v) => *v != 0,
            Value::Float(v) => *v != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(items) => !lock(items).is_empty(),
            Value::Map(entries) => !lock(entries).is_empty(),
            Value::Range { start, stop, step } => range_len(*start, *stop, *step) > 0,
            Value::Namespace(ns) => !ns.is_empty(),
            Value::Function(_) | Value::Builtin(_) | Value::Exception(_) => true,
        }
    }

    /// Numeric view used by arithmetic and comparisons.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Bool(b) => Some(*b as i64),
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Structural equality, the semantics of `==`.
    ///
    /// A pair of containers met again while still comparing them counts as
    /// equal. Comparisons past the nesting or node budget are unequal.
    pub fn equals(&self, other: &Value) -> bool {
        self.equals_in(other, &mut Walk::new())
    }

    fn equals_in(&self, other: &Value, walk: &mut Walk) -> bool {
        if !walk.step() || walk.too_deep() {
            return false;
        }
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => {
                let key = (addr(a), addr(b));
                if Arc::ptr_eq(a, b) || walk.on_path(key) {
                    return true;
                }
                let a = lock(a).clone();
                let b = lock(b).clone();
                walk.path.push(key);
                let equal = a.len() == b.len()
                    && a.iter().zip(b.iter()).all(|(x, y)| x.equals_in(y, walk));
                walk.path.pop();
                equal
            }
            (Value::Map(a), Value::Map(b)) => {
                let key = (addr(a), addr(b));
                if Arc::ptr_eq(a, b) || walk.on_path(key) {
                    return true;
                }
                let a = lock(a).clone();
                let b = lock(b).clone();
                walk.path.push(key);
                let equal = a.len() == b.len()
                    && a.iter()
                        .zip(b.iter())
                        .all(|((ka, va), (kb, vb))| ka == kb && va.equals_in(vb, walk));
                walk.path.pop();
                equal
            }
            (
                Value::Range { start, stop, step },
                Value::Range {
                    start: s2,
                    stop: e2,
                    step: st2,
                },
            ) => start == s2 && stop == e2 && step == st2,
            (Value::Function(a), Value::Function(b)) => Arc::ptr_eq(a, b),
            (Value::Builtin(a), Value::Builtin(b)) => a == b,
            (Value::Exception(a), Value::Exception(b)) => a == b,
            (Value::Namespace(a), Value::Namespace(b)) => a.ptr_eq(b),
            (Value::Int(a), Value::Int(b)) => a == b,
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x == y,
                _ => false,
            },
        }
    }

    /// Representation used inside containers and by the REPL-style `repr`.
    pub fn repr(&self) -> String {
        let mut out = String::new();
        self.write_repr(&mut out, &mut Walk::new());
        out
    }

    fn write_repr(&self, out: &mut String, walk: &mut Walk) {
        match self {
            Value::Str(s) => {
                out.push('\'');
                for c in s.chars() {
                    match c {
                        '\'' => out.push_str("\\'"),
                        '\\' => out.push_str("\\\\"),
                        '\n' => out.push_str("\\n"),
                        '\t' => out.push_str("\\t"),
                        c => out.push(c),
                    }
                }
                out.push('\'');
            }
            _ => self.write_display(out, walk),
        }
    }

    /// Containers already being printed show as `[...]` or `{...}`.
    fn write_display(&self, out: &mut String, walk: &mut Walk) {
        if !walk.step() || walk.too_deep() {
            out.push_str("...");
            return;
        }
        match self {
            Value::None => out.push_str("None"),
            Value::Bool(true) => out.push_str("True"),
            Value::Bool(false) => out.push_str("False"),
            Value::Int(v) => out.push_str(&v.to_string()),
            Value::Float(v) => out.push_str(&format_float(*v)),
            Value::Str(s) => out.push_str(s),
            Value::List(items) => {
                let key = (addr(items), 0);
                if walk.on_path(key) {
                    out.push_str("[...]");
                    return;
                }
                let items = lock(items).clone();
                walk.path.push(key);
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    if walk.exhausted() {
                        out.push_str("...");
                        break;
                    }
                    item.write_repr(out, walk);
                }
                out.push(']');
                walk.path.pop();
            }
            Value::Map(entries) => {
                let key = (addr(entries), 0);
                if walk.on_path(key) {
                    out.push_str("{...}");
                    return;
                }
                let entries = lock(entries).clone();
                walk.path.push(key);
                out.push('{');
                for (i, (name, value)) in entries.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    if walk.exhausted() {
                        out.push_str("...");
                        break;
                    }
                    Value::Str(name.clone()).write_repr(out, walk);
                    out.push_str(": ");
                    value.write_repr(out, walk);
                }
                out.push('}');
                walk.path.pop();
            }
            Value::Range { start, stop, step } => {
                if *step == 1 {
                    out.push_str(&format!("range({}, {})", start, stop));
                } else {
                    out.push_str(&format!("range({}, {}, {})", start, stop, step));
                }
            }
            Value::Function(func) => out.push_str(&format!("<function {}>", func.def.name)),
            Value::Builtin(builtin) => out.push_str(&format!("<builtin {}>", builtin.name())),
            Value::Exception(info) => {
                let message = Value::Str(info.message.clone()).repr();
                out.push_str(&format!("{}({})", info.kind, message));
            }
            Value::Namespace(ns) => out.push_str(&format!("<namespace with {} names>", ns.len())),
        }
    }

    /// Convert plain data to JSON. Functions, builtins and namespace
    /// handles have no JSON form, and neither do cyclic or oversized
    /// values. Ranges become arrays.
    pub fn to_json(&self) -> Option<JsonValue> {
        self.to_json_in(&mut Walk::new())
    }

    fn to_json_in(&self, walk: &mut Walk) -> Option<JsonValue> {
        if !walk.step() || walk.too_deep() {
            return None;
        }
        match self {
            Value::None => Some(JsonValue::Null),
            Value::Bool(b) => Some(JsonValue::Bool(*b)),
            Value::Int(v) => Some(JsonValue::from(*v)),
            Value::Float(v) => Some(
                serde_json::Number::from_f64(*v)
                    .map(JsonValue::Number)
                    .unwrap_or(JsonValue::Null),
            ),
            Value::Str(s) => Some(JsonValue::String(s.clone())),
            Value::List(items) => {
                let key = (addr(items), 0);
                if walk.on_path(key) {
                    return None;
                }
                let items = lock(items).clone();
                walk.path.push(key);
                let array = items
                    .iter()
                    .map(|item| item.to_json_in(walk))
                    .collect::<Option<Vec<_>>>()
                    .map(JsonValue::Array);
                walk.path.pop();
                array
            }
            Value::Map(entries) => {
                let key = (addr(entries), 0);
                if walk.on_path(key) {
                    return None;
                }
                let entries = lock(entries).clone();
                walk.path.push(key);
                let mut object = serde_json::Map::new();
                for (name, value) in &entries {
                    let Some(value) = value.to_json_in(walk) else {
                        walk.path.pop();
                        return None;
                    };
                    object.insert(name.clone(), value);
                }
                walk.path.pop();
                Some(JsonValue::Object(object))
            }
            Value::Range { start, stop, step } => {
                let len = usize::try_from(range_len(*start, *stop, *step)).unwrap_or(0);
                if len > walk.remaining {
                    return None;
                }
                walk.remaining -= len;
                Some(JsonValue::Array(
                    RangeIter::new(*start, *stop, *step)
                        .map(JsonValue::from)
                        .collect(),
                ))
            }
            Value::Exception(info) => serde_json::to_value(info).ok(),
            Value::Function(_) | Value::Builtin(_) | Value::Namespace(_) => None,
        }
    }

    pub fn from_json(json: &JsonValue) -> Value {
        match json {
            JsonValue::Null => Value::None,
            JsonValue::Bool(b) => Value::Bool(*b),
            JsonValue::Number(n) => match n.as_i64() {
                Some(v) => Value::Int(v),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            JsonValue::String(s) => Value::Str(s.clone()),
            JsonValue::Array(items) => Value::list(items.iter().map(Value::from_json).collect()),
            JsonValue::Object(object) => Value::map(
                object
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        self.write_display(&mut out, &mut Walk::new());
        f.write_str(&out)
    }
}

fn format_float(v: f64) -> String {
    if v.is_finite() && v.fract() == 0.0 && v.abs() < 1e16 {
        format!("{:.1}", v)
    } else if v.is_nan() {
        "nan".to_string()
    } else if v.is_infinite() {
        if v > 0.0 { "inf" } else { "-inf" }.to_string()
    } else {
        v.to_string()
    }
}

pub(crate) fn range_len(start: i64, stop: i64, step: i64) -> i64 {
    if step > 0 && start < stop {
        ((stop as i128 - start as i128 + step as i128 - 1) / step as i128) as i64
    } else if step < 0 && start > stop {
        ((start as i128 - stop as i128 - step as i128 - 1) / (-(step as i128))) as i64
    } else {
        0
    }
}

/// Lazy iterator over a `range` value.
pub(crate) struct RangeIter {
    next: i64,
    stop: i64,
    step: i64,
    done: bool,
}

impl RangeIter {
    pub(crate) fn new(start: i64, stop: i64, step: i64) -> Self {
        Self {
            next: start,
            stop,
            step,
            done: range_len(start, stop, step) == 0,
        }
    }
}

impl Iterator for RangeIter {
    type Item = i64;

    fn next(&mut self) -> Option<i64> {
        if self.done {
            return None;
        }
        let current = self.next;
        let in_range = if self.step > 0 {
            current < self.stop
        } else {
            current > self.stop
        };
        if !in_range {
            self.done = true;
            return None;
        }
        match current.checked_add(self.step) {
            Some(next) => self.next = next,
            None => self.done = true,
        }
        Some(current)
    }
}
