//! Tree-walking evaluator.
//!
//! Name resolution goes local scope, defining scope, global namespace, then
//! builtins. The cancellation handle is polled before every statement and on
//! every loop iteration; a tripped handle unwinds with
//! [`ScriptError::Interrupt`].

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::ast::{BinOp, CmpOp, Expr, Program, Stmt, StmtKind, Target, UnaryOp};
use super::builtins::Builtin;
use super::exception::{Exception, ExceptionInfo, ScriptError, TraceFrame};
use super::value::{Function, RangeIter, Value, lock, range_len};
use crate::execute::{AbortHandle, ScriptIo};
use crate::namespace::Namespace;

pub(crate) type Exec<T> = Result<T, ScriptError>;

/// Maximum call depth, counting the top-level frame.
pub const MAX_DEPTH: usize = 200;

/// Largest sequence that `*` may build.
const MAX_REPEAT_LEN: usize = 1 << 24;

enum Flow {
    Normal,
    Break,
    Continue,
    Return(Value),
}

struct Scope {
    locals: Namespace,
    env: Option<Namespace>,
}

#[derive(Clone, Copy)]
enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    fn of(value: &Value) -> Option<Num> {
        match value {
            Value::Bool(b) => Some(Num::Int(*b as i64)),
            Value::Int(v) => Some(Num::Int(*v)),
            Value::Float(v) => Some(Num::Float(*v)),
            _ => None,
        }
    }

    fn as_f64(self) -> f64 {
        match self {
            Num::Int(v) => v as f64,
            Num::Float(v) => v,
        }
    }
}

pub struct Interpreter<'a> {
    globals: Namespace,
    io: &'a dyn ScriptIo,
    abort: &'a AbortHandle,
    /// Active call stack, outermost first. The line of each frame is the
    /// statement currently executing in it.
    frames: Vec<TraceFrame>,
}

impl<'a> Interpreter<'a> {
    pub fn new(globals: Namespace, io: &'a dyn ScriptIo, abort: &'a AbortHandle) -> Self {
        Self {
            globals,
            io,
            abort,
            frames: Vec::new(),
        }
    }

    pub fn io(&self) -> &'a dyn ScriptIo {
        self.io
    }

    pub fn abort(&self) -> &'a AbortHandle {
        self.abort
    }

    /// Build an exception carrying the current call stack.
    pub fn raise(&self, kind: &str, message: impl Into<String>) -> ScriptError {
        self.raise_info(ExceptionInfo::new(kind, message))
    }

    fn raise_info(&self, info: ExceptionInfo) -> ScriptError {
        ScriptError::Raised(Exception::new(info, self.frames.clone()))
    }

    fn checkpoint(&self) -> Exec<()> {
        if self.abort.is_aborted() {
            Err(ScriptError::Interrupt)
        } else {
            Ok(())
        }
    }

    /// Execute a whole program with `locals` as its top-level scope.
    pub fn run_program(&mut self, program: &Program, locals: &Namespace) -> Exec<()> {
        let scope = Scope {
            locals: locals.clone(),
            env: None,
        };
        self.frames.push(TraceFrame {
            filename: program.filename.clone(),
            line: 0,
            function: "<script>".to_string(),
        });
        let result = self.exec_block(&program.body, &scope);
        self.frames.pop();
        result.map(|_| ())
    }

    fn exec_block(&mut self, body: &[Stmt], scope: &Scope) -> Exec<Flow> {
        for stmt in body {
            match self.exec_stmt(stmt, scope)? {
                Flow::Normal => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_stmt(&mut self, stmt: &Stmt, scope: &Scope) -> Exec<Flow> {
        self.checkpoint()?;
        if let Some(frame) = self.frames.last_mut() {
            frame.line = stmt.line;
        }

        match &stmt.kind {
            StmtKind::Expr(expr) => {
                self.eval(expr, scope)?;
            }
            StmtKind::Assign { target, value } => {
                let value = self.eval(value, scope)?;
                self.assign(target, value, scope)?;
            }
            StmtKind::AugAssign { target, op, value } => {
                self.aug_assign(target, *op, value, scope)?
            }
            StmtKind::Pass => {}
            StmtKind::Break => return Ok(Flow::Break),
            StmtKind::Continue => return Ok(Flow::Continue),
            StmtKind::If { branches, orelse } => {
                for (cond, body) in branches {
                    if self.eval(cond, scope)?.is_truthy() {
                        return self.exec_block(body, scope);
                    }
                }
                return self.exec_block(orelse, scope);
            }
            StmtKind::While { cond, body } => loop {
                self.checkpoint()?;
                if !self.eval(cond, scope)?.is_truthy() {
                    break;
                }
                match self.exec_block(body, scope)? {
                    Flow::Break => break,
                    Flow::Normal | Flow::Continue => {}
                    ret @ Flow::Return(_) => return Ok(ret),
                }
            },
            StmtKind::For { var, iter, body } => {
                let iterable = self.eval(iter, scope)?;
                for item in self.iterate(&iterable)? {
                    self.checkpoint()?;
                    scope.locals.set(var.clone(), item);
                    match self.exec_block(body, scope)? {
                        Flow::Break => break,
                        Flow::Normal | Flow::Continue => {}
                        ret @ Flow::Return(_) => return Ok(ret),
                    }
                }
            }
            StmtKind::Def(def) => {
                let function = Function {
                    def: Arc::clone(def),
                    env: scope.locals.clone(),
                };
                scope
                    .locals
                    .set(def.name.clone(), Value::Function(Arc::new(function)));
            }
            StmtKind::Return(value) => {
                let value = match value {
                    Some(expr) => self.eval(expr, scope)?,
                    None => Value::None,
                };
                return Ok(Flow::Return(value));
            }
            StmtKind::Raise(expr) => {
                let raised = self.eval(expr, scope)?;
                return Err(match raised {
                    Value::Exception(info) => self.raise_info(info),
                    Value::Builtin(Builtin::Exception(kind)) => self.raise(kind, ""),
                    other => self.raise(
                        "TypeError",
                        format!("cannot raise a value of type '{}'", other.type_name()),
                    ),
                });
            }
            StmtKind::Del(name) => {
                if scope.locals.remove(name).is_none() {
                    return Err(self.name_error(name));
                }
            }
        }
        Ok(Flow::Normal)
    }

    fn iterate(&self, iterable: &Value) -> Exec<Box<dyn Iterator<Item = Value>>> {
        let items: Box<dyn Iterator<Item = Value>> = match iterable {
            Value::Range { start, stop, step } => {
                Box::new(RangeIter::new(*start, *stop, *step).map(Value::Int))
            }
            Value::List(items) => Box::new(lock(items).clone().into_iter()),
            Value::Str(s) => Box::new(
                s.chars()
                    .map(|c| Value::Str(c.to_string()))
                    .collect::<Vec<_>>()
                    .into_iter(),
            ),
            Value::Map(entries) => Box::new(
                lock(entries)
                    .keys()
                    .cloned()
                    .map(Value::Str)
                    .collect::<Vec<_>>()
                    .into_iter(),
            ),
            Value::Namespace(ns) => Box::new(ns.keys().into_iter().map(Value::Str)),
            other => {
                return Err(self.raise(
                    "TypeError",
                    format!("'{}' object is not iterable", other.type_name()),
                ));
            }
        };
        Ok(items)
    }

    fn assign(&mut self, target: &Target, value: Value, scope: &Scope) -> Exec<()> {
        match target {
            Target::Name(name) => {
                scope.locals.set(name.clone(), value);
                Ok(())
            }
            Target::Index { object, index } => {
                let object = self.eval(object, scope)?;
                let key = self.eval(index, scope)?;
                self.set_item(&object, key, value)
            }
            Target::Attr { object, name } => {
                let object = self.eval(object, scope)?;
                self.set_attr(&object, name, value)
            }
        }
    }

    fn aug_assign(&mut self, target: &Target, op: BinOp, value: &Expr, scope: &Scope) -> Exec<()> {
        match target {
            Target::Name(name) => {
                let current = self.lookup(name, scope)?;
                let rhs = self.eval(value, scope)?;
                let updated = self.binary(op, &current, &rhs)?;
                scope.locals.set(name.clone(), updated);
            }
            Target::Index { object, index } => {
                let object = self.eval(object, scope)?;
                let key = self.eval(index, scope)?;
                let current = self.get_item(&object, &key)?;
                let rhs = self.eval(value, scope)?;
                let updated = self.binary(op, &current, &rhs)?;
                self.set_item(&object, key, updated)?;
            }
            Target::Attr { object, name } => {
                let object = self.eval(object, scope)?;
                let current = self.get_attr(&object, name)?;
                let rhs = self.eval(value, scope)?;
                let updated = self.binary(op, &current, &rhs)?;
                self.set_attr(&object, name, updated)?;
            }
        }
        Ok(())
    }

    fn name_error(&self, name: &str) -> ScriptError {
        self.raise("NameError", format!("name '{}' is not defined", name))
    }

    fn lookup(&self, name: &str, scope: &Scope) -> Exec<Value> {
        if let Some(value) = scope.locals.get(name) {
            return Ok(value);
        }
        if let Some(value) = scope.env.as_ref().and_then(|env| env.get(name)) {
            return Ok(value);
        }
        if let Some(value) = self.globals.get(name) {
            return Ok(value);
        }
        if name == "globals" {
            return Ok(Value::Namespace(self.globals.clone()));
        }
        Builtin::lookup(name)
            .map(Value::Builtin)
            .ok_or_else(|| self.name_error(name))
    }

    fn eval(&mut self, expr: &Expr, scope: &Scope) -> Exec<Value> {
        match expr {
            Expr::None => Ok(Value::None),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Int(v) => Ok(Value::Int(*v)),
            Expr::Float(v) => Ok(Value::Float(*v)),
            Expr::Str(s) => Ok(Value::Str(s.clone())),
            Expr::Name(name) => self.lookup(name, scope),
            Expr::List(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.eval(item, scope)?);
                }
                Ok(Value::list(values))
            }
            Expr::Map(entries) => {
                let mut map = BTreeMap::new();
                for (key, value) in entries {
                    let key = match self.eval(key, scope)? {
                        Value::Str(key) => key,
                        other => return Err(self.key_type_error(&other)),
                    };
                    let value = self.eval(value, scope)?;
                    map.insert(key, value);
                }
                Ok(Value::map(map))
            }
            Expr::Unary { op, operand } => {
                let operand = self.eval(operand, scope)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!operand.is_truthy())),
                    UnaryOp::Neg => match Num::of(&operand) {
                        Some(Num::Int(v)) => v
                            .checked_neg()
                            .map(Value::Int)
                            .ok_or_else(|| self.overflow()),
                        Some(Num::Float(v)) => Ok(Value::Float(-v)),
                        None => Err(self.raise(
                            "TypeError",
                            format!("bad operand type for unary -: '{}'", operand.type_name()),
                        )),
                    },
                }
            }
            Expr::Binary { op, left, right } => {
                let left = self.eval(left, scope)?;
                let right = self.eval(right, scope)?;
                self.binary(*op, &left, &right)
            }
            Expr::Compare { op, left, right } => {
                let left = self.eval(left, scope)?;
                let right = self.eval(right, scope)?;
                self.compare_op(*op, &left, &right).map(Value::Bool)
            }
            Expr::And(left, right) => {
                let left = self.eval(left, scope)?;
                if left.is_truthy() {
                    self.eval(right, scope)
                } else {
                    Ok(left)
                }
            }
            Expr::Or(left, right) => {
                let left = self.eval(left, scope)?;
                if left.is_truthy() {
                    Ok(left)
                } else {
                    self.eval(right, scope)
                }
            }
            Expr::Call { func, args } => {
                if let Expr::Attr { object, name } = func.as_ref() {
                    let receiver = self.eval(object, scope)?;
                    let args = self.eval_args(args, scope)?;
                    if let Some(result) = self.call_method(&receiver, name, &args) {
                        return result;
                    }
                    let callee = self.get_attr(&receiver, name)?;
                    return self.call_value(callee, args);
                }
                let callee = self.eval(func, scope)?;
                let args = self.eval_args(args, scope)?;
                self.call_value(callee, args)
            }
            Expr::Index { object, index } => {
                let object = self.eval(object, scope)?;
                let index = self.eval(index, scope)?;
                self.get_item(&object, &index)
            }
            Expr::Attr { object, name } => {
                let object = self.eval(object, scope)?;
                self.get_attr(&object, name)
            }
        }
    }

    fn eval_args(&mut self, args: &[Expr], scope: &Scope) -> Exec<Vec<Value>> {
        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            values.push(self.eval(arg, scope)?);
        }
        Ok(values)
    }

    fn call_value(&mut self, callee: Value, args: Vec<Value>) -> Exec<Value> {
        match callee {
            Value::Builtin(builtin) => builtin.call(self, args),
            Value::Function(function) => self.call_function(&function, args),
            other => Err(self.raise(
                "TypeError",
                format!("'{}' object is not callable", other.type_name()),
            )),
        }
    }

    fn call_function(&mut self, function: &Function, args: Vec<Value>) -> Exec<Value> {
        let def = &function.def;
        if args.len() != def.params.len() {
            return Err(self.raise(
                "TypeError",
                format!(
                    "{}() takes {} arguments but {} were given",
                    def.name,
                    def.params.len(),
                    args.len()
                ),
            ));
        }
        if self.frames.len() >= MAX_DEPTH {
            return Err(self.raise("RecursionError", "maximum recursion depth exceeded"));
        }

        let locals = Namespace::new();
        for (param, arg) in def.params.iter().zip(args) {
            locals.set(param.clone(), arg);
        }
        let scope = Scope {
            locals,
            env: Some(function.env.clone()),
        };

        self.frames.push(TraceFrame {
            filename: def.filename.clone(),
            line: def.line,
            function: def.name.clone(),
        });
        let result = self.exec_block(&def.body, &scope);
        self.frames.pop();

        match result? {
            Flow::Return(value) => Ok(value),
            _ => Ok(Value::None),
        }
    }

    /// Methods on container values. `None` means the receiver has no such
    /// method and the attribute should be resolved normally.
    fn call_method(&self, receiver: &Value, name: &str, args: &[Value]) -> Option<Exec<Value>> {
        let result = match (receiver, name, args) {
            (Value::List(items), "append", [item]) => {
                lock(items).push(item.clone());
                Ok(Value::None)
            }
            (Value::List(items), "pop", []) => lock(items)
                .pop()
                .ok_or_else(|| self.raise("IndexError", "pop from empty list")),
            (Value::Map(entries), "keys", []) => Ok(Value::list(
                lock(entries).keys().cloned().map(Value::Str).collect(),
            )),
            (Value::Map(entries), "get", [Value::Str(key)]) => {
                Ok(lock(entries).get(key).cloned().unwrap_or(Value::None))
            }
            (Value::Map(entries), "get", [Value::Str(key), default]) => {
                Ok(lock(entries).get(key).cloned().unwrap_or_else(|| default.clone()))
            }
            (Value::Str(s), "upper", []) => Ok(Value::Str(s.to_uppercase())),
            (Value::Str(s), "lower", []) => Ok(Value::Str(s.to_lowercase())),
            (Value::Str(s), "strip", []) => Ok(Value::str(s.trim())),
            (Value::Str(s), "split", []) => Ok(Value::list(
                s.split_whitespace().map(Value::str).collect(),
            )),
            (Value::Str(s), "split", [Value::Str(sep)]) if !sep.is_empty() => {
                Ok(Value::list(s.split(sep.as_str()).map(Value::str).collect()))
            }
            (Value::Str(sep), "join", [Value::List(items)]) => {
                let items = lock(items).clone();
                let mut parts = Vec::with_capacity(items.len());
                for item in &items {
                    match item {
                        Value::Str(part) => parts.push(part.clone()),
                        other => {
                            return Some(Err(self.raise(
                                "TypeError",
                                format!("join() expected str, found '{}'", other.type_name()),
                            )));
                        }
                    }
                }
                Ok(Value::Str(parts.join(sep)))
            }
            _ => return None,
        };
        Some(result)
    }

    fn attribute_error(&self, object: &Value, name: &str) -> ScriptError {
        self.raise(
            "AttributeError",
            format!("'{}' object has no attribute '{}'", object.type_name(), name),
        )
    }

    fn get_attr(&self, object: &Value, name: &str) -> Exec<Value> {
        match (object, name) {
            (Value::Namespace(ns), _) => ns
                .get(name)
                .ok_or_else(|| self.attribute_error(object, name)),
            (Value::Exception(info), "kind") => Ok(Value::Str(info.kind.clone())),
            (Value::Exception(info), "message") => Ok(Value::Str(info.message.clone())),
            _ => Err(self.attribute_error(object, name)),
        }
    }

    fn set_attr(&self, object: &Value, name: &str, value: Value) -> Exec<()> {
        match object {
            Value::Namespace(ns) => {
                ns.set(name, value);
                Ok(())
            }
            _ => Err(self.attribute_error(object, name)),
        }
    }

    fn key_type_error(&self, key: &Value) -> ScriptError {
        self.raise(
            "TypeError",
            format!("keys must be str, not '{}'", key.type_name()),
        )
    }

    fn key_error(&self, key: &str) -> ScriptError {
        self.raise("KeyError", Value::str(key).repr())
    }

    /// Resolve a possibly negative sequence index.
    fn sequence_index(&self, container: &Value, index: &Value, len: usize) -> Exec<usize> {
        let Some(raw) = index.as_i64() else {
            return Err(self.raise(
                "TypeError",
                format!(
                    "{} indices must be integers, not '{}'",
                    container.type_name(),
                    index.type_name()
                ),
            ));
        };
        let resolved = if raw < 0 { raw + len as i64 } else { raw };
        if resolved < 0 || resolved >= len as i64 {
            return Err(self.raise(
                "IndexError",
                format!("{} index out of range", container.type_name()),
            ));
        }
        Ok(resolved as usize)
    }

    fn get_item(&self, object: &Value, index: &Value) -> Exec<Value> {
        match object {
            Value::List(items) => {
                let items = lock(items);
                let i = self.sequence_index(object, index, items.len())?;
                Ok(items[i].clone())
            }
            Value::Str(s) => {
                let chars: Vec<char> = s.chars().collect();
                let i = self.sequence_index(object, index, chars.len())?;
                Ok(Value::Str(chars[i].to_string()))
            }
            Value::Range { start, stop, step } => {
                let len = range_len(*start, *stop, *step);
                let i = self.sequence_index(object, index, len.max(0) as usize)?;
                Ok(Value::Int(start + step * i as i64))
            }
            Value::Map(entries) => match index {
                Value::Str(key) => lock(entries)
                    .get(key)
                    .cloned()
                    .ok_or_else(|| self.key_error(key)),
                other => Err(self.key_type_error(other)),
            },
            Value::Namespace(ns) => match index {
                Value::Str(key) => ns.get(key).ok_or_else(|| self.key_error(key)),
                other => Err(self.key_type_error(other)),
            },
            other => Err(self.raise(
                "TypeError",
                format!("'{}' object is not subscriptable", other.type_name()),
            )),
        }
    }

    fn set_item(&self, object: &Value, index: Value, value: Value) -> Exec<()> {
        match object {
            Value::List(items) => {
                let mut items = lock(items);
                let i = self.sequence_index(object, &index, items.len())?;
                items[i] = value;
                Ok(())
            }
            Value::Map(entries) => match index {
                Value::Str(key) => {
                    lock(entries).insert(key, value);
                    Ok(())
                }
                other => Err(self.key_type_error(&other)),
            },
            Value::Namespace(ns) => match index {
                Value::Str(key) => {
                    ns.set(key, value);
                    Ok(())
                }
                other => Err(self.key_type_error(&other)),
            },
            other => Err(self.raise(
                "TypeError",
                format!(
                    "'{}' object does not support item assignment",
                    other.type_name()
                ),
            )),
        }
    }

    fn overflow(&self) -> ScriptError {
        self.raise("OverflowError", "integer overflow")
    }

    fn zero_division(&self, message: &str) -> ScriptError {
        self.raise("ZeroDivisionError", message)
    }

    pub(crate) fn binary(&self, op: BinOp, left: &Value, right: &Value) -> Exec<Value> {
        match (op, left, right) {
            (BinOp::Add, Value::Str(a), Value::Str(b)) => Ok(Value::Str(format!("{}{}", a, b))),
            (BinOp::Add, Value::List(a), Value::List(b)) => {
                let mut items = lock(a).clone();
                let tail = lock(b).clone();
                items.extend(tail);
                Ok(Value::list(items))
            }
            (BinOp::Mul, Value::Str(s), Value::Int(n))
            | (BinOp::Mul, Value::Int(n), Value::Str(s)) => {
                let count = (*n).max(0) as usize;
                if s.len().saturating_mul(count) > MAX_REPEAT_LEN {
                    return Err(self.raise("OverflowError", "repeated string is too long"));
                }
                Ok(Value::Str(s.repeat(count)))
            }
            (BinOp::Mul, Value::List(items), Value::Int(n))
            | (BinOp::Mul, Value::Int(n), Value::List(items)) => {
                let count = (*n).max(0) as usize;
                let items = lock(items).clone();
                if items.len().saturating_mul(count) > MAX_REPEAT_LEN {
                    return Err(self.raise("OverflowError", "repeated list is too long"));
                }
                let mut out = Vec::with_capacity(items.len() * count);
                for _ in 0..count {
                    out.extend(items.iter().cloned());
                }
                Ok(Value::list(out))
            }
            _ => match (Num::of(left), Num::of(right)) {
                (Some(Num::Int(a)), Some(Num::Int(b))) => self.int_arith(op, a, b),
                (Some(a), Some(b)) => self.float_arith(op, a.as_f64(), b.as_f64()),
                _ => Err(self.raise(
                    "TypeError",
                    format!(
                        "unsupported operand type(s) for {}: '{}' and '{}'",
                        op.symbol(),
                        left.type_name(),
                        right.type_name()
                    ),
                )),
            },
        }
    }

    fn int_arith(&self, op: BinOp, a: i64, b: i64) -> Exec<Value> {
        let value = match op {
            BinOp::Add => a.checked_add(b).ok_or_else(|| self.overflow())?,
            BinOp::Sub => a.checked_sub(b).ok_or_else(|| self.overflow())?,
            BinOp::Mul => a.checked_mul(b).ok_or_else(|| self.overflow())?,
            BinOp::Div => {
                if b == 0 {
                    return Err(self.zero_division("division by zero"));
                }
                return Ok(Value::Float(a as f64 / b as f64));
            }
            BinOp::FloorDiv => {
                if b == 0 {
                    return Err(self.zero_division("integer division or modulo by zero"));
                }
                let q = a.checked_div(b).ok_or_else(|| self.overflow())?;
                if a % b != 0 && ((a < 0) != (b < 0)) {
                    q - 1
                } else {
                    q
                }
            }
            BinOp::Mod => {
                if b == 0 {
                    return Err(self.zero_division("integer division or modulo by zero"));
                }
                let r = a.wrapping_rem(b);
                if r != 0 && ((r < 0) != (b < 0)) { r + b } else { r }
            }
            BinOp::Pow => {
                if b < 0 {
                    if a == 0 {
                        return Err(self.zero_division("0 cannot be raised to a negative power"));
                    }
                    return Ok(Value::Float((a as f64).powf(b as f64)));
                }
                u32::try_from(b)
                    .ok()
                    .and_then(|exp| a.checked_pow(exp))
                    .ok_or_else(|| self.overflow())?
            }
        };
        Ok(Value::Int(value))
    }

    fn float_arith(&self, op: BinOp, a: f64, b: f64) -> Exec<Value> {
        let value = match op {
            BinOp::Add => a + b,
            BinOp::Sub => a - b,
            BinOp::Mul => a * b,
            BinOp::Div => {
                if b == 0.0 {
                    return Err(self.zero_division("float division by zero"));
                }
                a / b
            }
            BinOp::FloorDiv => {
                if b == 0.0 {
                    return Err(self.zero_division("float floor division by zero"));
                }
                (a / b).floor()
            }
            BinOp::Mod => {
                if b == 0.0 {
                    return Err(self.zero_division("float modulo"));
                }
                let r = a % b;
                if r != 0.0 && ((r < 0.0) != (b < 0.0)) { r + b } else { r }
            }
            BinOp::Pow => {
                if a == 0.0 && b < 0.0 {
                    return Err(self.zero_division("0.0 cannot be raised to a negative power"));
                }
                a.powf(b)
            }
        };
        Ok(Value::Float(value))
    }

    fn ordering(&self, left: &Value, right: &Value, symbol: &str) -> Exec<Option<Ordering>> {
        match (left, right) {
            (Value::Str(a), Value::Str(b)) => Ok(Some(a.cmp(b))),
            _ => match (Num::of(left), Num::of(right)) {
                (Some(Num::Int(a)), Some(Num::Int(b))) => Ok(Some(a.cmp(&b))),
                (Some(a), Some(b)) => Ok(a.as_f64().partial_cmp(&b.as_f64())),
                _ => Err(self.raise(
                    "TypeError",
                    format!(
                        "'{}' not supported between instances of '{}' and '{}'",
                        symbol,
                        left.type_name(),
                        right.type_name()
                    ),
                )),
            },
        }
    }

    /// Total order used by `min` and `max`.
    pub(crate) fn compare(&self, left: &Value, right: &Value, symbol: &str) -> Exec<Ordering> {
        Ok(self.ordering(left, right, symbol)?.unwrap_or(Ordering::Equal))
    }

    fn compare_op(&self, op: CmpOp, left: &Value, right: &Value) -> Exec<bool> {
        let result = match op {
            CmpOp::Eq => left.equals(right),
            CmpOp::NotEq => !left.equals(right),
            CmpOp::In => self.contains(right, left)?,
            CmpOp::NotIn => !self.contains(right, left)?,
            CmpOp::Lt => matches!(self.ordering(left, right, "<")?, Some(Ordering::Less)),
            CmpOp::Le => matches!(
                self.ordering(left, right, "<=")?,
                Some(Ordering::Less | Ordering::Equal)
            ),
            CmpOp::Gt => matches!(self.ordering(left, right, ">")?, Some(Ordering::Greater)),
            CmpOp::Ge => matches!(
                self.ordering(left, right, ">=")?,
                Some(Ordering::Greater | Ordering::Equal)
            ),
        };
        Ok(result)
    }

    fn contains(&self, container: &Value, item: &Value) -> Exec<bool> {
        match container {
            Value::List(items) => {
                let items = lock(items).clone();
                Ok(items.iter().any(|candidate| candidate.equals(item)))
            }
            Value::Str(s) => match item {
                Value::Str(needle) => Ok(s.contains(needle.as_str())),
                other => Err(self.raise(
                    "TypeError",
                    format!(
                        "'in <str>' requires str as left operand, not '{}'",
                        other.type_name()
                    ),
                )),
            },
            Value::Map(entries) => Ok(match item {
                Value::Str(key) => lock(entries).contains_key(key),
                _ => false,
            }),
            Value::Namespace(ns) => Ok(match item {
                Value::Str(key) => ns.contains(key),
                _ => false,
            }),
            Value::Range { start, stop, step } => Ok(match item.as_i64() {
                Some(v) => {
                    let within = if *step > 0 {
                        v >= *start && v < *stop
                    } else {
                        v <= *start && v > *stop
                    };
                    within && (v as i128 - *start as i128) % (*step as i128) == 0
                }
                None => false,
            }),
            other => Err(self.raise(
                "TypeError",
                format!("argument of type '{}' is not iterable", other.type_name()),
            )),
        }
    }
}
